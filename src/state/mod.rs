/*
Durable poller state: the id of the last notification delivered downstream.

The cursor is the only thing the agent persists. It is written atomically
(temp file, fsync, rename) so a crash mid-write leaves the previous cursor
intact, and it is flushed on an interval rather than per notification so a
burst of deliveries does not turn into a burst of disk writes.
*/

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const STATE_VERSION: &str = "1.0";

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state file i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("state file is not valid: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    #[serde(default)]
    version: String,
    last_notification_id: u64,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

/// Crash-consistent storage for the notification cursor.
pub struct CursorStore {
    path: PathBuf,
    // Serializes writers; the periodic flush and the shutdown flush may race.
    write_lock: Mutex<()>,
}

impl CursorStore {
    /// Open the store at `path`, creating the parent directory and an
    /// initial zero-cursor file when none exists. Returns the store and
    /// the loaded cursor.
    pub fn open(path: impl Into<PathBuf>) -> Result<(Self, u64), StateError> {
        let store = Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        };

        if let Some(parent) = store.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let cursor = match fs::read(&store.path) {
            Ok(bytes) => serde_json::from_slice::<PersistedState>(&bytes)?.last_notification_id,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                store.save(0)?;
                0
            }
            Err(err) => return Err(err.into()),
        };

        Ok((store, cursor))
    }

    /// Persist `cursor` atomically: write a sibling temp file, fsync it,
    /// then rename over the target.
    pub fn save(&self, cursor: u64) -> Result<(), StateError> {
        let _guard = match self.write_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let bytes = serde_json::to_vec_pretty(&PersistedState {
            version: STATE_VERSION.to_string(),
            last_notification_id: cursor,
            updated_at: Some(Utc::now()),
        })?;

        let tmp = tmp_path(&self.path);
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        Ok(())
    }

    #[cfg(test)]
    fn path(&self) -> &Path {
        &self.path
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// In-memory cursor shared by the notification poller, flushed to the
/// [CursorStore] on an interval. Writes are deduplicated: an unchanged
/// cursor never touches the disk.
pub struct PeriodicSaver {
    store: CursorStore,
    current: AtomicU64,
    last_saved: AtomicU64,
}

impl PeriodicSaver {
    pub fn new(store: CursorStore, initial: u64) -> Self {
        Self {
            store,
            current: AtomicU64::new(initial),
            last_saved: AtomicU64::new(initial),
        }
    }

    pub fn cursor(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    /// Advance the cursor to `id`. The cursor is monotonic; an id at or
    /// below the current value is a no-op.
    pub fn advance(&self, id: u64) {
        self.current.fetch_max(id, Ordering::SeqCst);
    }

    /// Write the cursor through to disk if it moved since the last flush.
    pub fn flush(&self) -> Result<(), StateError> {
        let cursor = self.current.load(Ordering::SeqCst);
        if cursor == self.last_saved.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.store.save(cursor)?;
        self.last_saved.store(cursor, Ordering::SeqCst);
        debug!(cursor, "notification cursor persisted");
        Ok(())
    }

    /// Flush on `interval` until `shutdown` fires, then do a final flush so
    /// no delivered notification is replayed on the next start. Flush
    /// failures mid-run are logged and retried on the next tick; only the
    /// final flush error propagates.
    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> Result<(), StateError> {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    return flush_blocking(self.clone()).await;
                }
                _ = ticker.tick() => {
                    if let Err(err) = flush_blocking(self.clone()).await {
                        warn!("failed to persist notification cursor: {err}");
                    }
                }
            }
        }
    }
}

/// [PeriodicSaver::flush] routed off the async runtime; the write is small
/// but fsync can stall on slow flash.
async fn flush_blocking(saver: Arc<PeriodicSaver>) -> Result<(), StateError> {
    match tokio::task::spawn_blocking(move || saver.flush()).await {
        Ok(result) => result,
        Err(err) => Err(StateError::Io(std::io::Error::other(err))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_directory_and_zero_cursor() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("conf").join("state.json");

        let (store, cursor) = CursorStore::open(&path).unwrap();
        assert_eq!(cursor, 0);
        assert!(store.path().exists());

        let raw = std::fs::read_to_string(&path).unwrap();
        let state: PersistedState = serde_json::from_str(&raw).unwrap();
        assert_eq!(state.last_notification_id, 0);
    }

    #[test]
    fn save_and_reload_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        let (store, _) = CursorStore::open(&path).unwrap();
        store.save(42).unwrap();

        let (_, cursor) = CursorStore::open(&path).unwrap();
        assert_eq!(cursor, 42);
    }

    #[test]
    fn save_leaves_no_temp_file_behind() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        let (store, _) = CursorStore::open(&path).unwrap();
        store.save(7).unwrap();

        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn crash_before_rename_keeps_the_previous_cursor() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        let (store, _) = CursorStore::open(&path).unwrap();
        store.save(42).unwrap();

        // A crash between the temp-file write and the rename leaves a
        // stale (possibly truncated) temp file next to the real one.
        std::fs::write(tmp_path(&path), "{\"last_notification_").unwrap();

        let (_, cursor) = CursorStore::open(&path).unwrap();
        assert_eq!(cursor, 42);

        // A later save completes the protocol and replaces the leftovers.
        store.save(43).unwrap();
        assert!(!tmp_path(&path).exists());
        let (_, cursor) = CursorStore::open(&path).unwrap();
        assert_eq!(cursor, 43);
    }

    #[test]
    fn corrupt_state_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(matches!(
            CursorStore::open(&path),
            Err(StateError::Serde(_))
        ));
    }

    #[test]
    fn advance_is_monotonic() {
        let dir = tempdir().unwrap();
        let (store, cursor) = CursorStore::open(dir.path().join("state.json")).unwrap();
        let saver = PeriodicSaver::new(store, cursor);

        saver.advance(10);
        saver.advance(3);
        assert_eq!(saver.cursor(), 10);

        saver.advance(11);
        assert_eq!(saver.cursor(), 11);
    }

    #[test]
    fn flush_skips_unchanged_cursor() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let (store, cursor) = CursorStore::open(&path).unwrap();
        let saver = PeriodicSaver::new(store, cursor);

        saver.advance(5);
        saver.flush().unwrap();

        // Remove the file out from under the saver: a deduplicated flush
        // must not recreate it.
        std::fs::remove_file(&path).unwrap();
        saver.flush().unwrap();
        assert!(!path.exists());

        saver.advance(6);
        saver.flush().unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn run_flushes_on_shutdown() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let (store, cursor) = CursorStore::open(&path).unwrap();
        let saver = std::sync::Arc::new(PeriodicSaver::new(store, cursor));

        let shutdown = CancellationToken::new();
        let task = tokio::spawn({
            let saver = saver.clone();
            let shutdown = shutdown.clone();
            async move { saver.run(Duration::from_secs(3600), shutdown).await }
        });

        saver.advance(99);
        shutdown.cancel();
        task.await.unwrap().unwrap();

        let (_, reloaded) = CursorStore::open(&path).unwrap();
        assert_eq!(reloaded, 99);
    }
}
