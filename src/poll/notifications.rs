//! Notification polling. The device returns its log newest-first; delivery
//! happens oldest-first so the cursor only ever moves forward past entries
//! that actually reached the log store.
//!
//! The cursor advances per delivered entry, not per batch. On a sink
//! failure the rest of the batch is abandoned and the tick fails; the
//! undelivered entries are still above the cursor and will be picked up
//! again on a later tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::device::{Notification, Session};
use crate::sink::{LogEntry, LogSink};
use crate::state::PeriodicSaver;

use super::PollError;

const SOURCE: &str = "ups-agent";
const DATE_FORMAT: &str = "%d/%m/%Y %H:%M:%S";

pub struct NotificationPoller {
    session: Arc<Session>,
    sink: Box<dyn LogSink>,
    saver: Arc<PeriodicSaver>,
    interval: Duration,
    device_address: String,
}

impl NotificationPoller {
    pub fn new(
        session: Arc<Session>,
        sink: Box<dyn LogSink>,
        saver: Arc<PeriodicSaver>,
        interval: Duration,
        device_address: String,
    ) -> Self {
        Self {
            session,
            sink,
            saver,
            interval,
            device_address,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<(), PollError> {
        let result = self.poll_loop(&shutdown).await;

        if let Err(err) = self.sink.close().await {
            warn!("error closing log sink: {err}");
        }

        result
    }

    async fn poll_loop(&self, shutdown: &CancellationToken) -> Result<(), PollError> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; wait a full interval instead.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("stopping notification poller");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            let notifications = self.session.notifications().await?;
            self.deliver_batch(&notifications).await?;
        }
    }

    /// Deliver every entry above the cursor, oldest first, advancing the
    /// cursor after each successful write.
    async fn deliver_batch(&self, notifications: &[Notification]) -> Result<(), PollError> {
        let cursor = self.saver.cursor();
        debug!(cursor, batch = notifications.len(), "delivering notifications above cursor");

        for notification in notifications.iter().rev() {
            if notification.id <= self.saver.cursor() {
                continue;
            }

            let entry = self.log_entry(notification);
            self.sink.write_log(&entry).await?;
            self.saver.advance(notification.id);
            info!(id = notification.id, "notification delivered");
        }

        Ok(())
    }

    fn log_entry(&self, notification: &Notification) -> LogEntry {
        let mut metadata = Map::new();
        metadata.insert(
            "application_name".to_string(),
            Value::String(SOURCE.to_string()),
        );
        metadata.insert("id".to_string(), Value::from(notification.id));
        metadata.insert(
            "message".to_string(),
            Value::String(notification.message.clone()),
        );
        metadata.insert("date".to_string(), Value::String(notification.date.clone()));
        metadata.insert(
            "device_address".to_string(),
            Value::String(self.device_address.clone()),
        );

        LogEntry {
            timestamp: parse_device_date(&notification.date),
            level: "info".to_string(),
            message: format!(
                "Notification {} on {} with {}",
                notification.id, notification.date, notification.message
            ),
            source: SOURCE.to_string(),
            metadata,
        }
    }
}

/// The device stamps notifications in its own local time without an offset.
/// Unparseable dates fall back to the current time rather than losing the
/// notification.
fn parse_device_date(date: &str) -> DateTime<Utc> {
    match NaiveDateTime::parse_from_str(date, DATE_FORMAT) {
        Ok(naive) => match Local.from_local_datetime(&naive).earliest() {
            Some(local) => local.with_timezone(&Utc),
            None => Utc::now(),
        },
        Err(err) => {
            warn!(date, "could not parse notification date: {err}");
            Utc::now()
        }
    }
}
