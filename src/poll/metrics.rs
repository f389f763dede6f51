//! Measurement polling. The poller fetches a snapshot per tick and hands it
//! to the forwarder over a bounded channel, so a slow metrics store applies
//! backpressure to polling instead of queueing snapshots without limit.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::device::{Session, Snapshot};
use crate::sink::MetricSink;

use super::PollError;

pub struct MetricPoller {
    session: Arc<Session>,
    interval: Duration,
    jobs: mpsc::Sender<Snapshot>,
}

impl MetricPoller {
    pub fn new(session: Arc<Session>, interval: Duration, jobs: mpsc::Sender<Snapshot>) -> Self {
        Self {
            session,
            interval,
            jobs,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<(), PollError> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; wait a full interval instead.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("stopping measurement poller");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            let snapshot = self.session.measurements().await?;
            debug!(
                deploy = %snapshot.deploy_name,
                ups_type = %snapshot.ups_type,
                gauges = snapshot.gauges.len(),
                states = snapshot.states.len(),
                "snapshot fetched"
            );

            if self.jobs.send(snapshot).await.is_err() {
                return Err(PollError::ChannelClosed);
            }
        }
    }
}

/// Drains the snapshot channel into the metrics store.
pub struct MetricForwarder {
    sink: Box<dyn MetricSink>,
    jobs: mpsc::Receiver<Snapshot>,
}

impl MetricForwarder {
    pub fn new(sink: Box<dyn MetricSink>, jobs: mpsc::Receiver<Snapshot>) -> Self {
        Self { sink, jobs }
    }

    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), PollError> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("stopping metric forwarder");
                    return Ok(());
                }
                received = self.jobs.recv() => {
                    match received {
                        Some(snapshot) => self.sink.write(&snapshot).await?,
                        None => return Err(PollError::ChannelClosed),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MeasurementsBody;
    use crate::sink::SinkError;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;

    struct RecordingSink {
        written: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl MetricSink for RecordingSink {
        async fn write(&self, snapshot: &Snapshot) -> Result<(), SinkError> {
            if self.fail {
                return Err(SinkError::CircuitOpen);
            }
            self.written
                .lock()
                .unwrap()
                .push(snapshot.deploy_name.clone());
            Ok(())
        }
    }

    fn snapshot(deploy: &str) -> Snapshot {
        let body: MeasurementsBody = serde_json::from_str(&format!(
            r#"{{"responseStatus": "S001", "deployName": "{deploy}"}}"#
        ))
        .unwrap();
        Snapshot::from_body(body, Utc::now())
    }

    #[tokio::test]
    async fn forwarder_writes_snapshots_in_order() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel(1);
        let forwarder = MetricForwarder::new(
            Box::new(RecordingSink {
                written: written.clone(),
                fail: false,
            }),
            rx,
        );

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(forwarder.run(shutdown.clone()));

        tx.send(snapshot("first")).await.unwrap();
        tx.send(snapshot("second")).await.unwrap();
        drop(tx);

        // Sender gone means the poller died; the forwarder reports it.
        assert!(matches!(
            task.await.unwrap(),
            Err(PollError::ChannelClosed)
        ));
        assert_eq!(*written.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn forwarder_stops_on_sink_failure() {
        let (tx, rx) = mpsc::channel(1);
        let forwarder = MetricForwarder::new(
            Box::new(RecordingSink {
                written: Arc::new(Mutex::new(Vec::new())),
                fail: true,
            }),
            rx,
        );

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(forwarder.run(shutdown.clone()));

        tx.send(snapshot("first")).await.unwrap();
        assert!(matches!(task.await.unwrap(), Err(PollError::Sink(_))));
    }

    #[tokio::test]
    async fn forwarder_exits_cleanly_on_shutdown() {
        let (_tx, rx) = mpsc::channel::<Snapshot>(1);
        let forwarder = MetricForwarder::new(
            Box::new(RecordingSink {
                written: Arc::new(Mutex::new(Vec::new())),
                fail: false,
            }),
            rx,
        );

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(forwarder.run(shutdown.clone()));

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }
}
