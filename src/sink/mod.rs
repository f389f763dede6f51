/*
Downstream delivery: measurement snapshots go to a metrics store, decoded
notifications go to a log store. Both sit behind small traits so the pollers
never know which backend they are feeding.
*/

pub mod influx;
pub mod victorialogs;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::device::Snapshot;
use crate::util::http::{ClientError, StatusCode};

pub use influx::InfluxSink;
pub use victorialogs::{VictoriaLogsAuth, VictoriaLogsSink};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error(transparent)]
    Http(#[from] ClientError),

    #[error("sink rejected the write: status {status}, body: {body}")]
    Rejected { status: StatusCode, body: String },

    #[error("failed to serialize entry: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("log sink circuit is open, dropping writes")]
    CircuitOpen,

    #[error("delivery gave up after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: Box<SinkError>,
    },
}

/// A structured log record as delivered to the log store. Metadata fields
/// are flattened into the record alongside the standard fields.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
    pub source: String,
    pub metadata: Map<String, Value>,
}

#[async_trait]
pub trait MetricSink: Send + Sync {
    async fn write(&self, snapshot: &Snapshot) -> Result<(), SinkError>;
}

#[async_trait]
pub trait LogSink: Send + Sync {
    async fn write_log(&self, entry: &LogEntry) -> Result<(), SinkError>;

    /// Release backend resources. Called once when the notification poller
    /// shuts down.
    async fn close(&self) -> Result<(), SinkError>;
}
