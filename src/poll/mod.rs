/*
The two polling loops: measurements on a ticker feeding a forwarder through
a bounded channel, and the notification log feeding the log sink with a
durable cursor. Each loop runs as its own supervised task and stops either
on shutdown or on the first unrecoverable error.
*/

pub mod metrics;
pub mod notifications;

use thiserror::Error;

use crate::device::DeviceError;
use crate::sink::SinkError;

pub use metrics::{MetricForwarder, MetricPoller};
pub use notifications::NotificationPoller;

#[derive(Debug, Error)]
pub enum PollError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("snapshot channel closed")]
    ChannelClosed,
}
