/*
Generic resilience primitives for outbound calls: exponential-backoff retry
and a three-state circuit breaker. Nothing in here knows about the UPS
protocol; the sinks and the session compose these around their own I/O.
*/

mod breaker;
mod retry;

pub use breaker::{BreakerConfig, BreakerError, BreakerState, CircuitBreaker};
pub use retry::{retry, RetryError, RetryPolicy};
