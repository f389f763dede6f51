//! Circuit breaker guarding a downstream destination.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before admitting a probe.
    pub recovery_timeout: Duration,
    /// Consecutive successes needed to close from half-open.
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error("circuit breaker is open, rejecting request")]
    Open,

    #[error(transparent)]
    Inner(E),
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failures: u32,
    successes: u32,
    last_failure: Option<Instant>,
}

/// Three-state circuit breaker. Shared between tasks behind an `Arc`; all
/// state transitions happen under the internal mutex.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                successes: 0,
                last_failure: None,
            }),
        }
    }

    /// Run `op` if the gate admits it, recording the outcome.
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.can_execute() {
            return Err(BreakerError::Open);
        }

        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(BreakerError::Inner(err))
            }
        }
    }

    /// Gate admission check. For an open circuit this admits a probe once the
    /// recovery timeout has elapsed without flipping the stored state; the
    /// probe's outcome decides the transition.
    fn can_execute(&self) -> bool {
        let inner = self.inner.lock().expect("breaker mutex poisoned");
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => inner
                .last_failure
                .map(|at| at.elapsed() >= self.config.recovery_timeout)
                .unwrap_or(true),
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        inner.failures += 1;
        inner.successes = 0;
        inner.last_failure = Some(Instant::now());

        match inner.state {
            BreakerState::Closed => {
                if inner.failures >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    info!(failures = inner.failures, "circuit breaker opened");
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                info!("circuit breaker re-opened from half-open");
            }
            BreakerState::Open => {}
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        inner.failures = 0;

        match inner.state {
            BreakerState::Open => {
                inner.state = BreakerState::HalfOpen;
                inner.successes = 1;
                if inner.successes >= self.config.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.successes = 0;
                }
            }
            BreakerState::HalfOpen => {
                inner.successes += 1;
                if inner.successes >= self.config.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.successes = 0;
                    info!("circuit breaker closed");
                }
            }
            BreakerState::Closed => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker mutex poisoned").state
    }

    /// (state, consecutive failures, consecutive successes)
    pub fn stats(&self) -> (BreakerState, u32, u32) {
        let inner = self.inner.lock().expect("breaker mutex poisoned");
        (inner.state, inner.failures, inner.successes)
    }

    /// Force the breaker back to closed with zeroed counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        inner.state = BreakerState::Closed;
        inner.failures = 0;
        inner.successes = 0;
        inner.last_failure = None;
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
