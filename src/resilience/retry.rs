//! Exponential-backoff retry for outbound calls.
//!
//! The loop is iterative with an explicit attempt counter; backoff sleeps
//! are plain tokio sleeps, so dropping the returned future (e.g. from a
//! `select!` against a cancellation token) aborts mid-backoff.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

/// Configuration for [retry].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay after the failure of attempt `attempt` (0-indexed):
    /// `min(initial_delay * backoff_factor^attempt, max_delay)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("non-retryable error: {0}")]
    NotRetryable(#[source] E),

    #[error("max retry attempts ({attempts}) exceeded: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: E,
    },
}

/// Run `op` up to `policy.max_attempts` times, sleeping with exponential
/// backoff between attempts. Errors rejected by `is_retryable` short-circuit
/// without further attempts.
pub async fn retry<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    is_retryable: P,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !is_retryable(&err) {
                    return Err(RetryError::NotRetryable(err));
                }
                attempt += 1;
                if attempt >= policy.max_attempts {
                    return Err(RetryError::Exhausted {
                        attempts: policy.max_attempts,
                        source: err,
                    });
                }
                let delay = policy.delay(attempt - 1);
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after failure: {err}"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_factor: 2.0,
        }
    }

    #[test]
    fn backoff_formula_caps_at_max_delay() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
        };

        let delays: Vec<Duration> = (0..5).map(|k| policy.delay(k)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
                Duration::from_secs(1),
            ]
        );
    }

    #[tokio::test]
    async fn succeeds_without_retry() {
        let calls = AtomicU32::new(0);
        let res: Result<u32, RetryError<&str>> = retry(&fast_policy(3), |_| true, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(7) }
        })
        .await;

        assert_eq!(res.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let res: Result<&str, RetryError<&str>> = retry(&fast_policy(5), |_| true, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("transient")
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(res.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_attempts_and_reports_count() {
        let calls = AtomicU32::new(0);
        let res: Result<(), RetryError<&str>> = retry(&fast_policy(3), |_| true, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("still broken") }
        })
        .await;

        match res {
            Err(RetryError::Exhausted { attempts, source }) => {
                assert_eq!(attempts, 3);
                assert_eq!(source, "still broken");
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_short_circuits() {
        let calls = AtomicU32::new(0);
        let res: Result<(), RetryError<&str>> =
            retry(&fast_policy(5), |e| *e != "fatal", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("fatal") }
            })
            .await;

        assert!(matches!(res, Err(RetryError::NotRetryable("fatal"))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
