//! Exponential backoff for producer calls.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ProducerError;
use crate::shutdown::Shutdown;

/// Configuration for the retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not counting the first try).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_backoff_ms: u64,
    /// Caps exponential growth.
    pub max_backoff_ms: u64,
    /// Multiplier applied to backoff on each retry.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
        }
    }
}

/// Stateless retry policy: computes the next delay given the attempt number.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

/// Outcome of a call driven through [`RetryPolicy::run`].
#[derive(Debug)]
pub enum RetryOutcome<T> {
    /// The call succeeded, possibly after retries.
    Done(T),
    /// Every attempt failed with a retryable error.
    Exhausted { attempts: u32, last: ProducerError },
    /// A non-retryable error; no further attempts were made.
    Fatal(ProducerError),
    /// Shutdown fired while waiting to retry.
    Cancelled,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Returns the delay before the `attempt`-th retry (1-based).
    /// Returns `None` if `attempt` exceeds `max_retries`.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.config.max_retries {
            return None;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let base_ms = self.config.initial_backoff_ms as f64 * self.config.multiplier.powi(exponent);
        let capped = base_ms.min(self.config.max_backoff_ms as f64);
        Some(Duration::from_millis(capped as u64))
    }

    /// Runs `op` until it succeeds, fails fatally, exhausts its retries, or
    /// shutdown fires during a backoff wait.
    pub async fn run<T, F, Fut>(&self, what: &str, shutdown: &mut Shutdown, mut op: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProducerError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return RetryOutcome::Done(value),
                Err(e) if e.is_retryable() => {
                    attempt += 1;
                    match self.next_delay(attempt) {
                        Some(delay) => {
                            tracing::warn!(
                                call = what,
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %e,
                                "retrying producer call"
                            );
                            if !shutdown.sleep(delay).await {
                                return RetryOutcome::Cancelled;
                            }
                        }
                        None => {
                            tracing::error!(call = what, attempt, error = %e, "max retries exceeded");
                            return RetryOutcome::Exhausted { attempts: attempt, last: e };
                        }
                    }
                }
                Err(e) => return RetryOutcome::Fatal(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::shutdown_channel;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            multiplier: 2.0,
        })
    }

    #[test]
    fn first_retry_delay() {
        let policy = RetryPolicy::new(RetryConfig {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
        });
        assert_eq!(policy.next_delay(1).unwrap().as_millis(), 100);
        assert_eq!(policy.next_delay(2).unwrap().as_millis(), 200);
        assert_eq!(policy.next_delay(3).unwrap().as_millis(), 400);
        assert!(policy.next_delay(4).is_none());
    }

    #[test]
    fn delay_capped_at_max() {
        let policy = RetryPolicy::new(RetryConfig {
            max_retries: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 500,
            multiplier: 10.0,
        });
        let d5 = policy.next_delay(5).unwrap();
        assert!(d5 <= Duration::from_millis(500), "d5={d5:?} exceeds max");
    }

    #[tokio::test]
    async fn transient_errors_then_success() {
        let (_trigger, mut shutdown) = shutdown_channel();
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let outcome = fast(3)
            .run("fetch", &mut shutdown, move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProducerError::Transient("timeout".into()))
                } else {
                    Ok(42u64)
                }
            })
            .await;
        assert!(matches!(outcome, RetryOutcome::Done(42)));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_after_bounded_attempts() {
        let (_trigger, mut shutdown) = shutdown_channel();
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let outcome: RetryOutcome<()> = fast(2)
            .run("fetch", &mut shutdown, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProducerError::Transient("connection refused".into()))
            })
            .await;
        assert!(matches!(outcome, RetryOutcome::Exhausted { attempts: 3, .. }));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_error_is_not_retried() {
        let (_trigger, mut shutdown) = shutdown_channel();
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let outcome: RetryOutcome<()> = fast(5)
            .run("fetch", &mut shutdown, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProducerError::Fatal("unauthorized".into()))
            })
            .await;
        assert!(matches!(outcome, RetryOutcome::Fatal(_)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_cancels_backoff() {
        let (trigger, mut shutdown) = shutdown_channel();
        trigger.trigger();
        let outcome: RetryOutcome<()> = fast(5)
            .run("fetch", &mut shutdown, move || async move {
                Err(ProducerError::Transient("timeout".into()))
            })
            .await;
        assert!(matches!(outcome, RetryOutcome::Cancelled));
    }
}
