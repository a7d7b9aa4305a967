//! Retry policy for transient provider errors.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::ProviderError;

/// Exponential backoff settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for a single delay.
    pub max_backoff: Duration,
    /// Factor applied to the delay after each retry.
    pub multiplier: f64,
}

/// Result of running an operation under a [`RetryPolicy`].
#[derive(Debug)]
pub struct Attempted<T> {
    /// Final result.
    pub result: Result<T, ProviderError>,
    /// Number of attempts made.
    pub attempts: u32,
    /// A backoff was cut short by cancellation.
    pub cancelled: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.multiplier.max(1.0),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let max_nanos = self.max_backoff.as_nanos() as f64;
        let nanos = self.initial_backoff.as_nanos() as f64 * self.multiplier.powi(exponent);
        if !nanos.is_finite() || nanos >= max_nanos {
            return self.max_backoff;
        }
        Duration::from_nanos(nanos.round() as u64)
    }

    /// Runs `op` until it succeeds, fails fatally or runs out of attempts.
    ///
    /// Only retryable errors are retried. Cancellation interrupts a pending
    /// backoff but never an attempt in progress.
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Attempted<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let error = match op().await {
                Ok(value) => {
                    return Attempted {
                        result: Ok(value),
                        attempts,
                        cancelled: false,
                    };
                }
                Err(e) => e,
            };

            if !error.is_retryable() || attempts >= self.max_attempts {
                return Attempted {
                    result: Err(error),
                    attempts,
                    cancelled: false,
                };
            }

            let delay = self.backoff(attempts);
            warn!(
                "{label}: attempt {attempts}/{} failed ({error}), retrying in {delay:?}",
                self.max_attempts
            );

            tokio::select! {
                () = cancel.cancelled() => {
                    return Attempted {
                        result: Err(error),
                        attempts,
                        cancelled: true,
                    };
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
            multiplier: 2.0,
        };

        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(5), Duration::from_millis(1000));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn test_from_config() {
        let policy = RetryPolicy::from(&RetryConfig::default());
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_backoff, Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let outcome = policy(3)
            .run("test", &cancel, || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProviderError::retryable("throttled"))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(outcome.result.unwrap(), 7);
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn test_fatal_is_not_retried() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let outcome: Attempted<()> = policy(5)
            .run("test", &cancel, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::fatal("denied"))
            })
            .await;

        assert!(outcome.result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let cancel = CancellationToken::new();
        let outcome: Attempted<()> = policy(2)
            .run("test", &cancel, || async { Err(ProviderError::retryable("busy")) })
            .await;

        assert_eq!(outcome.attempts, 2);
        assert!(outcome.result.unwrap_err().is_retryable());
        assert!(!outcome.cancelled);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_backoff() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let slow = RetryPolicy {
            initial_backoff: Duration::from_secs(3600),
            max_backoff: Duration::from_secs(3600),
            ..policy(5)
        };

        let outcome: Attempted<()> = tokio::time::timeout(
            Duration::from_secs(5),
            slow.run("test", &cancel, || async { Err(ProviderError::retryable("busy")) }),
        )
        .await
        .unwrap();

        assert!(outcome.cancelled);
        assert_eq!(outcome.attempts, 1);
    }
}
