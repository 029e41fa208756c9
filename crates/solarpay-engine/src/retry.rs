//! # Bounded Retry
//!
//! Exponential backoff around gateway and token-service calls.
//!
//! ```text
//! attempt 1 ──✗ retryable──► sleep 500ms ──► attempt 2 ──✗──► sleep 1s ──► attempt 3 ──✗──► Err
//!     │                                          │
//!     └── ✗ fatal ──► Err (no sleep)              └── ✓ ──► Ok
//! ```

use backoff::ExponentialBackoff;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::RetrySettings;
use crate::error::{EngineError, EngineResult};

/// Retry policy shared by every outbound call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        RetryPolicy {
            max_attempts: settings.max_attempts.max(1),
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// A policy that tries once and never sleeps.
    pub fn no_retry() -> Self {
        RetryPolicy {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. The last error is returned.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> EngineResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        let max_attempts = self.max_attempts;
        let mut attempt = 0u32;

        let result = backoff::future::retry_notify(
            self.create_backoff(),
            || {
                attempt += 1;
                let current = attempt;
                let call = op();
                async move {
                    call.await.map_err(|e| {
                        if e.is_retryable() && current < max_attempts {
                            backoff::Error::transient(e)
                        } else {
                            backoff::Error::permanent(e)
                        }
                    })
                }
            },
            |e: EngineError, delay: Duration| {
                debug!(operation, ?delay, error = %e, "Retrying after backoff");
            },
        )
        .await;

        if let Err(e) = &result {
            if attempt > 1 {
                warn!(operation, attempt, error = %e, "Giving up after retries");
            }
        }
        result
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_backoff,
            max_interval: self.max_backoff,
            multiplier: 2.0,
            randomization_factor: 0.0,
            max_elapsed_time: None, // attempts bound the loop, not time
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backoff::backoff::Backoff;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result = fast_policy(3)
            .run("check_status", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(EngineError::Gateway("reset".into()))
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_stops_at_attempt_budget() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result: EngineResult<()> = fast_policy(3)
            .run("check_status", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(EngineError::GatewayTimeout(10))
            })
            .await;

        assert!(result.unwrap_err().is_timeout());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result: EngineResult<()> = fast_policy(5)
            .run("create_order", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(EngineError::GatewayRejected {
                    status: 400,
                    message: "bad request".into(),
                })
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_doubles_without_jitter() {
        let policy = RetryPolicy {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_millis(1_500),
        };
        let mut backoff = policy.create_backoff();

        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(500)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(1_000)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(1_500)));
    }
}
