//! Exponential backoff for retryable storage failures.
//!
//! Only errors whose [`ErrorClass`] is transient or WAL contention are retried.
//! WAL contention uses its own, longer base delay and ceiling since it clears
//! more slowly than a plain `SQLITE_BUSY`.

use crate::libs::config::RetryConfig;
use crate::libs::error::{ErrorClass, Result, StorageError};
use crate::libs::messages::Message;
use crate::msg_warning;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub wal_base_delay: Duration,
    pub wal_max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        RetryPolicy {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            wal_base_delay: Duration::from_millis(config.wal_base_delay_ms),
            wal_max_delay: Duration::from_millis(config.wal_max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Backoff ceiling for the given attempt (1-based), before jitter.
    pub fn backoff(&self, attempt: u32, class: ErrorClass) -> Duration {
        let (base, cap) = match class {
            ErrorClass::WalContention => (self.wal_base_delay, self.wal_max_delay),
            _ => (self.base_delay, self.max_delay),
        };
        let exp = attempt.saturating_sub(1).min(16);
        base.saturating_mul(1u32 << exp).min(cap)
    }

    /// Backoff with up to 25% random jitter added, still bounded by the cap.
    pub fn delay_for(&self, attempt: u32, class: ErrorClass) -> Duration {
        let backoff = self.backoff(attempt, class);
        let cap = match class {
            ErrorClass::WalContention => self.wal_max_delay,
            _ => self.max_delay,
        };
        let jitter_ms = (backoff.as_millis() as u64) / 4;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        (backoff + Duration::from_millis(jitter)).min(cap)
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent.
    pub async fn run<T, F, Fut>(&self, context: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() => {
                    if attempt >= self.max_attempts {
                        return Err(StorageError::RetryExhausted {
                            context: context.to_string(),
                            attempts: attempt,
                            last: err.to_string(),
                        });
                    }
                    let delay = self.delay_for(attempt, err.class());
                    let delay_ms = delay.as_millis() as u64;
                    msg_warning!(
                        Message::RetryScheduled {
                            context: context.to_string(),
                            attempt,
                            max_attempts: self.max_attempts,
                            delay_ms,
                            reason: err.to_string(),
                        },
                        attempt,
                        delay_ms
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            wal_base_delay: Duration::from_millis(2),
            wal_max_delay: Duration::from_millis(8),
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        let first = policy.backoff(1, ErrorClass::Transient);
        let second = policy.backoff(2, ErrorClass::Transient);
        assert_eq!(second, first * 2);
        assert_eq!(policy.backoff(30, ErrorClass::Transient), policy.max_delay);
        assert!(policy.backoff(1, ErrorClass::WalContention) > first);
        assert!(policy.delay_for(30, ErrorClass::WalContention) <= policy.wal_max_delay);
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = fast_policy()
            .run("flaky", || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StorageError::Busy("locked".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_budget_reports_attempts() {
        let err = fast_policy()
            .run("always busy", || async { Err::<(), _>(StorageError::Busy("locked".into())) })
            .await
            .unwrap_err();
        match err {
            StorageError::RetryExhausted { attempts, last, .. } => {
                assert_eq!(attempts, 3);
                assert!(last.contains("locked"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn application_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = fast_policy()
            .run("lookup", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(StorageError::TaskNotFound("x".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::TaskNotFound(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
