//! Bounded retries for transient remote failures.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::StorageError;

const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// How many attempts a remote operation gets and how long to wait between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay: Duration::from_millis(200),
        }
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << (attempt.saturating_sub(1)).min(16);
        self.base_delay.saturating_mul(factor).min(MAX_BACKOFF)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number. Only [`is_transient`]
    /// errors are retried.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &'static str,
        address: &str,
        mut op: F,
    ) -> Result<T, StorageError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let mut last_error = String::new();
        for attempt in 1..=self.attempts {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if is_transient(&e) => {
                    warn!(operation, address, attempt, error = %e, "transient storage failure");
                    last_error = e.to_string();
                    if attempt < self.attempts {
                        tokio::time::sleep(self.backoff(attempt)).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(StorageError::RetriesExhausted {
            operation,
            address: address.to_string(),
            attempts: self.attempts,
            message: last_error,
        })
    }
}

/// Network and server-side failures are worth another attempt; missing
/// objects and rejected requests are not.
pub fn is_transient(err: &StorageError) -> bool {
    matches!(err, StorageError::Remote(_) | StorageError::Io { .. })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts).with_base_delay(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = fast(3)
            .run("copy", "s3://b/k", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(StorageError::Remote("503".into()))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_with_retries_exhausted() {
        let err = fast(2)
            .run("copy", "s3://b/k", |_| async {
                Err::<(), _>(StorageError::Remote("timeout".into()))
            })
            .await
            .unwrap_err();
        match err {
            StorageError::RetriesExhausted {
                attempts, message, ..
            } => {
                assert_eq!(attempts, 2);
                assert!(message.contains("timeout"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let err = fast(5)
            .run("head", "s3://b/k", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(StorageError::NotFound("s3://b/k".into())) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy::new(10);
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(12), MAX_BACKOFF);
    }
}
