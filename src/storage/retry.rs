//! Retry policy for storage calls.
//!
//! Transient failures (lock contention, "database is locked",
//! disposed-handle races) are retried up to a fixed bound with linear
//! backoff; everything else propagates immediately. The policy wraps the
//! storage call from the outside, independent of any backend's own error
//! types, and never holds an application-level lock across the awaited
//! call.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{Result, UnshubError};

/// Bounded retry with increasing backoff (`attempt * backoff_base`).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(75),
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base * attempt
    }

    /// Run `op`, retrying while it fails transiently
    /// ([`UnshubError::is_transient`]) and the attempt budget lasts.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = self.backoff(attempt);
                    warn!(what, attempt, delay_ms = delay.as_millis() as u64, %err, "transient storage failure, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
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
    use std::sync::Arc;

    fn flaky(failures: u32) -> (Arc<AtomicU32>, impl FnMut() -> std::future::Ready<Result<u32>>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let op = move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            std::future::ready(if n <= failures {
                Err(UnshubError::TransientStorage("locked".into()))
            } else {
                Ok(n)
            })
        };
        (calls, op)
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_retried_within_budget() {
        let (calls, op) = flaky(2);
        let result = RetryPolicy::default().run("store", op).await.unwrap();
        assert_eq!(result, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion_propagates_transient_error() {
        let (calls, op) = flaky(10);
        let err = RetryPolicy::default().run("store", op).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_error_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let err = RetryPolicy::default()
            .run("store", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                std::future::ready(Err::<(), _>(UnshubError::FatalStorage("corrupt".into())))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, UnshubError::FatalStorage(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_increases_per_attempt() {
        let policy = RetryPolicy::default();
        assert!(policy.backoff(2) > policy.backoff(1));
        assert_eq!(policy.backoff(1), Duration::from_millis(75));
    }
}
