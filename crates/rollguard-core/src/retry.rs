//! Bounded retry with exponential backoff
//!
//! One combinator wraps every fallible sub-operation that can fail
//! transiently. Only errors classified as retryable are retried.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Backoff parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt
    pub base: Duration,
    /// Total attempts, including the first
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Create new policy
    #[inline]
    #[must_use]
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self { base, max_attempts }
    }

    /// Delay slept after failed attempt `attempt` (1-based): `base * 2^(attempt-1)`
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        self.base.saturating_mul(1u32 << exponent)
    }

    /// Policy that never retries
    #[inline]
    #[must_use]
    pub fn none() -> Self {
        Self::new(Duration::ZERO, 1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            max_attempts: 3,
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are exhausted. The last error is returned.
pub async fn with_backoff<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    operation, attempt, max_attempts, delay, err
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RollguardError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_doubles_from_base() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(2), Duration::from_secs(10));
        assert_eq!(policy.delay_for(3), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_until_success() {
        let calls = &AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let result = with_backoff(&RetryPolicy::default(), "sync", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(RollguardError::transient("sync", "connection reset"))
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = &AtomicU32::new(0);
        let result: Result<()> = with_backoff(&RetryPolicy::default(), "sync", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(RollguardError::transient("sync", "i/o timeout"))
        })
        .await;

        assert!(result.unwrap_err().is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_auth_errors() {
        let calls = &AtomicU32::new(0);
        let result: Result<()> = with_backoff(&RetryPolicy::default(), "sync", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(RollguardError::Auth("token is expired".to_string()))
        })
        .await;

        assert!(result.unwrap_err().is_auth());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
