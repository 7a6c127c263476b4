use std::future::Future;
use tokio::time::{sleep, Duration};
use tracing::{error, warn};

use crate::error::ReconcileResult;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Delay after the `attempt`-th failure: 2^attempt seconds
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt.min(16))
}

/// Run a ledger fetch with bounded exponential backoff.
///
/// Only `Transient` errors are retried. Quota, rejection and fatal errors come
/// back immediately so the caller can react to them (a quota error must start
/// the cooldown, not burn more requests).
pub async fn with_backoff<T, F, Fut>(
    operation: &str,
    max_attempts: u32,
    mut call: F,
) -> ReconcileResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ReconcileResult<T>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = backoff_delay(attempt);
                warn!(
                    "⚠️ {} failed (attempt {}/{}): {}. Retrying in {}s...",
                    operation,
                    attempt,
                    max_attempts,
                    e,
                    delay.as_secs()
                );
                sleep(delay).await;
            }
            Err(e) => {
                if e.is_retryable() {
                    error!("❌ {} failed after {} attempts: {}", operation, attempt, e);
                }
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReconcileError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    #[test]
    fn test_backoff_delay_doubles() {
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(3), Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_retried_with_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let counter = calls.clone();
        let result = with_backoff("list", 3, || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ReconcileError::Transient("timeout".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 2s after the first failure, 4s after the second
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result: ReconcileResult<()> = with_backoff("list", 3, || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ReconcileError::Transient("connection reset".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(ReconcileError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_error_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let counter = calls.clone();
        let result: ReconcileResult<()> = with_backoff("list", 3, || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ReconcileError::QuotaExceeded("402".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(ReconcileError::QuotaExceeded(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
