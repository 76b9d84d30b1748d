/*!
 * Utility functions and helpers for SerialFlow.
 */
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Largest exponent applied to the backoff base delay
const MAX_BACKOFF_SHIFT: u32 = 30;

/// Race a future against a cancellation token
///
/// Returns `None` when the token fires first. The token is checked before the
/// future is polled, so an already-cancelled token never starts the work.
pub async fn with_cancellation<F, T>(token: &CancellationToken, future: F) -> Option<T>
where
    F: Future<Output = T>,
{
    if token.is_cancelled() {
        return None;
    }

    tokio::select! {
        biased;
        _ = token.cancelled() => None,
        value = future => Some(value),
    }
}

/// Sleep for `duration` unless the token fires first
///
/// Returns `false` when the sleep was cut short by cancellation.
pub async fn cancellable_sleep(token: &CancellationToken, duration: Duration) -> bool {
    with_cancellation(token, tokio::time::sleep(duration)).await.is_some()
}

/// Delay to wait after the given failed attempt (1-based)
///
/// `base * 2^(attempt - 1)`, saturating instead of overflowing.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let shift = (attempt - 1).min(MAX_BACKOFF_SHIFT);
    base.saturating_mul(1u32 << shift)
}

/// Run blocking I/O on the blocking thread pool
pub async fn run_blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let base = Duration::from_millis(200);
        assert_eq!(backoff_delay(base, 0), Duration::ZERO);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(400));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(800));
        assert_eq!(backoff_delay(base, 10), Duration::from_millis(200 * 512));
    }

    #[test]
    fn test_backoff_saturates() {
        let delay = backoff_delay(Duration::from_secs(u64::MAX / 2), 64);
        assert_eq!(delay, Duration::MAX);
    }

    #[tokio::test]
    async fn test_with_cancellation_completes() {
        let token = CancellationToken::new();
        assert_eq!(with_cancellation(&token, async { 42 }).await, Some(42));
    }

    #[tokio::test]
    async fn test_with_cancellation_pre_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(with_cancellation(&token, async { 42 }).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellable_sleep_interrupted() {
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let start = tokio::time::Instant::now();
        assert!(!cancellable_sleep(&token, Duration::from_secs(10)).await);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_run_blocking() {
        let value = run_blocking(|| 6 * 7).await.unwrap();
        assert_eq!(value, 42);
    }
}
