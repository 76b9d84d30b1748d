/*!
 * Bounded retry with exponential backoff.
 *
 * A [`RetryPolicy`] is immutable once built. [`RetryPolicies`] holds the
 * connect and send policies of one connection and swaps them atomically when
 * the retry configuration changes, so an execution that already started keeps
 * the policy it started with.
 */
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use serialflow_core::config::RetryPolicyConfig;
use serialflow_core::utils::{backoff_delay, cancellable_sleep};

/// Minimum time between two policy rebuilds
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(1);

/// Why a retried operation did not succeed
#[derive(Error, Debug)]
pub enum RetryError<E> {
    /// The cancellation token fired before an attempt or during backoff
    #[error("Operation cancelled")]
    Cancelled,

    /// The last attempt failed with this error
    #[error("{0}")]
    Operation(E),
}

/// Bounded retry with exponential backoff for boolean-returning operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    name: &'static str,
    max_retries: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    /// Create a policy that retries up to `max_retries` times
    pub fn new(name: &'static str, max_retries: u32, base_delay: Duration) -> Self {
        Self {
            name,
            max_retries,
            base_delay,
        }
    }

    /// Policy name used in logs
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Retries after the first attempt
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Total attempts including the first one
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before the first retry
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Delay after the given failed attempt (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        backoff_delay(self.base_delay, attempt)
    }

    /// Run `operation` until it returns `Ok(true)` or the retries run out
    ///
    /// Both `Ok(false)` and `Err(_)` count as a failed attempt. When every
    /// attempt failed, the outcome of the last one is returned. The closure
    /// receives the 1-based attempt number.
    pub async fn execute<F, Fut, E>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<bool, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<bool, E>>,
        E: Display,
    {
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }

            let outcome = operation(attempt).await;
            match &outcome {
                Ok(true) => {
                    if attempt > 1 {
                        debug!(policy = self.name, attempt, "succeeded after retry");
                    }
                    return Ok(true);
                }
                Ok(false) => debug!(policy = self.name, attempt, "attempt reported failure"),
                Err(e) => debug!(policy = self.name, attempt, error = %e, "attempt failed"),
            }

            if attempt > self.max_retries {
                warn!(policy = self.name, attempts = attempt, "retries exhausted");
                return outcome.map_err(RetryError::Operation);
            }

            let delay = self.delay_after(attempt);
            if !cancellable_sleep(cancel, delay).await {
                debug!(policy = self.name, attempt, "backoff cancelled");
                return Err(RetryError::Cancelled);
            }
            attempt += 1;
        }
    }
}

/// Result of a reload request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// The new policies are installed
    Applied,
    /// A rebuild happened too recently; try again after `retry_in`
    Debounced {
        /// Time left in the debounce window
        retry_in: Duration,
    },
    /// The configuration was invalid; the previous policies stay installed
    Rejected,
}

/// Hot-swappable connect and send policies of one connection
#[derive(Debug)]
pub struct RetryPolicies {
    connect: RwLock<Arc<RetryPolicy>>,
    send: RwLock<Arc<RetryPolicy>>,
    config: RwLock<RetryPolicyConfig>,
    last_rebuild: Mutex<Option<Instant>>,
    debounce: Duration,
    rebuild_failures: AtomicU64,
}

impl RetryPolicies {
    /// Build policies from a configuration, clamping out-of-range values
    pub fn new(config: RetryPolicyConfig) -> Self {
        Self::with_debounce(config, DEFAULT_DEBOUNCE)
    }

    /// Build policies with a custom debounce window
    pub fn with_debounce(config: RetryPolicyConfig, debounce: Duration) -> Self {
        let config = match config.validate() {
            Ok(()) => config,
            Err(e) => {
                warn!("Retry configuration out of range, clamping: {}", e);
                config.clamped()
            }
        };
        let (connect, send) = build(&config);

        Self {
            connect: RwLock::new(Arc::new(connect)),
            send: RwLock::new(Arc::new(send)),
            config: RwLock::new(config),
            last_rebuild: Mutex::new(None),
            debounce,
            rebuild_failures: AtomicU64::new(0),
        }
    }

    /// Policy currently applied to connects
    pub fn connect_policy(&self) -> Arc<RetryPolicy> {
        self.connect
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Policy currently applied to sends
    pub fn send_policy(&self) -> Arc<RetryPolicy> {
        self.send.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Configuration the installed policies were built from
    pub fn config(&self) -> RetryPolicyConfig {
        *self.config.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of rejected rebuilds
    pub fn rebuild_failures(&self) -> u64 {
        self.rebuild_failures.load(Ordering::Relaxed)
    }

    /// Rebuild and swap in policies for a new configuration
    ///
    /// At most one rebuild (successful or not) happens per debounce window.
    pub fn reload(&self, config: &RetryPolicyConfig) -> ReloadOutcome {
        let mut last_rebuild = self
            .last_rebuild
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let now = Instant::now();
        if let Some(previous) = *last_rebuild {
            let elapsed = now.saturating_duration_since(previous);
            if elapsed < self.debounce {
                debug!("Retry policy rebuild debounced");
                return ReloadOutcome::Debounced {
                    retry_in: self.debounce - elapsed,
                };
            }
        }
        *last_rebuild = Some(now);

        if let Err(e) = config.validate() {
            let failures = self.rebuild_failures.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(failures, "Retry policy rebuild rejected: {}", e);
            return ReloadOutcome::Rejected;
        }

        let (connect, send) = build(config);
        *self.connect.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(connect);
        *self.send.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(send);
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = *config;

        info!(
            connect_retries = config.connect_retry_count,
            send_retries = config.send_retry_count,
            base_delay_ms = config.base_delay_ms,
            "Retry policies reloaded"
        );
        ReloadOutcome::Applied
    }

    /// Follow a configuration channel until it closes or the task is aborted
    ///
    /// Bursts of changes inside the debounce window are coalesced: once the
    /// window has passed, the latest value is applied.
    pub fn watch(self: &Arc<Self>, mut updates: watch::Receiver<RetryPolicyConfig>) -> JoinHandle<()> {
        let policies = Arc::downgrade(self);
        tokio::spawn(async move {
            while updates.changed().await.is_ok() {
                loop {
                    let config = *updates.borrow_and_update();
                    let Some(current) = policies.upgrade() else {
                        return;
                    };
                    match current.reload(&config) {
                        ReloadOutcome::Debounced { retry_in } => {
                            drop(current);
                            tokio::time::sleep(retry_in).await;
                        }
                        ReloadOutcome::Applied | ReloadOutcome::Rejected => break,
                    }
                }
            }
            debug!("Retry configuration channel closed");
        })
    }
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self::new(RetryPolicyConfig::default())
    }
}

fn build(config: &RetryPolicyConfig) -> (RetryPolicy, RetryPolicy) {
    let base_delay = config.base_delay();
    (
        RetryPolicy::new("connect", config.connect_retry_count, base_delay),
        RetryPolicy::new("send", config.send_retry_count, base_delay),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn config(connect: u32, send: u32, base_delay_ms: u64) -> RetryPolicyConfig {
        RetryPolicyConfig {
            connect_retry_count: connect,
            send_retry_count: send,
            base_delay_ms,
        }
    }

    /// Fails (with an error) `failures` times, then succeeds
    async fn flaky(
        policy: &RetryPolicy,
        failures: u32,
        calls: &AtomicU32,
    ) -> Result<bool, RetryError<String>> {
        let cancel = CancellationToken::new();
        policy
            .execute(&cancel, |_| {
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if call <= failures {
                        Err(format!("failure {}", call))
                    } else {
                        Ok(true)
                    }
                }
            })
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_exactly_max_retries() {
        for retries in 0..=4 {
            let policy = RetryPolicy::new("connect", retries, Duration::from_millis(50));
            let calls = AtomicU32::new(0);

            let result = flaky(&policy, retries, &calls).await;

            assert!(matches!(result, Ok(true)), "retries = {}", retries);
            assert_eq!(calls.load(Ordering::SeqCst), retries + 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_when_failures_exceed_retries() {
        for retries in 0..=4 {
            let policy = RetryPolicy::new("connect", retries, Duration::from_millis(50));
            let calls = AtomicU32::new(0);

            let result = flaky(&policy, retries + 1, &calls).await;

            match result {
                Err(RetryError::Operation(message)) => {
                    assert_eq!(message, format!("failure {}", retries + 1));
                }
                other => panic!("unexpected outcome {:?}", other),
            }
            assert_eq!(calls.load(Ordering::SeqCst), retries + 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_false_is_retried_and_returned_last() {
        let policy = RetryPolicy::new("send", 2, Duration::from_millis(100));
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result = policy
            .execute(&cancel, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, String>(false) }
            })
            .await;

        assert!(matches!(result, Ok(false)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries_means_single_attempt() {
        let policy = RetryPolicy::new("connect", 0, Duration::from_millis(100));
        let cancel = CancellationToken::new();
        let start = Instant::now();
        let calls = AtomicU32::new(0);

        let result = policy
            .execute(&cancel, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, String>(false) }
            })
            .await;

        assert!(matches!(result, Ok(false)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_between_attempts() {
        let policy = RetryPolicy::new("connect", 4, Duration::from_millis(100));
        let cancel = CancellationToken::new();
        let start = Instant::now();
        let mut stamps = Vec::new();

        let _ = policy
            .execute(&cancel, |_| {
                stamps.push(start.elapsed());
                async { Ok::<_, String>(false) }
            })
            .await;

        let gaps: Vec<Duration> = stamps.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_stops_loop() {
        let policy = RetryPolicy::new("connect", 5, Duration::from_secs(1));
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            canceller.cancel();
        });
        let calls = AtomicU32::new(0);

        let result = policy
            .execute(&cancel, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, String>(false) }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Cancelled)));
        // attempts at t=0 and t=1s; the 2s backoff is interrupted
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_initial_config_is_clamped() {
        let policies = RetryPolicies::new(config(42, 1, 10));
        assert_eq!(policies.connect_policy().max_retries(), 10);
        assert_eq!(policies.send_policy().base_delay(), Duration::from_millis(50));
        assert_eq!(policies.rebuild_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_is_debounced() {
        let policies = RetryPolicies::new(config(1, 1, 100));

        assert_eq!(policies.reload(&config(2, 2, 100)), ReloadOutcome::Applied);
        assert!(matches!(
            policies.reload(&config(3, 3, 100)),
            ReloadOutcome::Debounced { .. }
        ));
        assert_eq!(policies.connect_policy().max_retries(), 2);

        tokio::time::advance(DEFAULT_DEBOUNCE).await;
        assert_eq!(policies.reload(&config(3, 3, 100)), ReloadOutcome::Applied);
        assert_eq!(policies.send_policy().max_retries(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_reload_is_counted_and_ignored() {
        let policies = RetryPolicies::new(config(1, 1, 100));

        assert_eq!(policies.reload(&config(99, 1, 100)), ReloadOutcome::Rejected);
        assert_eq!(policies.rebuild_failures(), 1);
        assert_eq!(policies.connect_policy().max_retries(), 1);
        assert_eq!(policies.config(), config(1, 1, 100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_execution_keeps_its_policy() {
        let policies = Arc::new(RetryPolicies::new(config(3, 0, 100)));
        let policy = policies.connect_policy();
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let swapper = policies.clone();
        let swap = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            swapper.reload(&config(0, 0, 50))
        });

        let result = policy
            .execute(&cancel, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, String>(false) }
            })
            .await;

        assert_eq!(swap.await.unwrap(), ReloadOutcome::Applied);
        assert!(matches!(result, Ok(false)));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(policies.connect_policy().max_retries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_coalesces_bursts() {
        let policies = Arc::new(RetryPolicies::new(config(1, 1, 100)));
        let (tx, rx) = watch::channel(config(1, 1, 100));
        let task = policies.watch(rx);

        tx.send_replace(config(2, 2, 100));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(policies.connect_policy().max_retries(), 2);

        tx.send_replace(config(3, 3, 100));
        tx.send_replace(config(4, 4, 100));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(policies.connect_policy().max_retries(), 2);

        tokio::time::sleep(DEFAULT_DEBOUNCE).await;
        assert_eq!(policies.connect_policy().max_retries(), 4);

        task.abort();
    }
}
