//! Retry strategy with exponential backoff for transient errors.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use calvault_common::{Error, Result};

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts.
    pub max_retries: u32,
    /// Initial delay between retries, in milliseconds.
    pub initial_delay_ms: u64,
    /// Maximum delay (cap for exponential growth), in milliseconds.
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl RetryConfig {
    /// Create a new retry configuration.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Set initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Set backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Calculate delay for a given attempt number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay =
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);

        let capped_delay = base_delay.min(self.max_delay_ms as f64);

        let final_delay = if self.jitter {
            // +/- 25%
            let jitter_factor = 0.75 + (rand::random::<f64>() * 0.5);
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// A failed attempt that is about to be retried.
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    /// 1-based number of the failed attempt.
    pub attempt: u32,
    /// Delay before the next attempt.
    pub delay: Duration,
    /// Error that caused the retry.
    pub error: String,
}

/// Retry executor for running operations with retry logic.
///
/// Only transient errors (see [`Error::is_transient`]) are retried. Waiting
/// between attempts stops early when the cancellation token fires.
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Create a new retry executor.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Execute an operation with retry logic.
    pub async fn execute<F, Fut, T>(&self, cancel: &CancellationToken, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_observed(cancel, operation, |_| async {}).await
    }

    /// Execute an operation, calling `on_retry` before each backoff sleep.
    ///
    /// The hook runs to completion before the delay starts, so state it
    /// records is visible while the executor waits.
    pub async fn execute_observed<F, Fut, T, O, OFut>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
        mut on_retry: O,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        O: FnMut(RetryAttempt) -> OFut,
        OFut: Future<Output = ()>,
    {
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(result) => {
                    if attempt > 0 {
                        debug!("Operation succeeded after {} retries", attempt);
                    }
                    return Ok(result);
                }
                Err(err) => {
                    if !err.is_transient() {
                        return Err(err);
                    }

                    attempt += 1;
                    if attempt > self.config.max_retries {
                        warn!("Operation failed after {} attempts: {}", attempt, err);
                        return Err(err);
                    }

                    let delay = self.config.delay_for_attempt(attempt - 1);
                    warn!(
                        "Attempt {} failed: {}. Retrying in {:?}...",
                        attempt, err, delay
                    );

                    on_retry(RetryAttempt {
                        attempt,
                        delay,
                        error: err.to_string(),
                    })
                    .await;

                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(Error::Cancelled(
                                "Retry interrupted by shutdown".to_string(),
                            ));
                        }
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Get the retry configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_retry_config_delay_calculation() {
        let config = RetryConfig::new(3)
            .with_initial_delay(Duration::from_secs(1))
            .with_backoff_multiplier(2.0)
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
    }

    #[test]
    fn test_max_delay_cap() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(10))
            .with_backoff_multiplier(10.0)
            .with_jitter(false);

        // 1 * 10^5 seconds, capped at 10
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_bounds() {
        let config = RetryConfig::new(3)
            .with_initial_delay(Duration::from_millis(1000))
            .with_jitter(true);

        for _ in 0..100 {
            let delay = config.delay_for_attempt(0);
            assert!(delay >= Duration::from_millis(750));
            assert!(delay <= Duration::from_millis(1250));
        }
    }

    #[test]
    fn test_config_defaults_from_partial_json() {
        let config: RetryConfig = serde_json::from_str(r#"{"max_retries": 5}"#).unwrap();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.initial_delay_ms, 1_000);
        assert!(config.jitter);
    }

    #[tokio::test]
    async fn test_successful_operation() {
        let executor = RetryExecutor::default();
        let cancel = CancellationToken::new();

        let result: Result<i32> = executor.execute(&cancel, || async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_on_network_error() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let count_clone = attempt_count.clone();

        let config = RetryConfig::new(3)
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter(false);
        let executor = RetryExecutor::new(config);
        let cancel = CancellationToken::new();

        let result: Result<i32> = executor
            .execute(&cancel, move || {
                let count = count_clone.clone();
                async move {
                    let current = count.fetch_add(1, Ordering::SeqCst);
                    if current < 2 {
                        Err(Error::Network("Connection failed".to_string()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let count_clone = attempt_count.clone();

        let executor = RetryExecutor::default();
        let cancel = CancellationToken::new();

        let result: Result<i32> = executor
            .execute(&cancel, move || {
                let count = count_clone.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Auth("bad password".to_string()))
                }
            })
            .await;

        assert!(matches!(result, Err(Error::Auth(_))));
        assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_max_retries_exceeded() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let count_clone = attempt_count.clone();

        let config = RetryConfig::new(2).with_initial_delay(Duration::from_millis(1));
        let executor = RetryExecutor::new(config);
        let cancel = CancellationToken::new();

        let result: Result<i32> = executor
            .execute(&cancel, move || {
                let count = count_clone.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Network("Always fails".to_string()))
                }
            })
            .await;

        assert!(result.is_err());
        // Initial + 2 retries
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_observer_sees_each_retry() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        let config = RetryConfig::new(2)
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter(false);
        let executor = RetryExecutor::new(config);
        let cancel = CancellationToken::new();

        let result: Result<()> = executor
            .execute_observed(
                &cancel,
                || async { Err(Error::Network("down".to_string())) },
                move |attempt| {
                    let seen = seen_clone.clone();
                    async move {
                        seen.lock().unwrap().push((attempt.attempt, attempt.delay));
                    }
                },
            )
            .await;

        assert!(matches!(result, Err(Error::Network(_))));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(1, Duration::from_millis(1)), (2, Duration::from_millis(2))]
        );
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_secs(30))
            .with_jitter(false);
        let executor = RetryExecutor::new(config);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<()> = executor
            .execute(&cancel, || async { Err(Error::Network("down".to_string())) })
            .await;

        assert!(matches!(result, Err(Error::Cancelled(_))));
    }
}
