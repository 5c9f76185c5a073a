use std::future::Future;
use std::time::Duration;

use rand::Rng as _;

/// Retry decision returned by the outcome classifier callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    Retry,
    Abort,
}

/// Upper bound on the random jitter added to every backoff delay, to prevent
/// synchronized retry storms when multiple workers hit the same transient
/// failure.
pub const JITTER_MS: u64 = 100;

/// Exponential backoff configuration.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 2_000,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryConfig {
    /// Compute the delay for a given retry attempt (0-indexed).
    ///
    /// Formula: `min(base_delay * 2^retry, max_delay) + random_jitter(0..=100ms)`
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exp_delay = self
            .base_delay_ms
            .saturating_mul(1u64.checked_shl(retry).unwrap_or(u64::MAX));
        let capped = exp_delay.min(self.max_delay_ms);
        let jitter = rand::thread_rng().gen_range(0..=JITTER_MS);
        Duration::from_millis(capped + jitter)
    }
}

/// Retry an async operation with exponential backoff and jitter.
///
/// Retries over plain values rather than `Result`s: the classifier inspects
/// each produced value and returns `Retry` or `Abort`. The first non-retried
/// value is returned; if max attempts are exhausted the last value is
/// surfaced to the caller, so a run always makes forward progress or
/// terminates rather than spinning.
pub async fn retry_with_backoff<F, Fut, T, C>(config: &RetryConfig, classifier: C, operation: F) -> T
where
    F: Fn() -> Fut,
    Fut: Future<Output = T>,
    C: Fn(&T) -> RetryAction,
{
    let total_attempts = config.max_retries + 1; // 1 initial + max_retries retries
    let mut attempt = 0u32;

    loop {
        let value = operation().await;
        attempt += 1;

        if classifier(&value) == RetryAction::Abort || attempt >= total_attempts {
            return value;
        }

        let delay = config.delay_for_retry(attempt - 1);
        tracing::warn!(
            "Retryable outcome (attempt {}/{}), retrying in {}ms",
            attempt,
            total_attempts,
            delay.as_millis(),
        );
        tokio::time::sleep(delay).await;
    }
}
