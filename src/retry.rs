//! Bounded exponential backoff for provider calls.
//!
//! A call is retried only when its [`ProviderError::is_retryable`] says so
//! (429, 5xx, transport failures, timeouts). Delays double per attempt
//! starting from `base`: `base, 2·base, 4·base, ...`, capped at `32·base`.

use std::future::Future;
use std::time::Duration;

use opinion_themes_core::error::ProviderError;
use tracing::warn;

use crate::config::EmbeddingConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base: Duration::ZERO,
        }
    }

    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base: Duration::from_millis(config.retry_base_ms),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base * (1u32 << (attempt.saturating_sub(1)).min(5))
    }
}

/// Run `call` until it succeeds, fails with a non-retryable error, or the
/// policy's retries are used up. Returns the last error.
pub async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    operation: &str,
    mut call: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                attempt += 1;
                let delay = policy.delay(attempt);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "provider call failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
