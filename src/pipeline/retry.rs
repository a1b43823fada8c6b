//! Bounded retry with exponential backoff for provider rate limits.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::PipelineConfig;
use crate::error::ProviderError;

/// Retry policy for rate-limited provider calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_retries: config.max_rate_limit_retries,
            base_delay: config.retry_base_delay,
            max_delay: config.retry_max_delay,
        }
    }

    /// Delay before retry number `attempt` (0-based).
    ///
    /// Half the exponential delay is fixed and half is random. A provider
    /// `Retry-After` hint raises the floor, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        let half = exp / 2;
        let jitter_ms = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
        let delay = half + Duration::from_millis(jitter_ms);

        match retry_after {
            Some(hint) => delay.max(hint).min(self.max_delay),
            None => delay,
        }
    }
}

/// Run `op`, retrying on `ProviderError::RateLimited` up to the policy bound.
///
/// Any other error is returned immediately. Cancellation during a backoff
/// sleep returns the last rate-limit error without another attempt.
pub async fn with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(ProviderError::RateLimited {
                provider,
                retry_after,
            }) if attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt, retry_after);
                warn!(
                    provider = %provider,
                    attempt = attempt + 1,
                    max = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "Rate limited, backing off"
                );
                attempt += 1;
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(ProviderError::RateLimited { provider, retry_after });
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            other => return other,
        }
    }
}
