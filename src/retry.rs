//! Bounded exponential backoff for calls to embedding and store backends.

use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::{RagError, RagResult};

/// Retry budget and per-call timeout for one class of backend call.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms.max(config.base_delay_ms)),
            call_timeout: Duration::from_millis(config.call_timeout_ms),
        }
    }

    /// Single attempt, no delay. Used by tests and best-effort cleanup.
    pub fn once(call_timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            call_timeout,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = self.max_delay.max(base_delay);
        self
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`, capped.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent. Every attempt is bounded by `call_timeout`.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> RagResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = RagResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let outcome = match tokio::time::timeout(policy.call_timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(RagError::Timeout {
                operation: operation.to_string(),
                elapsed_ms: policy.call_timeout.as_millis() as u64,
            }),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    target: "retry",
                    "{operation} failed (attempt {attempt}/{}): {err}; retrying in {}ms",
                    policy.max_attempts,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
