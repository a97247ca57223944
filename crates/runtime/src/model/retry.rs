//! Timeout and bounded retry around a single model call.

use std::time::Duration;

use super::{ModelClient, ModelError, ModelRequest, ModelResponse};

/// How a leaf agent calls its model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallPolicy {
    /// Per-attempt deadline.
    pub timeout: Duration,
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles for each one after.
    pub backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            max_attempts: 3,
            backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl CallPolicy {
    /// A single attempt with the given deadline.
    pub fn once(timeout: Duration) -> Self {
        Self {
            timeout,
            max_attempts: 1,
            ..Self::default()
        }
    }

    fn delay(&self, retry: u32) -> Duration {
        let multiplier = 1_u32 << retry.min(16);
        self.backoff.saturating_mul(multiplier).min(self.max_backoff)
    }

    /// Call the model, retrying transient failures with exponential backoff.
    pub async fn call(
        &self,
        client: &dyn ModelClient,
        request: &ModelRequest,
    ) -> Result<ModelResponse, ModelError> {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let outcome = tokio::time::timeout(self.timeout, client.generate(request.clone()))
                .await
                .unwrap_or(Err(ModelError::Timeout(self.timeout)));

            let error = match outcome {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };
            if !error.is_retryable() || attempt >= attempts {
                return Err(error);
            }

            let delay = self.delay(attempt - 1);
            tracing::warn!(
                agent = %request.agent,
                provider = client.name(),
                attempt,
                max_attempts = attempts,
                error = %error,
                ?delay,
                "model call failed, retrying"
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            attempt += 1;
        }
    }
}
