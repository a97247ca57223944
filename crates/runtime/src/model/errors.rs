use std::time::Duration;

use thiserror::Error;

/// Errors from model provider calls.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum ModelError {
    /// A network error occurred during the API call.
    #[error("network: {0}")]
    Network(String),

    /// The provider returned an error response.
    #[error("provider api ({status}): {body}")]
    Api { status: u16, body: String },

    /// The provider rejected the call for exceeding its quota.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// No response arrived within the allotted time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The provider response could not be parsed.
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

impl ModelError {
    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::RateLimited(_) | Self::Timeout(_)
        )
    }
}
