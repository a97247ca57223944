//! Telemetry error types.

use thiserror::Error;

use crate::TraceId;

/// Telemetry errors.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The trace id was never started, or has already been ended.
    #[error("unknown trace: {0}")]
    UnknownTrace(TraceId),

    /// A span ends before it starts.
    #[error("invalid span '{name}': end precedes start")]
    InvalidSpan { name: String },

    /// The global log subscriber could not be installed.
    #[error("logging setup failed: {0}")]
    Logging(String),
}

pub type Result<T> = std::result::Result<T, Error>;
