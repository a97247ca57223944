//! CLI error types.

use thiserror::Error;

use crate::config::ConfigError;

/// CLI errors.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration is invalid or missing required fields.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The run ended with an error event.
    #[error("run {session} failed: {message}")]
    RunFailed { session: String, message: String },

    /// Memory content given on the command line is not valid JSON.
    #[error("memory content is not valid JSON: {0}")]
    InvalidContent(serde_json::Error),

    /// The memory file holds rows that no longer decode.
    #[error("{0} corrupt memory record(s)")]
    Corrupted(usize),

    /// An error occurred in the runtime layer.
    #[error(transparent)]
    Runtime(#[from] runtime::Error),

    /// An error occurred in the memory bank.
    #[error(transparent)]
    Memory(#[from] storage::MemoryError),

    /// Logging could not be installed.
    #[error(transparent)]
    Telemetry(#[from] telemetry::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
