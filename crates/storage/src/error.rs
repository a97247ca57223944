use thiserror::Error;

use crate::SessionKey;

/// Session Store contract violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(SessionKey),

    #[error("session already exists: {0}")]
    Duplicate(SessionKey),

    #[error("session busy: {0} already has an active run")]
    Busy(SessionKey),
}

/// Memory Bank errors.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A persisted record could not be decoded. Reads skip it and go on.
    #[error("corrupt memory record at position {seq}: {reason}")]
    Corrupted { seq: i64, reason: String },
}

pub type Result<T, E = MemoryError> = std::result::Result<T, E>;
