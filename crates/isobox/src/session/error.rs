//! Session store error types.

use thiserror::Error;

/// Result type for session store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while reading or writing session records.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A valid record already exists for this container.
    #[error("session already exists: {0}")]
    AlreadyExists(String),

    /// No record for this container.
    #[error("session not found: {0}")]
    NotFound(String),

    /// Container name cannot be used as a record key.
    #[error("invalid session name: {0}")]
    InvalidName(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Record could not be encoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
