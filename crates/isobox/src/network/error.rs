//! Network ACL error types.

use thiserror::Error;

/// Result type for network ACL operations.
pub type NetworkResult<T> = Result<T, NetworkError>;

/// Errors that can occur while managing network ACLs.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// The ACL command failed.
    #[error("network acl {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// ACL or container was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetworkError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, NetworkError::NotFound(_))
    }
}
