//! Container runtime error types.

use thiserror::Error;

/// Result type for container operations.
pub type ContainerResult<T> = Result<T, ContainerError>;

/// Errors that can occur during container operations.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The runtime command failed.
    #[error("container {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// Container was not found.
    #[error("container not found: {0}")]
    NotFound(String),

    /// Failed to parse runtime output.
    #[error("failed to parse container output: {0}")]
    ParseError(String),

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ContainerError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ContainerError::NotFound(_))
    }
}

/// Treats a missing container as a completed operation.
///
/// Returns `Ok(true)` when the operation ran, `Ok(false)` when the container
/// was already gone.
pub trait AbsorbNotFound {
    fn absorb_not_found(self) -> ContainerResult<bool>;
}

impl AbsorbNotFound for ContainerResult<()> {
    fn absorb_not_found(self) -> ContainerResult<bool> {
        match self {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absorb_not_found() {
        assert!(Ok(()).absorb_not_found().unwrap());
        let missing: ContainerResult<()> = Err(ContainerError::NotFound("c1".into()));
        assert!(!missing.absorb_not_found().unwrap());
        let failed: ContainerResult<()> = Err(ContainerError::CommandFailed {
            command: "stop".into(),
            message: "boom".into(),
        });
        assert!(failed.absorb_not_found().is_err());
    }
}
