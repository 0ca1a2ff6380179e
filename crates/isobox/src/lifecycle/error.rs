//! Lifecycle error types.

use thiserror::Error;

use crate::container::ContainerError;
use crate::naming::NamingError;
use crate::network::NetworkError;
use crate::session::StoreError;

/// Result type for lifecycle operations.
pub type LifecycleResult<T> = Result<T, LifecycleError>;

#[derive(Debug, Error)]
pub enum LifecycleError {
    /// No container (or record) with this name.
    #[error("container not found: {0}")]
    NotFound(String),

    /// The operation conflicts with the container's current state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The container is running and the operation needs it stopped.
    #[error("container {0} is running; stop it first or use --force")]
    StillRunning(String),

    /// Every slot of the workspace is taken.
    #[error("no free slot for workspace {workspace} (max {max})")]
    NoFreeSlot { workspace: String, max: u32 },

    /// Bad arguments, rejected before any side effect.
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Runtime(ContainerError),

    #[error("session store error: {0}")]
    Store(StoreError),

    #[error("network ACL error: {0}")]
    Network(#[from] NetworkError),
}

impl From<ContainerError> for LifecycleError {
    fn from(err: ContainerError) -> Self {
        match err {
            ContainerError::NotFound(name) => LifecycleError::NotFound(name),
            ContainerError::InvalidInput(message) => LifecycleError::Validation(message),
            other => LifecycleError::Runtime(other),
        }
    }
}

impl From<StoreError> for LifecycleError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(name) => LifecycleError::NotFound(name),
            StoreError::InvalidName(name) => {
                LifecycleError::Validation(format!("invalid container name: {}", name))
            }
            other => LifecycleError::Store(other),
        }
    }
}

impl From<NamingError> for LifecycleError {
    fn from(err: NamingError) -> Self {
        LifecycleError::Validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_not_found_maps_to_not_found() {
        let err: LifecycleError = ContainerError::NotFound("c1".into()).into();
        assert!(matches!(err, LifecycleError::NotFound(ref n) if n == "c1"));

        let err: LifecycleError = ContainerError::CommandFailed {
            command: "stop".into(),
            message: "denied".into(),
        }
        .into();
        assert!(matches!(err, LifecycleError::Runtime(_)));
        assert_eq!(err.to_string(), "container stop failed: denied");
    }

    #[test]
    fn test_naming_errors_are_validation() {
        let err: LifecycleError = NamingError::SlotOutOfRange { slot: 0, max: 10 }.into();
        assert!(matches!(err, LifecycleError::Validation(_)));
    }
}
