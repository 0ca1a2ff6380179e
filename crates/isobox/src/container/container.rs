//! Container types and configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::{ContainerError, ContainerResult};

/// Host directory shared into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceMount {
    /// Absolute host path.
    pub source: String,
    /// Absolute path inside the container.
    pub path: String,
}

/// Configuration for creating a new container.
///
/// Containers are never created ephemeral at the runtime level: whether a
/// stopped session is deleted is decided from its session record.
#[derive(Debug, Clone, Default)]
pub struct LaunchConfig {
    /// Container name.
    pub name: String,
    /// Image to create from (e.g. `images:ubuntu/24.04`).
    pub image: String,
    /// Workspace shared into the container.
    pub workspace: Option<WorkspaceMount>,
}

impl LaunchConfig {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Default::default()
        }
    }

    /// Validate all launch fields before any runtime command is built.
    pub fn validate(&self) -> ContainerResult<()> {
        validate_container_name(&self.name)?;
        validate_image_name(&self.image)?;

        if let Some(ref mount) = self.workspace {
            validate_host_path(&mount.source)?;
            validate_container_path(&mount.path)?;
        }

        Ok(())
    }

    pub fn workspace(mut self, source: impl Into<String>, path: impl Into<String>) -> Self {
        self.workspace = Some(WorkspaceMount {
            source: source.into(),
            path: path.into(),
        });
        self
    }
}

/// Runtime status of an instance, as reported by `incus list --format json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerStatus {
    Running,
    Stopped,
    Frozen,
    Error,
    #[serde(other)]
    Unknown,
}

impl ContainerStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ContainerStatus::Running)
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerStatus::Running => write!(f, "running"),
            ContainerStatus::Stopped => write!(f, "stopped"),
            ContainerStatus::Frozen => write!(f, "frozen"),
            ContainerStatus::Error => write!(f, "error"),
            ContainerStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Live view of one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub name: String,
    pub status: ContainerStatus,
}

impl ContainerInfo {
    pub fn is_running(&self) -> bool {
        self.status.is_running()
    }
}

/// How a stop request is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Ask the init system to shut down, optionally bounded by the runtime.
    Graceful { timeout: Option<Duration> },
    /// Kill immediately.
    Force,
}

/// Captured result of a command executed inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Validate an image reference.
///
/// Accepts remote-qualified aliases and fingerprints:
/// - `ubuntu/24.04`
/// - `images:debian/12`
/// - `local:isobox-base`
pub fn validate_image_name(image: &str) -> ContainerResult<()> {
    if image.is_empty() {
        return Err(ContainerError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }

    if image.len() > 256 {
        return Err(ContainerError::InvalidInput(
            "image name exceeds maximum length of 256 characters".to_string(),
        ));
    }

    let valid_chars = |c: char| {
        c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' || c == '/' || c == ':'
    };

    if !image.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "image name '{}' contains invalid characters; only alphanumeric, '.', '-', '_', '/', ':' are allowed",
            image
        )));
    }

    if image.contains("..") {
        return Err(ContainerError::InvalidInput(
            "image name cannot contain '..'".to_string(),
        ));
    }

    Ok(())
}

/// Validate a container name.
///
/// Instance names are DNS labels: ASCII letters, digits and hyphens, starting
/// with a letter, not ending with a hyphen, at most 63 characters.
pub fn validate_container_name(name: &str) -> ContainerResult<()> {
    if name.is_empty() {
        return Err(ContainerError::InvalidInput(
            "container name cannot be empty".to_string(),
        ));
    }

    if name.len() > 63 {
        return Err(ContainerError::InvalidInput(
            "container name exceeds maximum length of 63 characters".to_string(),
        ));
    }

    if !name.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return Err(ContainerError::InvalidInput(
            "container name must start with a letter".to_string(),
        ));
    }

    if name.ends_with('-') {
        return Err(ContainerError::InvalidInput(
            "container name cannot end with '-'".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-';
    if !name.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "container name '{}' contains invalid characters; only alphanumeric and '-' are allowed",
            name
        )));
    }

    Ok(())
}

fn validate_host_path(path: &str) -> ContainerResult<()> {
    if !path.starts_with('/') {
        return Err(ContainerError::InvalidInput(format!(
            "workspace path '{}' must be absolute",
            path
        )));
    }

    if path.contains('\0') || path.contains('\n') {
        return Err(ContainerError::InvalidInput(
            "workspace path contains control characters".to_string(),
        ));
    }

    // Device options are passed as key=value pairs.
    if path.contains('=') {
        return Err(ContainerError::InvalidInput(format!(
            "workspace path '{}' cannot contain '='",
            path
        )));
    }

    Ok(())
}

fn validate_container_path(path: &str) -> ContainerResult<()> {
    if !path.starts_with('/') {
        return Err(ContainerError::InvalidInput(
            "container path must be absolute (start with '/')".to_string(),
        ));
    }

    if path.contains('\0') || path.contains('=') {
        return Err(ContainerError::InvalidInput(format!(
            "container path '{}' contains invalid characters",
            path
        )));
    }

    Ok(())
}

#[cfg(test)]
mod validation_tests {
    use super::*;

    #[test]
    fn test_validate_image_name_valid() {
        assert!(validate_image_name("ubuntu/24.04").is_ok());
        assert!(validate_image_name("images:debian/12").is_ok());
        assert!(validate_image_name("local:isobox-base").is_ok());
        assert!(validate_image_name("a1b2c3d4e5f6").is_ok());
    }

    #[test]
    fn test_validate_image_name_invalid() {
        assert!(validate_image_name("").is_err());
        assert!(validate_image_name("image with spaces").is_err());
        assert!(validate_image_name("image;rm -rf /").is_err());
        assert!(validate_image_name("image$(whoami)").is_err());
        assert!(validate_image_name("../../../etc/passwd").is_err());
    }

    #[test]
    fn test_validate_container_name_valid() {
        assert!(validate_container_name("isobox-1a2b3c4d5e6f-1").is_ok());
        assert!(validate_container_name("dev").is_ok());
        assert!(validate_container_name("a").is_ok());
    }

    #[test]
    fn test_validate_container_name_invalid() {
        assert!(validate_container_name("").is_err());
        assert!(validate_container_name("1-starts-with-digit").is_err());
        assert!(validate_container_name("-starts-with-dash").is_err());
        assert!(validate_container_name("ends-with-dash-").is_err());
        assert!(validate_container_name("under_score").is_err());
        assert!(validate_container_name("contains spaces").is_err());
        assert!(validate_container_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_launch_config_validate() {
        let config = LaunchConfig::new("isobox-abc-1", "images:ubuntu/24.04")
            .workspace("/home/dev/project", "/workspace");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_launch_config_validate_invalid_workspace() {
        let relative = LaunchConfig::new("isobox-abc-1", "ubuntu/24.04").workspace("project", "/workspace");
        assert!(relative.validate().is_err());

        let with_equals =
            LaunchConfig::new("isobox-abc-1", "ubuntu/24.04").workspace("/tmp/a=b", "/workspace");
        assert!(with_equals.validate().is_err());
    }

    #[test]
    fn test_container_info_from_incus_json() {
        let json = r#"[{"name":"isobox-abc-1","status":"Running","ephemeral":true,"type":"container"},
                       {"name":"isobox-abc-2","status":"Starting","ephemeral":false}]"#;
        let infos: Vec<ContainerInfo> = serde_json::from_str(json).unwrap();
        assert_eq!(infos.len(), 2);
        assert!(infos[0].is_running());
        assert_eq!(infos[0].name, "isobox-abc-1");
        assert_eq!(infos[1].status, ContainerStatus::Unknown);
    }
}
