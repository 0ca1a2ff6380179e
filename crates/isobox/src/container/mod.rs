//! Container runtime management module.
//!
//! Provides an async interface over the Incus CLI. Every lifecycle decision is
//! made elsewhere; this layer only issues runtime commands and reports what
//! the runtime said.

mod container;
mod error;

pub use container::{
    ContainerInfo, ContainerStatus, ExecOutput, LaunchConfig, StopMode, WorkspaceMount,
    validate_container_name, validate_image_name,
};
pub use error::{AbsorbNotFound, ContainerError, ContainerResult};

use async_trait::async_trait;
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::{debug, warn};

/// Default runtime binary.
pub const DEFAULT_BINARY: &str = "incus";

/// Container runtime abstraction for testability.
#[async_trait]
pub trait ContainerRuntimeApi: Send + Sync {
    /// Create a stopped container with its workspace attached.
    async fn create(&self, config: &LaunchConfig) -> ContainerResult<()>;
    async fn start(&self, name: &str) -> ContainerResult<()>;
    /// Stop a container. Stopping an already stopped container succeeds.
    async fn stop(&self, name: &str, mode: StopMode) -> ContainerResult<()>;
    async fn delete(&self, name: &str, force: bool) -> ContainerResult<()>;
    /// Live state of a container, `Ok(None)` when it does not exist.
    async fn inspect(&self, name: &str) -> ContainerResult<Option<ContainerInfo>>;
    /// Containers whose names start with `<prefix>-`.
    async fn list(&self, prefix: &str) -> ContainerResult<Vec<ContainerInfo>>;
    async fn exec(
        &self,
        name: &str,
        command: &[String],
        cwd: Option<&str>,
    ) -> ContainerResult<ExecOutput>;

    async fn exists(&self, name: &str) -> ContainerResult<bool> {
        Ok(self.inspect(name).await?.is_some())
    }

    async fn running(&self, name: &str) -> ContainerResult<bool> {
        Ok(self
            .inspect(name)
            .await?
            .is_some_and(|info| info.is_running()))
    }
}

/// Container runtime client driving the `incus` binary.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    /// Path to the runtime binary
    binary: String,
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::new(DEFAULT_BINARY)
    }
}

impl ContainerRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Check that the runtime is reachable and return its version string.
    pub async fn health_check(&self) -> ContainerResult<String> {
        let output = self.output("version", &["version"]).await?;

        if !output.status.success() {
            return Err(command_failed("version", &output));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn output<S: AsRef<std::ffi::OsStr>>(
        &self,
        command: &str,
        args: &[S],
    ) -> ContainerResult<Output> {
        debug!(
            "{} {}",
            self.binary,
            args.iter()
                .map(|a| a.as_ref().to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: command.to_string(),
                message: e.to_string(),
            })
    }

    /// Run a command that produces no useful stdout, classifying failures.
    async fn run(&self, command: &str, name: &str, args: &[String]) -> ContainerResult<()> {
        let output = self.output(command, args).await?;
        if output.status.success() {
            return Ok(());
        }
        Err(classify_failure(command, name, &output))
    }

    async fn query(&self, filter: &str) -> ContainerResult<Vec<ContainerInfo>> {
        let output = self
            .output("list", &["list", filter, "--format", "json"])
            .await?;

        if !output.status.success() {
            return Err(command_failed("list", &output));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Ok(vec![]);
        }

        serde_json::from_str(&stdout).map_err(|e| ContainerError::ParseError(e.to_string()))
    }
}

#[async_trait]
impl ContainerRuntimeApi for ContainerRuntime {
    async fn create(&self, config: &LaunchConfig) -> ContainerResult<()> {
        config.validate()?;

        let args = vec!["init".to_string(), config.image.clone(), config.name.clone()];
        // "not found" here refers to the image, not the container.
        let output = self.output("init", &args).await?;
        if !output.status.success() {
            return Err(command_failed("init", &output));
        }

        if let Some(ref mount) = config.workspace {
            let device = vec![
                "config".to_string(),
                "device".to_string(),
                "add".to_string(),
                config.name.clone(),
                "workspace".to_string(),
                "disk".to_string(),
                format!("source={}", mount.source),
                format!("path={}", mount.path),
                "shift=true".to_string(),
            ];
            if let Err(e) = self.run("config device add", &config.name, &device).await {
                warn!("workspace setup of {} failed, removing partial container: {}", config.name, e);
                if let Err(cleanup) = self.delete(&config.name, true).await.absorb_not_found() {
                    warn!("failed to remove partial container {}: {}", config.name, cleanup);
                }
                return Err(e);
            }
        }

        Ok(())
    }

    async fn start(&self, name: &str) -> ContainerResult<()> {
        validate_container_name(name)?;
        self.run("start", name, &["start".to_string(), name.to_string()])
            .await
    }

    async fn stop(&self, name: &str, mode: StopMode) -> ContainerResult<()> {
        validate_container_name(name)?;

        let mut args = vec!["stop".to_string(), name.to_string()];
        match mode {
            StopMode::Force => args.push("--force".to_string()),
            StopMode::Graceful { timeout: Some(t) } => {
                args.push("--timeout".to_string());
                args.push(t.as_secs().max(1).to_string());
            }
            StopMode::Graceful { timeout: None } => {}
        }

        match self.run("stop", name, &args).await {
            Err(ContainerError::CommandFailed { ref message, .. }) if is_already_stopped(message) => {
                debug!("container {} was already stopped", name);
                Ok(())
            }
            other => other,
        }
    }

    async fn delete(&self, name: &str, force: bool) -> ContainerResult<()> {
        validate_container_name(name)?;

        let mut args = vec!["delete".to_string(), name.to_string()];
        if force {
            args.push("--force".to_string());
        }
        self.run("delete", name, &args).await
    }

    async fn inspect(&self, name: &str) -> ContainerResult<Option<ContainerInfo>> {
        validate_container_name(name)?;

        let infos = self.query(&format!("^{}$", name)).await?;
        Ok(infos.into_iter().find(|info| info.name == name))
    }

    async fn list(&self, prefix: &str) -> ContainerResult<Vec<ContainerInfo>> {
        validate_container_name(prefix)?;

        let needle = format!("{}-", prefix);
        let infos = self.query(&format!("^{}", needle)).await?;
        Ok(infos
            .into_iter()
            .filter(|info| info.name.starts_with(&needle))
            .collect())
    }

    async fn exec(
        &self,
        name: &str,
        command: &[String],
        cwd: Option<&str>,
    ) -> ContainerResult<ExecOutput> {
        validate_container_name(name)?;
        if command.is_empty() {
            return Err(ContainerError::InvalidInput(
                "exec requires a command".to_string(),
            ));
        }

        let mut args = vec!["exec".to_string(), name.to_string()];
        if let Some(dir) = cwd {
            args.push("--cwd".to_string());
            args.push(dir.to_string());
        }
        args.push("--".to_string());
        args.extend(command.iter().cloned());

        let output = self.output("exec", &args).await?;
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        // Failures of incus itself are reported with an "Error:" line; anything
        // else is the command's own exit status.
        if !output.status.success() && stderr.starts_with("Error:") {
            return Err(classify_failure("exec", name, &output));
        }

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

fn command_failed(command: &str, output: &Output) -> ContainerError {
    ContainerError::CommandFailed {
        command: command.to_string(),
        message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
}

/// Map a failed runtime invocation to a typed error.
fn classify_failure(command: &str, name: &str, output: &Output) -> ContainerError {
    let stderr = String::from_utf8_lossy(&output.stderr);
    if is_not_found(&stderr) {
        return ContainerError::NotFound(name.to_string());
    }
    command_failed(command, output)
}

fn is_not_found(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("not found") || lower.contains("no such")
}

fn is_already_stopped(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("already stopped") || lower.contains("instance is not running")
}
