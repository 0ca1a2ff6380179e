//! Application configuration and paths.
//!
//! Layered as: built-in defaults, then `config.toml`, then `ISOBOX__*`
//! environment variables.

use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::container::{self, ContainerRuntime};
use crate::lifecycle::{LifecycleConfig, LifecycleController};
use crate::naming::{self, ContainerNamer};
use crate::network::{self, AclConfig, AclManager, IncusAclController, NetworkMode};
use crate::session::SessionStore;

pub const APP_NAME: &str = "isobox";

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub config_file: PathBuf,
    pub data_dir: PathBuf,
    pub state_dir: PathBuf,
    pub sessions_dir: PathBuf,
}

impl AppPaths {
    pub fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        let data_dir = default_data_dir()?;
        let state_dir = default_state_dir()?;
        let sessions_dir = data_dir.join("sessions");

        Ok(Self {
            config_file,
            data_dir,
            state_dir,
            sessions_dir,
        })
    }

    pub fn apply_overrides(mut self, cfg: &AppConfig) -> Result<Self> {
        if let Some(ref data_override) = cfg.paths.data_dir {
            self.data_dir = expand_str_path(data_override)?;
            self.sessions_dir = self.data_dir.join("sessions");
        }
        if let Some(ref state_override) = cfg.paths.state_dir {
            self.state_dir = expand_str_path(state_override)?;
        }
        if let Some(ref sessions_override) = cfg.paths.sessions_dir {
            self.sessions_dir = expand_str_path(sessions_override)?;
        }
        Ok(self)
    }
}

impl fmt::Display for AppPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "config: {}, data: {}, state: {}, sessions: {}",
            self.config_file.display(),
            self.data_dir.display(),
            self.state_dir.display(),
            self.sessions_dir.display()
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub paths: PathsConfig,
    pub runtime: RuntimeConfig,
    pub naming: NamingConfig,
    pub lifecycle: LifecycleSettings,
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: Option<String>,
    pub state_dir: Option<String>,
    pub sessions_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Runtime CLI binary.
    pub binary: String,
    pub default_image: String,
    /// Workspace mount point inside containers.
    pub workspace_mount: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let lifecycle = LifecycleConfig::default();
        Self {
            binary: container::DEFAULT_BINARY.to_string(),
            default_image: lifecycle.image,
            workspace_mount: lifecycle.workspace_mount,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingConfig {
    pub prefix: String,
    pub max_slots: u32,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            prefix: APP_NAME.to_string(),
            max_slots: naming::DEFAULT_MAX_SLOTS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSettings {
    pub shutdown_timeout_secs: u64,
    pub stale_record_grace_secs: u64,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        let lifecycle = LifecycleConfig::default();
        Self {
            shutdown_timeout_secs: lifecycle.shutdown_timeout.as_secs(),
            stale_record_grace_secs: lifecycle.stale_record_grace.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Isolation applied when a command does not pass `--network`.
    pub mode: NetworkMode,
    /// ACL name prefix, the naming prefix when unset.
    pub acl_prefix: Option<String>,
    pub nic: String,
    pub settle_ms: u64,
    pub blocked: Vec<String>,
    pub allowlist: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        let acl = AclConfig::default();
        Self {
            mode: NetworkMode::default(),
            acl_prefix: None,
            nic: acl.nic,
            settle_ms: acl.settle.as_millis() as u64,
            blocked: acl.blocked,
            allowlist: acl.allowlist,
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        naming::validate_prefix(&self.naming.prefix).context("naming.prefix")?;
        if let Some(ref prefix) = self.network.acl_prefix {
            naming::validate_prefix(prefix).context("network.acl_prefix")?;
        }
        if self.naming.max_slots == 0 {
            return Err(anyhow!("naming.max_slots must be at least 1"));
        }
        container::validate_image_name(&self.runtime.default_image)
            .context("runtime.default_image")?;
        if self.network.mode == NetworkMode::Allowlist && self.network.allowlist.is_empty() {
            warn!("network.mode is allowlist but network.allowlist is empty; all egress will be rejected");
        }
        Ok(())
    }

    pub fn namer(&self) -> Result<ContainerNamer> {
        Ok(ContainerNamer::new(
            self.naming.prefix.clone(),
            self.naming.max_slots,
        )?)
    }

    pub fn lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            image: self.runtime.default_image.clone(),
            workspace_mount: self.runtime.workspace_mount.clone(),
            network_mode: self.network.mode,
            shutdown_timeout: Duration::from_secs(self.lifecycle.shutdown_timeout_secs),
            stale_record_grace: Duration::from_secs(self.lifecycle.stale_record_grace_secs),
        }
    }

    pub fn acl_config(&self) -> AclConfig {
        AclConfig {
            prefix: self
                .network
                .acl_prefix
                .clone()
                .unwrap_or_else(|| self.naming.prefix.clone()),
            nic: self.network.nic.clone(),
            settle: Duration::from_millis(self.network.settle_ms),
            blocked: self.network.blocked.clone(),
            allowlist: self.network.allowlist.clone(),
        }
    }
}

/// Wire the lifecycle controller to the Incus CLI.
pub fn build_controller(config: &AppConfig, paths: &AppPaths) -> Result<LifecycleController> {
    config.validate()?;
    let runtime = Arc::new(ContainerRuntime::new(config.runtime.binary.clone()));
    let acls = Arc::new(IncusAclController::new(config.runtime.binary.clone()));
    Ok(LifecycleController::new(
        runtime,
        AclManager::new(acls, config.acl_config()),
        SessionStore::new(paths.sessions_dir.clone()),
        config.namer()?,
        config.lifecycle_config(),
    ))
}

pub fn load_or_init_config(paths: &AppPaths, dry_run: bool) -> Result<AppConfig> {
    if !paths.config_file.exists() {
        if dry_run {
            info!(
                "dry-run: would create default config at {}",
                paths.config_file.display()
            );
        } else {
            write_default_config(&paths.config_file)?;
        }
    }

    let env_prefix = env_prefix();
    let built = Config::builder()
        .set_default("logging.level", "info")?
        .set_default("naming.prefix", APP_NAME)?
        .add_source(
            File::from(paths.config_file.as_path())
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(env_prefix.as_str()).separator("__"))
        .build()?;

    let mut config: AppConfig = built.try_deserialize()?;

    if let Some(ref file) = config.logging.file {
        let expanded = expand_str_path(file)?;
        config.logging.file = Some(expanded.display().to_string());
    }

    Ok(config)
}

pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    let mut buffer = String::new();
    buffer.push_str("# Configuration for ");
    buffer.push_str(APP_NAME);
    buffer.push('\n');
    buffer.push_str("# File: ");
    buffer.push_str(&path.display().to_string());
    buffer.push('\n');
    buffer.push_str("# network.mode: open | restricted | allowlist\n");
    buffer.push('\n');
    buffer
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

pub fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::data_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("share").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine data directory"))
}

fn default_state_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_STATE_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::state_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("state").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine state directory"))
}

pub fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
