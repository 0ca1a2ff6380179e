//! Requests and outcomes of lifecycle operations.

use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

use super::LifecycleError;
use crate::container::{ContainerStatus, ExecOutput};
use crate::network::NetworkMode;
use crate::session::Session;

/// Defaults applied when a request leaves a field unset.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub image: String,
    /// Where the workspace appears inside the container.
    pub workspace_mount: String,
    pub network_mode: NetworkMode,
    pub shutdown_timeout: Duration,
    /// Records younger than this are never treated as stale, so a launch
    /// in flight in another process is left alone.
    pub stale_record_grace: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            image: "images:ubuntu/24.04".to_string(),
            workspace_mount: "/workspace".to_string(),
            network_mode: NetworkMode::Open,
            shutdown_timeout: Duration::from_secs(60),
            stale_record_grace: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LaunchRequest {
    pub workspace: PathBuf,
    /// Explicit container name; derived from workspace and slot otherwise.
    pub name: Option<String>,
    pub slot: Option<u32>,
    pub image: Option<String>,
    pub network: Option<NetworkMode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOutcome {
    pub name: String,
    /// An existing stopped container was started instead of a new one.
    pub resumed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub workspace: PathBuf,
    /// Slot to use; the first free slot when unset.
    pub slot: Option<u32>,
    pub image: Option<String>,
    pub network: Option<NetworkMode>,
    /// Keep the container after the command exits.
    pub persistent: bool,
    pub command: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub name: String,
    pub output: ExecOutput,
    /// Whether this run created (or resumed) the container.
    pub launched: bool,
    /// Cleanup performed after the command, `None` for a reused container.
    pub stop: Option<StopReport<StopOutcome>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    AlreadyStopped,
    /// The container no longer exists.
    Absent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Stopped within the timeout, including stopping on its own.
    Graceful,
    /// Still running at the deadline and force-killed.
    Forced,
    AlreadyStopped,
    Absent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    Killed,
    AlreadyStopped,
    Absent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Persisted,
    AlreadyPersistent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    Absent,
}

/// Result of a stop-like operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopReport<O> {
    pub outcome: O,
    /// The non-persistent session was removed (ACLs, container, record).
    pub torn_down: bool,
}

/// Per-container results of an `--all` operation.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, LifecycleError)>,
}

impl BatchReport {
    pub fn is_empty(&self) -> bool {
        self.succeeded.is_empty() && self.failed.is_empty()
    }
}

/// A session record with the live state of its container.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    #[serde(flatten)]
    pub session: Session,
    /// `None` when the container no longer exists.
    pub status: Option<ContainerStatus>,
}
