//! Session record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::network::NetworkMode;

/// Durable metadata for one session container.
///
/// Created with `persistent = false`; only an explicit persist action flips it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Unique session ID (UUID v4).
    pub session_id: String,
    /// Runtime container name, the lookup key.
    pub container_name: String,
    /// Absolute host workspace path.
    pub workspace_path: PathBuf,
    /// Slot within the workspace.
    #[serde(default)]
    pub slot: u32,
    /// Whether the container survives stop/shutdown.
    #[serde(default)]
    pub persistent: bool,
    /// Image the container was launched from.
    #[serde(default)]
    pub image: String,
    /// Network isolation applied at launch.
    #[serde(default)]
    pub network_mode: NetworkMode,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        container_name: impl Into<String>,
        workspace_path: impl Into<PathBuf>,
        slot: u32,
        image: impl Into<String>,
        network_mode: NetworkMode,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            container_name: container_name.into(),
            workspace_path: workspace_path.into(),
            slot,
            persistent: false,
            image: image.into(),
            network_mode,
            created_at: now,
            updated_at: now,
        }
    }
}
