//! Deterministic container names.
//!
//! A session container is named `<prefix>-<workspace-hash>-<slot>`. The hash
//! is derived from the lexically normalized absolute workspace path, so the
//! same workspace and slot always map to the same container while distinct
//! workspaces map to distinct names.

use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Hex digits of the workspace digest kept in container names.
pub const HASH_LEN: usize = 12;

/// Highest slot a workspace may use unless configured otherwise.
pub const DEFAULT_MAX_SLOTS: u32 = 10;

const MAX_PREFIX_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NamingError {
    #[error("invalid prefix '{0}': use lowercase letters, digits and '-', starting with a letter (max 32)")]
    InvalidPrefix(String),

    #[error("workspace path must be absolute: {0}")]
    RelativeWorkspace(String),

    #[error("slot {slot} out of range 1..={max}")]
    SlotOutOfRange { slot: u32, max: u32 },
}

/// Components of a container name produced by [`ContainerNamer::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    pub hash: String,
    pub slot: u32,
}

#[derive(Debug, Clone)]
pub struct ContainerNamer {
    prefix: String,
    max_slots: u32,
}

impl ContainerNamer {
    pub fn new(prefix: impl Into<String>, max_slots: u32) -> Result<Self, NamingError> {
        let prefix = prefix.into();
        validate_prefix(&prefix)?;
        Ok(Self {
            prefix,
            max_slots: max_slots.max(1),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn max_slots(&self) -> u32 {
        self.max_slots
    }

    /// Map (workspace, slot) to a container name.
    pub fn resolve(&self, workspace: &Path, slot: u32) -> Result<String, NamingError> {
        self.check_slot(slot)?;
        let hash = workspace_hash(workspace)?;
        Ok(format!("{}-{}-{}", self.prefix, hash, slot))
    }

    /// Every name a workspace can use, in slot order.
    pub fn candidates(&self, workspace: &Path) -> Result<Vec<(u32, String)>, NamingError> {
        let hash = workspace_hash(workspace)?;
        Ok((1..=self.max_slots)
            .map(|slot| (slot, format!("{}-{}-{}", self.prefix, hash, slot)))
            .collect())
    }

    /// Split a name produced by this namer. Returns `None` for foreign names.
    pub fn parse(&self, name: &str) -> Option<ParsedName> {
        let rest = name.strip_prefix(&self.prefix)?.strip_prefix('-')?;
        let (hash, slot) = rest.rsplit_once('-')?;
        if hash.len() != HASH_LEN || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        let slot: u32 = slot.parse().ok()?;
        if slot == 0 {
            return None;
        }
        Some(ParsedName {
            hash: hash.to_string(),
            slot,
        })
    }

    pub fn owns(&self, name: &str) -> bool {
        self.parse(name).is_some()
    }

    pub fn check_slot(&self, slot: u32) -> Result<(), NamingError> {
        if slot == 0 || slot > self.max_slots {
            return Err(NamingError::SlotOutOfRange {
                slot,
                max: self.max_slots,
            });
        }
        Ok(())
    }
}

/// Short hex digest identifying a workspace.
pub fn workspace_hash(workspace: &Path) -> Result<String, NamingError> {
    let normalized = normalize_workspace(workspace)?;
    let digest = Sha256::digest(normalized.as_os_str().as_encoded_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(HASH_LEN);
    Ok(hex)
}

/// Lexically normalize an absolute path: drops `.` segments, repeated and
/// trailing separators. Does not touch the filesystem, so `..` is kept.
pub fn normalize_workspace(workspace: &Path) -> Result<PathBuf, NamingError> {
    if !workspace.is_absolute() {
        return Err(NamingError::RelativeWorkspace(
            workspace.display().to_string(),
        ));
    }
    Ok(workspace
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect())
}

pub fn validate_prefix(prefix: &str) -> Result<(), NamingError> {
    let valid = !prefix.is_empty()
        && prefix.len() <= MAX_PREFIX_LEN
        && prefix.starts_with(|c: char| c.is_ascii_lowercase())
        && !prefix.ends_with('-')
        && prefix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid {
        return Err(NamingError::InvalidPrefix(prefix.to_string()));
    }
    Ok(())
}
