//! Per-container network isolation through named runtime ACLs.
//!
//! A container has at most one ACL per [`AclMode`], named
//! `<prefix>-<container>-<mode>`. Every operation checks before it acts, so
//! repeated calls and calls for containers without ACLs succeed. The runtime
//! applies ACL changes asynchronously: after a removal, callers that need the
//! change to be visible wait [`AclManager::settle`].

mod controller;
mod error;

pub use controller::{AclController, AclRule, IncusAclController, RuleAction};
pub use error::{NetworkError, NetworkResult};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Private and link-local ranges rejected in restricted mode.
pub const DEFAULT_BLOCKED_RANGES: &[&str] = &[
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "169.254.0.0/16",
    "fc00::/7",
    "fe80::/10",
];

/// Network isolation requested for a session.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// No ACL attached.
    #[default]
    Open,
    /// Private ranges rejected, everything else allowed.
    Restricted,
    /// Only configured destinations allowed.
    Allowlist,
}

impl NetworkMode {
    pub fn acl_mode(&self) -> Option<AclMode> {
        match self {
            NetworkMode::Open => None,
            NetworkMode::Restricted => Some(AclMode::Restricted),
            NetworkMode::Allowlist => Some(AclMode::Allowlist),
        }
    }
}

impl std::fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkMode::Open => write!(f, "open"),
            NetworkMode::Restricted => write!(f, "restricted"),
            NetworkMode::Allowlist => write!(f, "allowlist"),
        }
    }
}

/// Kind of ACL object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclMode {
    Restricted,
    Allowlist,
}

impl AclMode {
    pub const ALL: [AclMode; 2] = [AclMode::Restricted, AclMode::Allowlist];

    pub fn as_str(&self) -> &'static str {
        match self {
            AclMode::Restricted => "restricted",
            AclMode::Allowlist => "allowlist",
        }
    }

    pub fn other(&self) -> AclMode {
        match self {
            AclMode::Restricted => AclMode::Allowlist,
            AclMode::Allowlist => AclMode::Restricted,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AclConfig {
    /// Leading component of every ACL name.
    pub prefix: String,
    /// Container NIC the ACL binds to.
    pub nic: String,
    /// Wait after removals for the runtime to converge.
    pub settle: Duration,
    /// Destinations rejected in restricted mode.
    pub blocked: Vec<String>,
    /// Destinations allowed in allowlist mode.
    pub allowlist: Vec<String>,
}

impl Default for AclConfig {
    fn default() -> Self {
        Self {
            prefix: "isobox".to_string(),
            nic: "eth0".to_string(),
            settle: Duration::from_secs(2),
            blocked: DEFAULT_BLOCKED_RANGES.iter().map(|s| s.to_string()).collect(),
            allowlist: Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct AclManager {
    controller: Arc<dyn AclController>,
    config: AclConfig,
}

impl AclManager {
    pub fn new(controller: Arc<dyn AclController>, config: AclConfig) -> Self {
        Self { controller, config }
    }

    pub fn config(&self) -> &AclConfig {
        &self.config
    }

    pub fn acl_name(&self, container: &str, mode: AclMode) -> String {
        format!("{}-{}-{}", self.config.prefix, container, mode.as_str())
    }

    pub fn rules_for(&self, mode: AclMode) -> Vec<AclRule> {
        match mode {
            AclMode::Restricted => {
                let mut rules: Vec<AclRule> =
                    self.config.blocked.iter().map(AclRule::reject).collect();
                rules.push(AclRule::catch_all(RuleAction::Allow));
                rules
            }
            AclMode::Allowlist => {
                let mut rules: Vec<AclRule> =
                    self.config.allowlist.iter().map(AclRule::allow).collect();
                rules.push(AclRule::catch_all(RuleAction::Reject));
                rules
            }
        }
    }

    /// Create the ACL if missing and bind it to the container.
    pub async fn ensure(&self, container: &str, mode: AclMode) -> NetworkResult<String> {
        let acl = self.acl_name(container, mode);
        if self.controller.exists(&acl).await? {
            debug!("ACL {} already exists", acl);
        } else {
            self.controller.create(&acl, &self.rules_for(mode)).await?;
            info!("created ACL {}", acl);
        }
        self.controller
            .attach(container, &self.config.nic, &acl)
            .await?;
        Ok(acl)
    }

    /// Delete one ACL. Returns whether anything was removed.
    pub async fn remove(&self, container: &str, mode: AclMode) -> NetworkResult<bool> {
        let acl = self.acl_name(container, mode);
        if !self.controller.exists(&acl).await? {
            return Ok(false);
        }
        match self.controller.delete(&acl).await {
            Ok(()) => {
                info!("removed ACL {}", acl);
                Ok(true)
            }
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Detach and delete every ACL of a container. Returns how many were removed.
    pub async fn remove_all(&self, container: &str) -> NetworkResult<usize> {
        let mut present = Vec::new();
        for mode in AclMode::ALL {
            if self.controller.exists(&self.acl_name(container, mode)).await? {
                present.push(mode);
            }
        }
        if present.is_empty() {
            return Ok(0);
        }

        match self.controller.detach(container, &self.config.nic).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!("{} has no ACL binding to clear", container),
            Err(e) => return Err(e),
        }

        let mut removed = 0;
        for mode in present {
            if self.remove(container, mode).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Bring the container's ACLs in line with a network mode.
    ///
    /// On a mode switch the new ACL is attached before the old one is
    /// removed, so the container is never left without isolation.
    pub async fn apply(&self, container: &str, mode: NetworkMode) -> NetworkResult<()> {
        match mode.acl_mode() {
            None => {
                self.remove_all(container).await?;
            }
            Some(acl_mode) => {
                self.ensure(container, acl_mode).await?;
                self.remove(container, acl_mode.other()).await?;
            }
        }
        Ok(())
    }

    /// Wait for recent ACL removals to reach the runtime.
    pub async fn settle(&self) {
        if !self.config.settle.is_zero() {
            debug!("waiting {:?} for ACL changes to settle", self.config.settle);
            tokio::time::sleep(self.config.settle).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryAcls {
        acls: Mutex<HashMap<String, Vec<AclRule>>>,
        bindings: Mutex<HashMap<String, String>>,
    }

    #[async_trait]
    impl AclController for MemoryAcls {
        async fn exists(&self, acl: &str) -> NetworkResult<bool> {
            Ok(self.acls.lock().unwrap().contains_key(acl))
        }

        async fn create(&self, acl: &str, rules: &[AclRule]) -> NetworkResult<()> {
            self.acls
                .lock()
                .unwrap()
                .insert(acl.to_string(), rules.to_vec());
            Ok(())
        }

        async fn delete(&self, acl: &str) -> NetworkResult<()> {
            if self.bindings.lock().unwrap().values().any(|a| a == acl) {
                return Err(NetworkError::CommandFailed {
                    command: "delete".into(),
                    message: "ACL is in use".into(),
                });
            }
            self.acls
                .lock()
                .unwrap()
                .remove(acl)
                .map(|_| ())
                .ok_or_else(|| NetworkError::NotFound(acl.to_string()))
        }

        async fn attach(&self, container: &str, _nic: &str, acl: &str) -> NetworkResult<()> {
            self.bindings
                .lock()
                .unwrap()
                .insert(container.to_string(), acl.to_string());
            Ok(())
        }

        async fn detach(&self, container: &str, _nic: &str) -> NetworkResult<()> {
            self.bindings
                .lock()
                .unwrap()
                .remove(container)
                .map(|_| ())
                .ok_or_else(|| NetworkError::NotFound(container.to_string()))
        }
    }

    fn manager() -> (Arc<MemoryAcls>, AclManager) {
        let acls = Arc::new(MemoryAcls::default());
        let config = AclConfig {
            settle: Duration::ZERO,
            allowlist: vec!["203.0.113.0/24".to_string()],
            ..Default::default()
        };
        (acls.clone(), AclManager::new(acls, config))
    }

    #[test]
    fn test_acl_name() {
        let (_, m) = manager();
        assert_eq!(
            m.acl_name("isobox-abc-1", AclMode::Restricted),
            "isobox-isobox-abc-1-restricted"
        );
        assert_eq!(
            m.acl_name("isobox-abc-1", AclMode::Allowlist),
            "isobox-isobox-abc-1-allowlist"
        );
    }

    #[test]
    fn test_rules_end_with_catch_all() {
        let (_, m) = manager();
        let restricted = m.rules_for(AclMode::Restricted);
        assert_eq!(restricted.len(), DEFAULT_BLOCKED_RANGES.len() + 1);
        assert_eq!(restricted[0], AclRule::reject("10.0.0.0/8"));
        assert_eq!(
            restricted.last(),
            Some(&AclRule::catch_all(RuleAction::Allow))
        );

        let allowlist = m.rules_for(AclMode::Allowlist);
        assert_eq!(allowlist[0], AclRule::allow("203.0.113.0/24"));
        assert_eq!(
            allowlist.last(),
            Some(&AclRule::catch_all(RuleAction::Reject))
        );
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let (acls, m) = manager();
        let first = m.ensure("c1", AclMode::Restricted).await.unwrap();
        let second = m.ensure("c1", AclMode::Restricted).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(acls.acls.lock().unwrap().len(), 1);
        assert_eq!(acls.bindings.lock().unwrap().get("c1"), Some(&first));
    }

    #[tokio::test]
    async fn test_remove_without_acl_is_noop() {
        let (_, m) = manager();
        assert!(!m.remove("c1", AclMode::Allowlist).await.unwrap());
        assert_eq!(m.remove_all("c1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mode_switch_replaces_acl() {
        let (acls, m) = manager();
        m.apply("c1", NetworkMode::Restricted).await.unwrap();
        m.apply("c1", NetworkMode::Allowlist).await.unwrap();

        let names: Vec<String> = acls.acls.lock().unwrap().keys().cloned().collect();
        assert_eq!(names, vec![m.acl_name("c1", AclMode::Allowlist)]);
        assert_eq!(
            acls.bindings.lock().unwrap().get("c1"),
            Some(&m.acl_name("c1", AclMode::Allowlist))
        );
    }

    #[tokio::test]
    async fn test_remove_all_detaches_first() {
        let (acls, m) = manager();
        m.apply("c1", NetworkMode::Restricted).await.unwrap();
        assert_eq!(m.remove_all("c1").await.unwrap(), 1);
        assert!(acls.acls.lock().unwrap().is_empty());
        assert!(acls.bindings.lock().unwrap().is_empty());

        m.apply("c1", NetworkMode::Open).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_waits_configured_delay() {
        let acls = Arc::new(MemoryAcls::default());
        let m = AclManager::new(
            acls,
            AclConfig {
                settle: Duration::from_secs(2),
                ..Default::default()
            },
        );
        let start = tokio::time::Instant::now();
        m.settle().await;
        assert!(start.elapsed() >= Duration::from_secs(2));
    }
}
