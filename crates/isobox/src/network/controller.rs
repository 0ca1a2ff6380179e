//! ACL backend seam and its Incus implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::{debug, warn};

use super::error::{NetworkError, NetworkResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Reject,
}

impl std::fmt::Display for RuleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleAction::Allow => write!(f, "allow"),
            RuleAction::Reject => write!(f, "reject"),
        }
    }
}

/// One egress rule. A missing destination matches all traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclRule {
    pub action: RuleAction,
    pub destination: Option<String>,
}

impl AclRule {
    pub fn allow(destination: impl Into<String>) -> Self {
        Self {
            action: RuleAction::Allow,
            destination: Some(destination.into()),
        }
    }

    pub fn reject(destination: impl Into<String>) -> Self {
        Self {
            action: RuleAction::Reject,
            destination: Some(destination.into()),
        }
    }

    pub fn catch_all(action: RuleAction) -> Self {
        Self {
            action,
            destination: None,
        }
    }

    fn to_args(&self) -> Vec<String> {
        let mut args = vec!["egress".to_string(), format!("action={}", self.action)];
        if let Some(ref destination) = self.destination {
            args.push(format!("destination={}", destination));
        }
        args.push("state=enabled".to_string());
        args
    }
}

/// Named network ACL objects in the runtime.
#[async_trait]
pub trait AclController: Send + Sync {
    async fn exists(&self, acl: &str) -> NetworkResult<bool>;
    async fn create(&self, acl: &str, rules: &[AclRule]) -> NetworkResult<()>;
    /// Delete an ACL; `NotFound` if it does not exist.
    async fn delete(&self, acl: &str) -> NetworkResult<()>;
    /// Bind an ACL to a container NIC, replacing any previous binding.
    async fn attach(&self, container: &str, nic: &str, acl: &str) -> NetworkResult<()>;
    /// Clear the ACL binding of a container NIC.
    async fn detach(&self, container: &str, nic: &str) -> NetworkResult<()>;
}

/// ACL controller driving `incus network acl` and device overrides.
#[derive(Debug, Clone)]
pub struct IncusAclController {
    binary: String,
}

impl IncusAclController {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn output(&self, command: &str, args: &[String]) -> NetworkResult<Output> {
        debug!("{} {}", self.binary, args.join(" "));
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| NetworkError::CommandFailed {
                command: command.to_string(),
                message: e.to_string(),
            })
    }

    async fn run(&self, command: &str, target: &str, args: &[String]) -> NetworkResult<()> {
        let output = self.output(command, args).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if is_not_found(&stderr) {
            return Err(NetworkError::NotFound(target.to_string()));
        }
        Err(NetworkError::CommandFailed {
            command: command.to_string(),
            message: stderr,
        })
    }
}

#[async_trait]
impl AclController for IncusAclController {
    async fn exists(&self, acl: &str) -> NetworkResult<bool> {
        validate_acl_name(acl)?;
        let args = vec![
            "network".to_string(),
            "acl".to_string(),
            "show".to_string(),
            acl.to_string(),
        ];
        match self.run("show", acl, &args).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create(&self, acl: &str, rules: &[AclRule]) -> NetworkResult<()> {
        validate_acl_name(acl)?;
        let args = vec![
            "network".to_string(),
            "acl".to_string(),
            "create".to_string(),
            acl.to_string(),
        ];
        self.run("create", acl, &args).await?;

        for rule in rules {
            let mut args = vec![
                "network".to_string(),
                "acl".to_string(),
                "rule".to_string(),
                "add".to_string(),
                acl.to_string(),
            ];
            args.extend(rule.to_args());
            if let Err(e) = self.run("rule add", acl, &args).await {
                warn!("failed to add rule to {}, removing it: {}", acl, e);
                if let Err(cleanup) = self.delete(acl).await {
                    warn!("failed to remove partial ACL {}: {}", acl, cleanup);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    async fn delete(&self, acl: &str) -> NetworkResult<()> {
        validate_acl_name(acl)?;
        let args = vec![
            "network".to_string(),
            "acl".to_string(),
            "delete".to_string(),
            acl.to_string(),
        ];
        self.run("delete", acl, &args).await
    }

    async fn attach(&self, container: &str, nic: &str, acl: &str) -> NetworkResult<()> {
        validate_acl_name(acl)?;
        let setting = format!("security.acls={}", acl);
        let override_args = vec![
            "config".to_string(),
            "device".to_string(),
            "override".to_string(),
            container.to_string(),
            nic.to_string(),
            setting.clone(),
        ];
        match self.run("attach", container, &override_args).await {
            Err(NetworkError::CommandFailed { ref message, .. })
                if message.to_ascii_lowercase().contains("already exists") =>
            {
                let set_args = vec![
                    "config".to_string(),
                    "device".to_string(),
                    "set".to_string(),
                    container.to_string(),
                    nic.to_string(),
                    setting,
                ];
                self.run("attach", container, &set_args).await
            }
            other => other,
        }
    }

    async fn detach(&self, container: &str, nic: &str) -> NetworkResult<()> {
        let args = vec![
            "config".to_string(),
            "device".to_string(),
            "unset".to_string(),
            container.to_string(),
            nic.to_string(),
            "security.acls".to_string(),
        ];
        self.run("detach", container, &args).await
    }
}

fn is_not_found(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("not found") || lower.contains("doesn't exist") || lower.contains("does not exist")
}

fn validate_acl_name(acl: &str) -> NetworkResult<()> {
    let valid = !acl.is_empty()
        && acl.starts_with(|c: char| c.is_ascii_alphabetic())
        && acl.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
    if !valid {
        return Err(NetworkError::InvalidInput(format!(
            "invalid ACL name '{}'",
            acl
        )));
    }
    Ok(())
}
