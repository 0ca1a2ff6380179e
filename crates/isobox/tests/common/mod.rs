//! Test utilities and common setup.
//!
//! In-memory stand-ins for the container runtime and the ACL backend that
//! record every mutating call into one shared event log, so tests can assert
//! on ordering across both.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use isobox::container::{
    ContainerError, ContainerInfo, ContainerResult, ContainerRuntimeApi, ContainerStatus,
    ExecOutput, LaunchConfig, StopMode,
};
use isobox::lifecycle::{LifecycleConfig, LifecycleController};
use isobox::naming::ContainerNamer;
use isobox::network::{
    AclConfig, AclController, AclManager, AclRule, NetworkError, NetworkResult,
};
use isobox::session::SessionStore;

pub type Events = Arc<Mutex<Vec<String>>>;

/// What a graceful stop request does.
#[derive(Debug, Clone, Copy)]
pub enum GracefulStop {
    /// Stops immediately.
    Complete,
    /// The request never returns and the container keeps running.
    Hang,
    /// The container stops on its own after the delay, but the request
    /// itself never returns.
    SelfStopAfter(Duration),
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub status: ContainerStatus,
    pub image: String,
}

pub struct FakeRuntime {
    pub containers: Mutex<HashMap<String, FakeContainer>>,
    pub events: Events,
    pub graceful: Mutex<GracefulStop>,
    pub fail_create: AtomicBool,
    pub fail_start: AtomicBool,
    pub fail_delete: AtomicBool,
    /// The container stops itself when a command finishes.
    pub stop_on_exec: AtomicBool,
    pub exec_output: Mutex<ExecOutput>,
}

impl FakeRuntime {
    pub fn new(events: Events) -> Self {
        Self {
            containers: Mutex::new(HashMap::new()),
            events,
            graceful: Mutex::new(GracefulStop::Complete),
            fail_create: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            fail_delete: AtomicBool::new(false),
            stop_on_exec: AtomicBool::new(false),
            exec_output: Mutex::new(ExecOutput {
                stdout: "hello\n".to_string(),
                stderr: String::new(),
                exit_code: 0,
            }),
        }
    }

    pub fn insert(&self, name: &str, status: ContainerStatus) {
        self.containers.lock().unwrap().insert(
            name.to_string(),
            FakeContainer {
                status,
                image: "images:ubuntu/24.04".to_string(),
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<FakeContainer> {
        self.containers.lock().unwrap().get(name).cloned()
    }

    pub fn set_graceful(&self, behavior: GracefulStop) {
        *self.graceful.lock().unwrap() = behavior;
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    pub fn status(&self, name: &str) -> Option<ContainerStatus> {
        self.get(name).map(|c| c.status)
    }

    fn halt(&self, name: &str) {
        if let Some(container) = self.containers.lock().unwrap().get_mut(name) {
            container.status = ContainerStatus::Stopped;
        }
    }

    fn require(&self, name: &str) -> ContainerResult<FakeContainer> {
        self.get(name)
            .ok_or_else(|| ContainerError::NotFound(name.to_string()))
    }
}

#[async_trait]
impl ContainerRuntimeApi for FakeRuntime {
    async fn create(&self, config: &LaunchConfig) -> ContainerResult<()> {
        config.validate()?;
        self.record(format!("create {}", config.name));
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ContainerError::CommandFailed {
                command: "init".to_string(),
                message: "image not available".to_string(),
            });
        }
        if self.get(&config.name).is_some() {
            return Err(ContainerError::CommandFailed {
                command: "init".to_string(),
                message: "instance already exists".to_string(),
            });
        }
        self.containers.lock().unwrap().insert(
            config.name.clone(),
            FakeContainer {
                status: ContainerStatus::Stopped,
                image: config.image.clone(),
            },
        );
        Ok(())
    }

    async fn start(&self, name: &str) -> ContainerResult<()> {
        self.require(name)?;
        self.record(format!("start {}", name));
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(ContainerError::CommandFailed {
                command: "start".to_string(),
                message: "failed to start device".to_string(),
            });
        }
        if let Some(container) = self.containers.lock().unwrap().get_mut(name) {
            container.status = ContainerStatus::Running;
        }
        Ok(())
    }

    async fn stop(&self, name: &str, mode: StopMode) -> ContainerResult<()> {
        let container = self.require(name)?;
        match mode {
            StopMode::Force => {
                self.record(format!("kill {}", name));
                self.halt(name);
                Ok(())
            }
            StopMode::Graceful { .. } => {
                self.record(format!("stop {}", name));
                if !container.status.is_running() {
                    return Ok(());
                }
                let behavior = *self.graceful.lock().unwrap();
                match behavior {
                    GracefulStop::Complete => {
                        self.halt(name);
                        Ok(())
                    }
                    GracefulStop::Hang => std::future::pending().await,
                    GracefulStop::SelfStopAfter(delay) => {
                        tokio::time::sleep(delay).await;
                        self.halt(name);
                        std::future::pending().await
                    }
                }
            }
        }
    }

    async fn delete(&self, name: &str, _force: bool) -> ContainerResult<()> {
        self.require(name)?;
        self.record(format!("delete {}", name));
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(ContainerError::CommandFailed {
                command: "delete".to_string(),
                message: "storage busy".to_string(),
            });
        }
        self.containers.lock().unwrap().remove(name);
        Ok(())
    }

    async fn inspect(&self, name: &str) -> ContainerResult<Option<ContainerInfo>> {
        Ok(self.get(name).map(|c| ContainerInfo {
            name: name.to_string(),
            status: c.status,
        }))
    }

    async fn list(&self, prefix: &str) -> ContainerResult<Vec<ContainerInfo>> {
        let needle = format!("{}-", prefix);
        let mut infos: Vec<ContainerInfo> = self
            .containers
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name.starts_with(&needle))
            .map(|(name, c)| ContainerInfo {
                name: name.clone(),
                status: c.status,
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }

    async fn exec(
        &self,
        name: &str,
        command: &[String],
        _cwd: Option<&str>,
    ) -> ContainerResult<ExecOutput> {
        let container = self.require(name)?;
        if !container.status.is_running() {
            return Err(ContainerError::CommandFailed {
                command: "exec".to_string(),
                message: "Instance is not running".to_string(),
            });
        }
        self.record(format!("exec {} {}", name, command.join(" ")));
        if self.stop_on_exec.load(Ordering::SeqCst) {
            self.halt(name);
        }
        Ok(self.exec_output.lock().unwrap().clone())
    }
}

pub struct FakeAcls {
    pub acls: Mutex<HashMap<String, Vec<AclRule>>>,
    pub bindings: Mutex<HashMap<String, String>>,
    pub events: Events,
}

impl FakeAcls {
    pub fn new(events: Events) -> Self {
        Self {
            acls: Mutex::new(HashMap::new()),
            bindings: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.acls.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl AclController for FakeAcls {
    async fn exists(&self, acl: &str) -> NetworkResult<bool> {
        Ok(self.acls.lock().unwrap().contains_key(acl))
    }

    async fn create(&self, acl: &str, rules: &[AclRule]) -> NetworkResult<()> {
        self.events.lock().unwrap().push(format!("acl create {}", acl));
        self.acls
            .lock()
            .unwrap()
            .insert(acl.to_string(), rules.to_vec());
        Ok(())
    }

    async fn delete(&self, acl: &str) -> NetworkResult<()> {
        if self.bindings.lock().unwrap().values().any(|bound| bound == acl) {
            return Err(NetworkError::CommandFailed {
                command: "delete".to_string(),
                message: "ACL is in use".to_string(),
            });
        }
        self.events.lock().unwrap().push(format!("acl delete {}", acl));
        self.acls
            .lock()
            .unwrap()
            .remove(acl)
            .map(|_| ())
            .ok_or_else(|| NetworkError::NotFound(acl.to_string()))
    }

    async fn attach(&self, container: &str, _nic: &str, acl: &str) -> NetworkResult<()> {
        self.events
            .lock()
            .unwrap()
            .push(format!("acl attach {} {}", container, acl));
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

/// A controller wired to the fakes with a temporary session store.
pub struct Harness {
    pub controller: LifecycleController,
    pub runtime: Arc<FakeRuntime>,
    pub acls: Arc<FakeAcls>,
    pub events: Events,
    pub store: SessionStore,
    _temp: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settle(Duration::ZERO)
    }

    pub fn with_settle(settle: Duration) -> Self {
        let temp = TempDir::new().unwrap();
        let events: Events = Arc::new(Mutex::new(Vec::new()));
        let runtime = Arc::new(FakeRuntime::new(events.clone()));
        let acls = Arc::new(FakeAcls::new(events.clone()));
        let store = SessionStore::new(temp.path().join("sessions"));

        let network = AclManager::new(
            acls.clone(),
            AclConfig {
                settle,
                allowlist: vec!["203.0.113.0/24".to_string()],
                ..Default::default()
            },
        );
        let controller = LifecycleController::new(
            runtime.clone(),
            network,
            store.clone(),
            ContainerNamer::new("isobox", 3).unwrap(),
            LifecycleConfig {
                shutdown_timeout: Duration::from_secs(5),
                ..Default::default()
            },
        );

        Self {
            controller,
            runtime,
            acls,
            events,
            store,
            _temp: temp,
        }
    }

    pub fn workspace(&self) -> PathBuf {
        PathBuf::from("/home/dev/project")
    }

    pub fn name(&self, slot: u32) -> String {
        self.controller
            .namer()
            .resolve(&self.workspace(), slot)
            .unwrap()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().unwrap().clear();
    }

    /// Position of the first event equal to `event`.
    pub fn position(&self, event: &str) -> Option<usize> {
        self.events().iter().position(|e| e == event)
    }

    pub fn has_event_prefix(&self, prefix: &str) -> bool {
        self.events().iter().any(|e| e.starts_with(prefix))
    }
}

pub fn command(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

pub fn workspace_path(path: &str) -> PathBuf {
    Path::new(path).to_path_buf()
}
