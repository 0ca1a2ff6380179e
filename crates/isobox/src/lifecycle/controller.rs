//! Lifecycle controller.

use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::models::*;
use super::{LifecycleError, LifecycleResult};
use crate::container::{
    AbsorbNotFound, ContainerRuntimeApi, ExecOutput, LaunchConfig, StopMode,
    validate_container_name, validate_image_name,
};
use crate::naming::{ContainerNamer, normalize_workspace};
use crate::network::{AclManager, NetworkMode};
use crate::session::{Session, SessionStore, StoreError};

/// Coordinates the runtime, the network ACLs and the session store.
///
/// The store is always a superset of live session containers: a record is
/// written before its container is created and removed only after the
/// container is gone. Containers are plain (non-ephemeral) runtime objects;
/// the record's `persistent` flag alone decides whether a stopped session is
/// deleted, so ACLs can be removed before the container disappears.
pub struct LifecycleController {
    runtime: Arc<dyn ContainerRuntimeApi>,
    network: AclManager,
    store: SessionStore,
    namer: ContainerNamer,
    config: LifecycleConfig,
}

impl LifecycleController {
    pub fn new(
        runtime: Arc<dyn ContainerRuntimeApi>,
        network: AclManager,
        store: SessionStore,
        namer: ContainerNamer,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            runtime,
            network,
            store,
            namer,
            config,
        }
    }

    pub fn namer(&self) -> &ContainerNamer {
        &self.namer
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Launch a session container, or resume it if it exists but is stopped.
    pub async fn launch(&self, request: LaunchRequest) -> LifecycleResult<LaunchOutcome> {
        let workspace = normalize_workspace(&request.workspace)?;
        let (name, slot) = match request.name {
            Some(name) => {
                validate_container_name(&name)?;
                let slot = request
                    .slot
                    .or_else(|| self.namer.parse(&name).map(|parsed| parsed.slot))
                    .unwrap_or(1);
                (name, slot)
            }
            None => {
                let slot = request.slot.unwrap_or(1);
                (self.namer.resolve(&workspace, slot)?, slot)
            }
        };
        let image = request.image.unwrap_or_else(|| self.config.image.clone());
        let mode = request.network.unwrap_or(self.config.network_mode);

        self.launch_named(&name, &workspace, slot, &image, mode)
            .await
    }

    async fn launch_named(
        &self,
        name: &str,
        workspace: &Path,
        slot: u32,
        image: &str,
        mode: NetworkMode,
    ) -> LifecycleResult<LaunchOutcome> {
        validate_image_name(image)?;

        if let Some(info) = self.runtime.inspect(name).await? {
            if info.is_running() {
                return Err(LifecycleError::Conflict(format!(
                    "container {} is already running",
                    name
                )));
            }

            info!("resuming stopped container {}", name);
            if self.store.find_by_container_name(name).await?.is_some() {
                self.store.touch(name).await?;
            } else {
                // A container we hold no record for is kept when it stops.
                let mut session = Session::new(name, workspace, slot, image, mode);
                session.persistent = true;
                self.create_record(&session).await?;
                warn!("adopted unrecorded container {} as persistent", name);
            }
            self.network.apply(name, mode).await?;
            self.runtime.start(name).await?;
            return Ok(LaunchOutcome {
                name: name.to_string(),
                resumed: true,
            });
        }

        if let Some(stale) = self.store.find_by_container_name(name).await? {
            if !self.is_stale(&stale) {
                return Err(LifecycleError::Conflict(format!(
                    "container {} is being launched by another session",
                    name
                )));
            }
            warn!("removing stale session record for {}", name);
            self.store.delete(name).await?;
        }

        let session = Session::new(name, workspace, slot, image, mode);
        self.create_record(&session).await?;

        let config = LaunchConfig::new(name, image).workspace(
            workspace.to_string_lossy(),
            self.config.workspace_mount.as_str(),
        );
        if let Err(e) = self.runtime.create(&config).await {
            self.discard_record(name).await;
            return Err(e.into());
        }

        // The ACL is bound while the container is still stopped, so it never
        // runs with unrestricted egress.
        let started = match self.network.apply(name, mode).await {
            Ok(()) => self.runtime.start(name).await.map_err(LifecycleError::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = started {
            warn!("starting {} failed, removing container: {}", name, e);
            if let Err(cleanup) = self.teardown(name).await {
                warn!("failed to remove {} after failed start: {}", name, cleanup);
            }
            return Err(e);
        }

        info!(
            "launched {} (session {}, network {})",
            name, session.session_id, mode
        );
        Ok(LaunchOutcome {
            name: name.to_string(),
            resumed: false,
        })
    }

    /// Launch or reuse a container, run one command in it, then clean up.
    ///
    /// The container is stopped afterwards only if this run started it; a
    /// non-persistent one is then removed.
    pub async fn run(&self, request: RunRequest) -> LifecycleResult<RunReport> {
        if request.command.is_empty() {
            return Err(LifecycleError::Validation(
                "run requires a command".to_string(),
            ));
        }

        let workspace = normalize_workspace(&request.workspace)?;
        let slot = match request.slot {
            Some(slot) => {
                self.namer.check_slot(slot)?;
                slot
            }
            None => self.allocate_slot(&workspace).await?,
        };
        let name = self.namer.resolve(&workspace, slot)?;
        let image = request.image.unwrap_or_else(|| self.config.image.clone());
        let mode = request.network.unwrap_or(self.config.network_mode);

        let launched = if self.runtime.running(&name).await? {
            info!("reusing running container {}", name);
            false
        } else {
            self.launch_named(&name, &workspace, slot, &image, mode)
                .await?;
            true
        };

        // Pin before the command runs so a container that stops itself is kept.
        if request.persistent {
            if let Err(e) = self.persist(&name).await {
                if launched {
                    self.stop_after_failure(&name).await;
                }
                return Err(e);
            }
        }

        let output = self
            .runtime
            .exec(&name, &request.command, Some(&self.config.workspace_mount))
            .await;

        let stop = if launched {
            match self.stop(&name).await {
                Ok(report) => Some(report),
                Err(e) if output.is_err() => {
                    warn!("cleanup of {} failed: {}", name, e);
                    None
                }
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        Ok(RunReport {
            name,
            output: output?,
            launched,
            stop,
        })
    }

    /// First slot of the workspace without a container.
    pub async fn allocate_slot(&self, workspace: &Path) -> LifecycleResult<u32> {
        for (slot, name) in self.namer.candidates(workspace)? {
            if !self.runtime.exists(&name).await? {
                debug!("allocated slot {} ({})", slot, name);
                return Ok(slot);
            }
        }
        Err(LifecycleError::NoFreeSlot {
            workspace: workspace.display().to_string(),
            max: self.namer.max_slots(),
        })
    }

    /// Keep the container across stop and shutdown.
    ///
    /// Only the record changes; the single atomic record write makes the
    /// transition all-or-nothing.
    pub async fn persist(&self, name: &str) -> LifecycleResult<PersistOutcome> {
        validate_container_name(name)?;

        let session = self
            .store
            .find_by_container_name(name)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(name.to_string()))?;
        if !self.runtime.exists(name).await? {
            return Err(LifecycleError::NotFound(name.to_string()));
        }

        if session.persistent {
            debug!("{} is already persistent", name);
            return Ok(PersistOutcome::AlreadyPersistent);
        }

        self.store.set_persistent(name).await?;
        info!("persisted {}", name);
        Ok(PersistOutcome::Persisted)
    }

    /// Persist every live container carrying the naming prefix.
    pub async fn persist_all(&self) -> LifecycleResult<BatchReport> {
        let mut report = BatchReport::default();
        for info in self.runtime.list(self.namer.prefix()).await? {
            match self.persist(&info.name).await {
                Ok(_) => report.succeeded.push(info.name),
                Err(e) => {
                    warn!("failed to persist {}: {}", info.name, e);
                    report.failed.push((info.name, e));
                }
            }
        }
        Ok(report)
    }

    /// Stop a container; a non-persistent session is removed afterwards.
    ///
    /// Retrying after the session is gone reports `Absent`.
    pub async fn stop(&self, name: &str) -> LifecycleResult<StopReport<StopOutcome>> {
        validate_container_name(name)?;

        let outcome = match self.runtime.inspect(name).await? {
            None => StopOutcome::Absent,
            Some(info) if !info.is_running() => StopOutcome::AlreadyStopped,
            Some(_) => {
                let stopped = self
                    .runtime
                    .stop(name, StopMode::Graceful { timeout: None })
                    .await
                    .absorb_not_found()?;
                if stopped {
                    StopOutcome::Stopped
                } else {
                    StopOutcome::Absent
                }
            }
        };

        let torn_down = self.finish(name).await?;
        Ok(StopReport { outcome, torn_down })
    }

    /// Stop gracefully, escalating to a forced stop once the timeout passes.
    pub async fn shutdown(
        &self,
        name: &str,
        timeout: Option<Duration>,
    ) -> LifecycleResult<StopReport<ShutdownOutcome>> {
        validate_container_name(name)?;
        let timeout = timeout.unwrap_or(self.config.shutdown_timeout);

        let outcome = match self.runtime.inspect(name).await? {
            None => ShutdownOutcome::Absent,
            Some(info) if !info.is_running() => ShutdownOutcome::AlreadyStopped,
            Some(_) => {
                info!("stopping {} (timeout {:?})", name, timeout);
                let graceful = self.runtime.stop(
                    name,
                    StopMode::Graceful {
                        timeout: Some(timeout),
                    },
                );
                match tokio::time::timeout(timeout, graceful).await {
                    Ok(Ok(())) => ShutdownOutcome::Graceful,
                    // Gone during the window: it stopped on its own.
                    Ok(Err(e)) if e.is_not_found() => ShutdownOutcome::Graceful,
                    Ok(Err(e)) => {
                        warn!("graceful stop of {} failed: {}", name, e);
                        self.escalate(name).await?
                    }
                    Err(_) => {
                        info!("{} still stopping after {:?}", name, timeout);
                        self.escalate(name).await?
                    }
                }
            }
        };

        let torn_down = self.finish(name).await?;
        Ok(StopReport { outcome, torn_down })
    }

    /// Force-stop only if the container is still running right now.
    async fn escalate(&self, name: &str) -> LifecycleResult<ShutdownOutcome> {
        match self.runtime.inspect(name).await? {
            Some(info) if info.is_running() => {
                self.runtime
                    .stop(name, StopMode::Force)
                    .await
                    .absorb_not_found()?;
                warn!("force-killed {}", name);
                Ok(ShutdownOutcome::Forced)
            }
            _ => {
                debug!("{} stopped on its own at the deadline", name);
                Ok(ShutdownOutcome::Graceful)
            }
        }
    }

    /// Force-stop immediately.
    pub async fn kill(&self, name: &str) -> LifecycleResult<StopReport<KillOutcome>> {
        validate_container_name(name)?;

        let outcome = match self.runtime.inspect(name).await? {
            None => KillOutcome::Absent,
            Some(info) if !info.is_running() => KillOutcome::AlreadyStopped,
            Some(_) => {
                let killed = self
                    .runtime
                    .stop(name, StopMode::Force)
                    .await
                    .absorb_not_found()?;
                if killed {
                    KillOutcome::Killed
                } else {
                    KillOutcome::Absent
                }
            }
        };

        let torn_down = self.finish(name).await?;
        Ok(StopReport { outcome, torn_down })
    }

    /// Kill every live container carrying the naming prefix.
    pub async fn kill_all(&self) -> LifecycleResult<BatchReport> {
        let mut report = BatchReport::default();
        for info in self.runtime.list(self.namer.prefix()).await? {
            match self.kill(&info.name).await {
                Ok(_) => report.succeeded.push(info.name),
                Err(e) => {
                    warn!("failed to kill {}: {}", info.name, e);
                    report.failed.push((info.name, e));
                }
            }
        }
        Ok(report)
    }

    /// Remove ACLs, then the container, then its record.
    ///
    /// The record survives a failed runtime delete.
    pub async fn delete(&self, name: &str, force: bool) -> LifecycleResult<DeleteOutcome> {
        validate_container_name(name)?;
        let info = self.runtime.inspect(name).await?;
        let known = self.store.find_by_container_name(name).await?.is_some();

        match info {
            None if !known => return Err(LifecycleError::NotFound(name.to_string())),
            Some(ref info) if info.is_running() && !force => {
                return Err(LifecycleError::StillRunning(name.to_string()));
            }
            _ => {}
        }

        if self.network.remove_all(name).await? > 0 {
            self.network.settle().await;
        }

        let outcome = match info {
            Some(_) => {
                if self.runtime.delete(name, force).await.absorb_not_found()? {
                    DeleteOutcome::Deleted
                } else {
                    DeleteOutcome::Absent
                }
            }
            None => DeleteOutcome::Absent,
        };

        self.store.delete(name).await?;
        info!("deleted {}", name);
        Ok(outcome)
    }

    pub async fn exists(&self, name: &str) -> LifecycleResult<bool> {
        validate_container_name(name)?;
        Ok(self.runtime.exists(name).await?)
    }

    pub async fn running(&self, name: &str) -> LifecycleResult<bool> {
        validate_container_name(name)?;
        Ok(self.runtime.running(name).await?)
    }

    pub async fn exec(&self, name: &str, command: &[String]) -> LifecycleResult<ExecOutput> {
        validate_container_name(name)?;
        if command.is_empty() {
            return Err(LifecycleError::Validation(
                "exec requires a command".to_string(),
            ));
        }
        Ok(self
            .runtime
            .exec(name, command, Some(&self.config.workspace_mount))
            .await?)
    }

    /// All session records with the live state of their containers.
    pub async fn list(&self) -> LifecycleResult<Vec<SessionView>> {
        let mut views = Vec::new();
        for session in self.store.list().await? {
            let status = self
                .runtime
                .inspect(&session.container_name)
                .await?
                .map(|info| info.status);
            views.push(SessionView { session, status });
        }
        Ok(views)
    }

    /// Remove sessions left behind outside of a lifecycle operation.
    ///
    /// Records whose container is gone lose their ACLs and record. A
    /// non-persistent session whose container stopped on its own is torn
    /// down like a stopped one. Records younger than the stale grace are
    /// skipped, since they may belong to a launch in flight.
    pub async fn clean(&self) -> LifecycleResult<Vec<String>> {
        let mut removed = Vec::new();
        for session in self.store.list().await? {
            let name = &session.container_name;
            let info = self.runtime.inspect(name).await?;
            let orphaned = match info {
                None => true,
                Some(ref info) if !session.persistent && !info.is_running() => false,
                Some(_) => continue,
            };
            if !self.is_stale(&session) {
                debug!("skipping recent record {}", name);
                continue;
            }

            if orphaned {
                self.network.remove_all(name).await?;
                if self.store.delete(name).await? {
                    info!("removed orphaned session record {}", name);
                    removed.push(name.clone());
                }
            } else {
                self.teardown(name).await?;
                removed.push(name.clone());
            }
        }
        Ok(removed)
    }

    /// Tear down a non-persistent session after its container stopped.
    ///
    /// The record is re-read here so a persist that landed while the
    /// container was stopping is honoured.
    async fn finish(&self, name: &str) -> LifecycleResult<bool> {
        match self.store.find_by_container_name(name).await? {
            Some(session) if session.persistent => {
                debug!("{} is persistent, keeping it", name);
                Ok(false)
            }
            Some(_) => {
                self.teardown(name).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn teardown(&self, name: &str) -> LifecycleResult<()> {
        if self.network.remove_all(name).await? > 0 {
            self.network.settle().await;
        }
        if self.runtime.delete(name, true).await.absorb_not_found()? {
            debug!("deleted container {}", name);
        }
        self.store.delete(name).await?;
        info!("removed session {}", name);
        Ok(())
    }

    async fn create_record(&self, session: &Session) -> LifecycleResult<()> {
        match self.store.create(session).await {
            Ok(()) => Ok(()),
            Err(StoreError::AlreadyExists(name)) => Err(LifecycleError::Conflict(format!(
                "container {} is being launched by another session",
                name
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn discard_record(&self, name: &str) {
        if let Err(e) = self.store.delete(name).await {
            warn!("failed to remove session record for {}: {}", name, e);
        }
    }

    async fn stop_after_failure(&self, name: &str) {
        if let Err(e) = self.stop(name).await {
            warn!("failed to stop {} after error: {}", name, e);
        }
    }

    fn is_stale(&self, session: &Session) -> bool {
        Utc::now()
            .signed_duration_since(session.updated_at)
            .to_std()
            .is_ok_and(|age| age >= self.config.stale_record_grace)
    }
}
