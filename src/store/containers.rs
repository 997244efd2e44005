//! Runtime-backed container store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capacity::CapacityAccountant;
use crate::constants::{
    CONTAINER_OWNER_PROPERTY, CONTAINER_STATE_PROPERTY, TAG_PROPERTY_PREFIX,
};
use crate::container::{Container, ContainerState, RunResult, Tags};
use crate::credentials::CredentialManager;
use crate::error::{Error, Result, RuntimeError};
use crate::events::{ContainerEvent, EventHub};
use crate::logstream::{LogSink, LogStreamer};
use crate::runtime::{ByteReader, RuntimeClient, Sandbox, SandboxSpec};
use crate::store::supervisor::{self, SupervisorChannels};
use crate::transformer::Transformer;

/// Store-level knobs, split out of [`crate::config::AgentConfig`] so the
/// store does not see the whole configuration surface.
#[derive(Debug, Clone)]
pub struct ContainerStoreConfig {
    pub owner_name: String,
    pub max_cpu_shares: u64,
    pub inode_limit: u64,
    pub reap_interval: Duration,
}

pub(crate) struct SupervisorHandle {
    pub stop: CancellationToken,
    pub done: watch::Receiver<bool>,
}

struct StoredContainer {
    container: Container,
    sandbox: Arc<dyn Sandbox>,
    supervisor: Option<SupervisorHandle>,
    completed_at: Option<Instant>,
}

/// Holds containers in `Created`, `Running`, and `Completed`: everything
/// with a corresponding runtime object. Each running entry also owns the
/// handle of its run supervisor.
///
/// One mutex guards membership; it is never held across runtime I/O.
pub struct ContainerStore {
    config: ContainerStoreConfig,
    runtime: Arc<dyn RuntimeClient>,
    accountant: Arc<CapacityAccountant>,
    transformer: Transformer,
    hub: Arc<EventHub>,
    credentials: Arc<dyn CredentialManager>,
    log_sink: Arc<dyn LogSink>,
    entries: Mutex<HashMap<String, StoredContainer>>,
}

impl ContainerStore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ContainerStoreConfig,
        runtime: Arc<dyn RuntimeClient>,
        accountant: Arc<CapacityAccountant>,
        transformer: Transformer,
        hub: Arc<EventHub>,
        credentials: Arc<dyn CredentialManager>,
        log_sink: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            config,
            runtime,
            accountant,
            transformer,
            hub,
            credentials,
            log_sink,
            entries: Mutex::new(HashMap::new()),
        }
    }

    // =========================================================================
    // Lifecycle Operations
    // =========================================================================

    /// Creates the runtime sandbox for an `Initializing` container and
    /// stores it as `Created`.
    ///
    /// On runtime failure nothing is inserted; the caller keeps the
    /// capacity claim and decides what to do with it.
    pub async fn create(&self, mut container: Container) -> Result<Container> {
        if container.state != ContainerState::Initializing {
            return Err(Error::InvalidTransition {
                guid: container.guid,
                from: container.state.as_str(),
                operation: "create",
            });
        }

        if self.lock().contains_key(&container.guid) {
            return Err(Error::AlreadyExists(container.guid));
        }

        let bind_mounts = self
            .credentials
            .create_cred_dir(&container)
            .map_err(|err| RuntimeError::operation("create", &container.guid, err))?;

        let spec = self.sandbox_spec(&container, bind_mounts);

        debug!(guid = %container.guid, "creating sandbox");
        let sandbox = self.runtime.create(spec).await.inspect_err(|_| {
            let _ = self.credentials.remove_creds(&container.guid);
        })?;

        if let Ok(info) = sandbox.info().await {
            container.internal_ip = info.internal_ip;
            if container.external_ip.is_empty() {
                container.external_ip = info.external_ip;
            }
        }

        if let Err(err) = self.credentials.generate_creds(&container) {
            let _ = self.runtime.destroy(&container.guid).await;
            let _ = self.credentials.remove_creds(&container.guid);
            return Err(RuntimeError::operation("create", &container.guid, err).into());
        }

        container.state = ContainerState::Created;

        self.lock().insert(
            container.guid.clone(),
            StoredContainer {
                container: container.clone(),
                sandbox,
                supervisor: None,
                completed_at: None,
            },
        );

        info!(guid = %container.guid, "container created");
        self.hub.emit(ContainerEvent::Created {
            container: container.clone(),
        });

        Ok(container)
    }

    /// Starts the run supervisor for a `Created` container. Returns as
    /// soon as the supervisor is spawned.
    pub fn run(self: &Arc<Self>, guid: &str) -> Result<()> {
        let (container, sandbox) = {
            let entries = self.lock();
            let entry = entries
                .get(guid)
                .ok_or_else(|| Error::NotFound(guid.to_string()))?;

            if entry.container.state != ContainerState::Created {
                return Err(Error::InvalidTransition {
                    guid: guid.to_string(),
                    from: entry.container.state.as_str(),
                    operation: "run",
                });
            }

            (entry.container.clone(), Arc::clone(&entry.sandbox))
        };

        let streamer = LogStreamer::new(container.log.clone(), Arc::clone(&self.log_sink));
        let (started_tx, started_rx) = mpsc::channel(1);
        let (root, root_token) =
            self.transformer
                .steps_for_run(&container, Arc::clone(&sandbox), &streamer, started_tx);

        let stop = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);

        {
            let mut entries = self.lock();
            let entry = entries
                .get_mut(guid)
                .ok_or_else(|| Error::NotFound(guid.to_string()))?;
            entry.supervisor = Some(SupervisorHandle {
                stop: stop.clone(),
                done: done_rx,
            });
        }

        info!(guid, "starting run supervisor");
        tokio::spawn(supervisor::supervise(
            Arc::clone(self),
            container.guid,
            sandbox,
            root,
            root_token,
            SupervisorChannels {
                stop,
                has_started_running: started_rx,
                done: done_tx,
            },
        ));

        Ok(())
    }

    /// Signals the container's supervisor and waits for it to exit. The
    /// entry stays in the store as `Completed` with reason "stopped".
    /// Stopping a container that is not running is a no-op.
    pub async fn stop(&self, guid: &str) -> Result<()> {
        let Some(handle) = self.take_supervisor(guid)? else {
            return Ok(());
        };

        info!(guid, "stopping container");
        handle.stop.cancel();
        Self::await_done(handle.done).await;
        Ok(())
    }

    /// Stops the supervisor if one is running, destroys the runtime
    /// sandbox, and removes the entry, releasing its capacity. Runtime
    /// `ContainerNotFound` on destroy counts as success.
    pub async fn destroy(&self, guid: &str) -> Result<()> {
        if let Some(handle) = self.take_supervisor(guid)? {
            handle.stop.cancel();
            Self::await_done(handle.done).await;
        }

        self.destroy_sandbox(guid).await?;

        let removed = self.lock().remove(guid);
        if let Some(entry) = removed {
            self.accountant.release(&entry.container.resource);
        }

        if let Err(err) = self.credentials.remove_creds(guid) {
            warn!(guid, "failed to remove credentials: {err}");
        }

        info!(guid, "container destroyed");
        Ok(())
    }

    /// Streams a file out of the container's sandbox.
    pub async fn get_files(&self, guid: &str, source_path: &str) -> Result<ByteReader> {
        let sandbox = {
            let entries = self.lock();
            let entry = entries
                .get(guid)
                .ok_or_else(|| Error::NotFound(guid.to_string()))?;
            Arc::clone(&entry.sandbox)
        };

        Ok(sandbox.stream_out(source_path).await?)
    }

    pub fn lookup(&self, guid: &str) -> Result<Container> {
        self.lock()
            .get(guid)
            .map(|entry| entry.container.clone())
            .ok_or_else(|| Error::NotFound(guid.to_string()))
    }

    /// Snapshot of stored containers, filtered to those carrying every
    /// given tag.
    pub fn list(&self, tag_filter: &Tags) -> Vec<Container> {
        self.lock()
            .values()
            .filter(|entry| {
                tag_filter
                    .iter()
                    .all(|(k, v)| entry.container.tags.get(k) == Some(v))
            })
            .map(|entry| entry.container.clone())
            .collect()
    }

    // =========================================================================
    // Supervisor Callbacks
    // =========================================================================

    pub(crate) fn mark_running(&self, guid: &str) -> Option<Container> {
        let mut entries = self.lock();
        let entry = entries.get_mut(guid)?;
        entry.container.state = ContainerState::Running;
        Some(entry.container.clone())
    }

    pub(crate) fn mark_completed(&self, guid: &str, result: RunResult) -> Option<Container> {
        let mut entries = self.lock();
        let entry = entries.get_mut(guid)?;
        entry.container.state = ContainerState::Completed;
        entry.container.run_result = result;
        entry.completed_at = Some(Instant::now());
        entry.supervisor = None;
        Some(entry.container.clone())
    }

    pub(crate) fn hub(&self) -> &EventHub {
        &self.hub
    }

    // =========================================================================
    // Background Tasks
    // =========================================================================

    /// Destroys every runtime container owned by this agent. Sole crash
    /// recovery: previous-instance orphans are never adopted.
    pub async fn resynchronize(&self) -> Result<()> {
        let filter = HashMap::from([(
            CONTAINER_OWNER_PROPERTY.to_string(),
            self.config.owner_name.clone(),
        )]);

        let orphans = self.runtime.list(filter).await?;
        for sandbox in orphans {
            let handle = sandbox.handle().to_string();
            info!(handle, "destroying orphaned container from previous run");
            if let Err(err) = self.runtime.destroy(&handle).await {
                if !matches!(err, RuntimeError::ContainerNotFound(_)) {
                    warn!(handle, "failed to destroy orphan: {err}");
                }
            }
        }

        Ok(())
    }

    /// Long-running reaper for completed containers the caller never
    /// deleted. Non-completed entries are never touched.
    pub fn spawn_reaper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(self);
        let interval = store.config.reap_interval;

        tokio::spawn(async move {
            debug!("container reaper started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => store.reap_completed(interval).await,
                    _ = shutdown.cancelled() => {
                        debug!("container reaper stopping");
                        return;
                    }
                }
            }
        })
    }

    async fn reap_completed(&self, max_age: Duration) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .lock()
            .values()
            .filter(|entry| {
                entry.container.state == ContainerState::Completed
                    && entry
                        .completed_at
                        .is_some_and(|at| now.duration_since(at) >= max_age)
            })
            .map(|entry| entry.container.guid.clone())
            .collect();

        for guid in expired {
            info!(guid, "reaping expired completed container");
            if let Err(err) = self.destroy(&guid).await {
                error!(guid, "failed to reap container: {err}");
            }
        }
    }

    /// Signals every active supervisor and waits for all of them to
    /// drain. Part of graceful shutdown.
    pub async fn drain(&self) {
        let handles: Vec<SupervisorHandle> = {
            let mut entries = self.lock();
            entries
                .values_mut()
                .filter_map(|entry| entry.supervisor.take())
                .collect()
        };

        info!(count = handles.len(), "draining active supervisors");
        for handle in handles {
            handle.stop.cancel();
            Self::await_done(handle.done).await;
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn sandbox_spec(&self, container: &Container, bind_mounts: Vec<crate::runtime::BindMount>) -> SandboxSpec {
        let cpu_weight = match container.resource.cpu_weight {
            0 => self.config.max_cpu_shares,
            weight => weight.min(self.config.max_cpu_shares),
        };
        let inode_limit = match container.resource.inode_limit {
            0 => self.config.inode_limit,
            limit => limit,
        };

        let mut properties = HashMap::from([
            (
                CONTAINER_OWNER_PROPERTY.to_string(),
                self.config.owner_name.clone(),
            ),
            (
                CONTAINER_STATE_PROPERTY.to_string(),
                ContainerState::Created.as_str().to_string(),
            ),
        ]);
        for (key, value) in &container.tags {
            properties.insert(format!("{TAG_PROPERTY_PREFIX}{key}"), value.clone());
        }

        SandboxSpec {
            handle: container.guid.clone(),
            memory_limit_mb: container.resource.memory_mb,
            disk_limit_mb: container.resource.disk_mb,
            cpu_weight,
            inode_limit,
            properties,
            bind_mounts,
        }
    }

    fn take_supervisor(&self, guid: &str) -> Result<Option<SupervisorHandle>> {
        let mut entries = self.lock();
        let entry = entries
            .get_mut(guid)
            .ok_or_else(|| Error::NotFound(guid.to_string()))?;
        Ok(entry.supervisor.take())
    }

    async fn await_done(mut done: watch::Receiver<bool>) {
        while !*done.borrow() {
            if done.changed().await.is_err() {
                return;
            }
        }
    }

    async fn destroy_sandbox(&self, guid: &str) -> Result<()> {
        match self.runtime.destroy(guid).await {
            Ok(()) => Ok(()),
            Err(RuntimeError::ContainerNotFound(_)) => {
                debug!(guid, "sandbox already gone on destroy");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, StoredContainer>> {
        self.entries.lock().expect("container store lock poisoned")
    }
}
