//! The agent facade.
//!
//! Composes the allocation store, the runtime-backed container store,
//! the event hub, and the capacity accountant into the single client the
//! HTTP layer talks to. Startup gates on a successful runtime ping,
//! resynchronizes by destroying this agent's orphaned runtime
//! containers, and spawns the background tasks (reservation pruner,
//! container reaper, runtime health checker).

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::capacity::{CapacityAccountant, Resources};
use crate::config::AgentConfig;
use crate::constants::PING_RUNTIME_INTERVAL;
use crate::container::{Container, Tags};
use crate::credentials::CredentialManager;
use crate::downloader::ArtifactDownloader;
use crate::error::{Error, Result, RuntimeError};
use crate::events::{ContainerEvent, EventHub};
use crate::healthcheck::RuntimeHealthChecker;
use crate::logstream::LogSink;
use crate::runtime::{ByteReader, RuntimeClient};
use crate::store::{AllocationStore, ContainerStore, ContainerStoreConfig};
use crate::transformer::Transformer;
use crate::uploader::Uploader;
use crate::workpool::WorkPool;

/// External collaborators injected at startup.
pub struct Collaborators {
    pub runtime: Arc<dyn RuntimeClient>,
    pub downloader: Arc<dyn ArtifactDownloader>,
    pub uploader: Arc<dyn Uploader>,
    pub credentials: Arc<dyn CredentialManager>,
    pub log_sink: Arc<dyn LogSink>,
}

/// The node-local container execution agent.
pub struct Agent {
    runtime: Arc<dyn RuntimeClient>,
    accountant: Arc<CapacityAccountant>,
    allocations: Arc<AllocationStore>,
    containers: Arc<ContainerStore>,
    hub: Arc<EventHub>,
    health: Arc<RuntimeHealthChecker>,
    shutdown: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Agent {
    /// Validates configuration, waits for the runtime, resynchronizes,
    /// and spawns the background tasks.
    ///
    /// Fatal errors (invalid configuration, unrecoverable runtime) are
    /// the caller's cue to exit with status 1.
    pub async fn start(config: AgentConfig, collaborators: Collaborators) -> Result<Arc<Self>> {
        config.validate()?;

        let Collaborators {
            runtime,
            downloader,
            uploader,
            credentials,
            log_sink,
        } = collaborators;

        wait_for_runtime(&runtime).await?;

        let total = config.resolve_capacity(runtime.capacity().await?);
        info!(
            memory_mb = total.memory_mb,
            disk_mb = total.disk_mb,
            containers = total.containers,
            "node capacity resolved"
        );

        let accountant = Arc::new(CapacityAccountant::new(total));
        let hub = Arc::new(EventHub::new());
        let healthcheck_pool = WorkPool::new(config.healthcheck_work_pool_size)?;

        let transformer = Transformer::new(
            downloader,
            uploader,
            config.max_concurrent_downloads,
            config.max_concurrent_uploads,
            healthcheck_pool,
            config.temp_dir.clone().into(),
            config.export_network_env_vars,
            config.allow_privileged,
            config.healthy_monitoring_interval,
            config.unhealthy_monitoring_interval,
        );

        let allocations = Arc::new(AllocationStore::new(Arc::clone(&accountant)));
        let containers = Arc::new(ContainerStore::new(
            ContainerStoreConfig {
                owner_name: config.container_owner_name.clone(),
                max_cpu_shares: config.container_max_cpu_shares,
                inode_limit: config.container_inode_limit,
                reap_interval: config.container_reap_interval,
            },
            Arc::clone(&runtime),
            Arc::clone(&accountant),
            transformer,
            Arc::clone(&hub),
            credentials,
            log_sink,
        ));

        containers.resynchronize().await?;

        let health = Arc::new(RuntimeHealthChecker::new(
            Arc::clone(&runtime),
            config.healthcheck_container_owner_name.clone(),
            config.runtime_healthcheck_process.clone(),
            config.runtime_healthcheck_timeout,
        ));

        let shutdown = CancellationToken::new();
        let mut background = vec![
            allocations.spawn_pruner(config.reserved_expiration_time, shutdown.clone()),
            containers.spawn_reaper(shutdown.clone()),
        ];
        if let Some(checker) = health.spawn(config.runtime_healthcheck_interval, shutdown.clone())
        {
            background.push(checker);
        }

        info!("agent started");
        Ok(Arc::new(Self {
            runtime,
            accountant,
            allocations,
            containers,
            hub,
            health,
            shutdown,
            background: Mutex::new(background),
        }))
    }

    // =========================================================================
    // Container Operations
    // =========================================================================

    /// Reserves capacity and stores the container as `Reserved`.
    pub fn allocate(&self, container: Container) -> Result<Container> {
        if container.guid.is_empty() {
            return Err(Error::InvalidConfiguration(
                "container guid must not be empty".to_string(),
            ));
        }

        let container = self.allocations.allocate(container)?;
        self.hub.emit(ContainerEvent::Reserved {
            container: container.clone(),
        });
        Ok(container)
    }

    /// Moves `Reserved` to `Initializing` and creates the sandbox. On
    /// failure the allocation keeps its capacity with a failed result
    /// until the caller deletes it.
    pub async fn initialize(&self, guid: &str) -> Result<Container> {
        self.allocations.initialize(guid)?;
        let container = self.allocations.lookup(guid)?;

        match self.containers.create(container).await {
            Ok(created) => {
                self.allocations.transfer(guid)?;
                Ok(created)
            }
            Err(err) => {
                let reason = err.to_string();
                match self.allocations.fail(guid, &reason) {
                    Ok(failed) => self.hub.emit(ContainerEvent::InitializeFailed {
                        container: failed,
                        reason,
                    }),
                    Err(fail_err) => {
                        warn!(guid, "failed to record initialize failure: {fail_err}")
                    }
                }
                Err(err)
            }
        }
    }

    /// Starts the container's run supervisor.
    pub fn run(&self, guid: &str) -> Result<()> {
        self.containers.run(guid)
    }

    /// Signals the container's supervisor to stop and waits for it.
    pub async fn stop(&self, guid: &str) -> Result<()> {
        self.containers.stop(guid).await
    }

    /// Deletes a container in any state: reservations are deallocated,
    /// runtime-backed containers are destroyed.
    pub async fn delete(&self, guid: &str) -> Result<()> {
        match self.allocations.deallocate(guid) {
            Ok(_) => Ok(()),
            Err(Error::NotFound(_)) => self.containers.destroy(guid).await,
            Err(err) => Err(err),
        }
    }

    pub fn lookup(&self, guid: &str) -> Result<Container> {
        match self.allocations.lookup(guid) {
            Ok(container) => Ok(container),
            Err(Error::NotFound(_)) => self.containers.lookup(guid),
            Err(err) => Err(err),
        }
    }

    /// All known containers, optionally filtered by tags.
    pub fn list(&self, tag_filter: &Tags) -> Vec<Container> {
        let mut result: Vec<Container> = self
            .allocations
            .list()
            .into_iter()
            .filter(|container| {
                tag_filter
                    .iter()
                    .all(|(k, v)| container.tags.get(k) == Some(v))
            })
            .collect();
        result.extend(self.containers.list(tag_filter));
        result
    }

    /// Streams a file out of a container's sandbox.
    pub async fn get_files(&self, guid: &str, source_path: &str) -> Result<ByteReader> {
        self.containers.get_files(guid, source_path).await
    }

    // =========================================================================
    // Resources, Events, Health
    // =========================================================================

    pub fn total_resources(&self) -> Resources {
        self.accountant.total()
    }

    pub fn remaining_resources(&self) -> Resources {
        self.accountant.remaining()
    }

    /// Pings the runtime and folds in the latest self-check verdict.
    pub async fn ping(&self) -> Result<()> {
        self.runtime.ping().await?;

        if !self.health.is_healthy() {
            return Err(RuntimeError::Connection(
                "runtime failed its most recent self-check".to_string(),
            )
            .into());
        }

        Ok(())
    }

    /// Subscribes to lifecycle events. `None` once the hub is closed.
    pub fn subscribe(&self) -> Option<mpsc::Receiver<ContainerEvent>> {
        self.hub.subscribe()
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Graceful shutdown: closes the event hub, signals every
    /// supervisor, waits for active step trees to drain, then stops the
    /// background tasks.
    pub async fn drain(&self) {
        info!("agent draining");
        self.hub.close();
        self.containers.drain().await;

        self.shutdown.cancel();
        let background = {
            let mut handles = self.background.lock().expect("background lock poisoned");
            std::mem::take(&mut *handles)
        };
        for handle in background {
            let _ = handle.await;
        }
        info!("agent drained");
    }
}

/// Pings the runtime once a second until it answers. Unrecoverable
/// errors abort startup.
async fn wait_for_runtime(runtime: &Arc<dyn RuntimeClient>) -> Result<()> {
    let start = tokio::time::Instant::now();

    loop {
        match runtime.ping().await {
            Ok(()) => {
                info!(waited = ?start.elapsed(), "runtime answered ping");
                return Ok(());
            }
            Err(RuntimeError::Unrecoverable(reason)) => {
                return Err(Error::RuntimeUnreachable(reason));
            }
            Err(err) => {
                warn!("runtime not ready: {err}");
                tokio::time::sleep(PING_RUNTIME_INTERVAL).await;
            }
        }
    }
}
