//! Pre-runtime reservation store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::capacity::CapacityAccountant;
use crate::container::{Container, ContainerState, RunResult};
use crate::error::{Error, Result};

struct Allocation {
    container: Container,
    allocated_at: Instant,
}

/// Holds containers in `Reserved` and `Initializing`: reservations that
/// have claimed capacity but do not yet have a runtime object.
///
/// All mutation is serialized behind one mutex; readers copy out. The
/// mutex is never held across I/O (nothing in here does any).
pub struct AllocationStore {
    accountant: Arc<CapacityAccountant>,
    allocations: Mutex<HashMap<String, Allocation>>,
}

impl AllocationStore {
    pub fn new(accountant: Arc<CapacityAccountant>) -> Self {
        Self {
            accountant,
            allocations: Mutex::new(HashMap::new()),
        }
    }

    /// Reserves capacity for `container` and stores it in `Reserved`.
    ///
    /// Fails with `AlreadyExists` when the guid is taken and with
    /// `InsufficientCapacity` when the resource triple does not fit;
    /// neither failure has any side effect.
    pub fn allocate(&self, mut container: Container) -> Result<Container> {
        let mut allocations = self.lock();

        if allocations.contains_key(&container.guid) {
            return Err(Error::AlreadyExists(container.guid));
        }

        self.accountant.claim(&container.resource)?;

        container.state = ContainerState::Reserved;
        container.allocated_at = Some(chrono::Utc::now());

        info!(guid = %container.guid, "reserved container");
        allocations.insert(
            container.guid.clone(),
            Allocation {
                container: container.clone(),
                allocated_at: Instant::now(),
            },
        );

        Ok(container)
    }

    /// Moves a `Reserved` container to `Initializing`.
    pub fn initialize(&self, guid: &str) -> Result<()> {
        let mut allocations = self.lock();
        let allocation = allocations
            .get_mut(guid)
            .ok_or_else(|| Error::NotFound(guid.to_string()))?;

        match allocation.container.state {
            ContainerState::Reserved => {
                allocation.container.state = ContainerState::Initializing;
                Ok(())
            }
            state => Err(Error::InvalidTransition {
                guid: guid.to_string(),
                from: state.as_str(),
                operation: "initialize",
            }),
        }
    }

    /// Records a failed run result on an `Initializing` container. The
    /// entry stays in the store, still holding its capacity claim, until
    /// the caller deletes it.
    pub fn fail(&self, guid: &str, reason: impl Into<String>) -> Result<Container> {
        let mut allocations = self.lock();
        let allocation = allocations
            .get_mut(guid)
            .ok_or_else(|| Error::NotFound(guid.to_string()))?;

        match allocation.container.state {
            ContainerState::Initializing => {
                allocation.container.run_result = RunResult::failure(reason);
                Ok(allocation.container.clone())
            }
            state => Err(Error::InvalidTransition {
                guid: guid.to_string(),
                from: state.as_str(),
                operation: "fail",
            }),
        }
    }

    /// Removes the entry and releases its capacity.
    pub fn deallocate(&self, guid: &str) -> Result<Container> {
        let allocation = self
            .lock()
            .remove(guid)
            .ok_or_else(|| Error::NotFound(guid.to_string()))?;

        self.accountant.release(&allocation.container.resource);
        info!(guid, "deallocated container");
        Ok(allocation.container)
    }

    /// Removes the entry without releasing capacity: the claim travels
    /// with the container into the runtime-backed store.
    pub(crate) fn transfer(&self, guid: &str) -> Result<Container> {
        self.lock()
            .remove(guid)
            .map(|a| a.container)
            .ok_or_else(|| Error::NotFound(guid.to_string()))
    }

    pub fn lookup(&self, guid: &str) -> Result<Container> {
        self.lock()
            .get(guid)
            .map(|a| a.container.clone())
            .ok_or_else(|| Error::NotFound(guid.to_string()))
    }

    pub fn list(&self) -> Vec<Container> {
        self.lock().values().map(|a| a.container.clone()).collect()
    }

    /// Deallocates `Reserved` entries older than `expiration`.
    /// `Initializing` entries are never touched. Pruning is silent: no
    /// event is emitted, since the caller that would act on the
    /// reservation has already abandoned it.
    pub fn prune_expired(&self, expiration: Duration) {
        let now = Instant::now();
        let mut expired = Vec::new();

        {
            let mut allocations = self.lock();
            allocations.retain(|guid, allocation| {
                let keep = allocation.container.state != ContainerState::Reserved
                    || now.duration_since(allocation.allocated_at) < expiration;
                if !keep {
                    expired.push((guid.clone(), allocation.container.resource.clone()));
                }
                keep
            });
        }

        for (guid, resource) in expired {
            self.accountant.release(&resource);
            info!(guid, "pruned expired reservation");
        }
    }

    /// Long-running reservation pruner. Scans on every `expiration` tick
    /// until `shutdown` fires.
    pub fn spawn_pruner(
        self: &Arc<Self>,
        expiration: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            debug!("reservation pruner started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(expiration) => store.prune_expired(expiration),
                    _ = shutdown.cancelled() => {
                        debug!("reservation pruner stopping");
                        return;
                    }
                }
            }
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Allocation>> {
        self.allocations.lock().expect("allocation store lock poisoned")
    }
}
