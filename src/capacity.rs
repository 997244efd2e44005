//! Node capacity accounting.
//!
//! The accountant tracks the (memory MB, disk MB, container count) triple
//! shared by both stores. Capacity is subtracted exactly once, when a
//! container is reserved, and added back exactly once, when the container
//! leaves whichever store holds the claim, by reservation expiry
//! or by deletion after completion.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::container::Resource;
use crate::error::Error;

/// A point-in-time view of node resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// Memory in megabytes.
    pub memory_mb: u64,
    /// Disk in megabytes.
    pub disk_mb: u64,
    /// Number of containers.
    pub containers: u64,
}

impl Resources {
    pub fn new(memory_mb: u64, disk_mb: u64, containers: u64) -> Self {
        Self {
            memory_mb,
            disk_mb,
            containers,
        }
    }

    /// True if this view can absorb `resource` without going negative.
    fn can_fit(&self, resource: &Resource) -> bool {
        self.memory_mb >= resource.memory_mb
            && self.disk_mb >= resource.disk_mb
            && self.containers >= 1
    }
}

/// Check-and-subtract capacity accountant.
///
/// All mutation happens under one mutex so availability can never go
/// negative. The lock is never held across I/O.
pub struct CapacityAccountant {
    total: Resources,
    remaining: Mutex<Resources>,
}

impl CapacityAccountant {
    pub fn new(total: Resources) -> Self {
        Self {
            total,
            remaining: Mutex::new(total),
        }
    }

    /// The fixed total capacity of the node.
    pub fn total(&self) -> Resources {
        self.total
    }

    /// Snapshot of currently available capacity.
    pub fn remaining(&self) -> Resources {
        *self.remaining.lock().expect("capacity lock poisoned")
    }

    /// Atomically claims `resource` from the available triple.
    ///
    /// Fails with `InsufficientCapacity` and no partial effect when the
    /// triple cannot be satisfied.
    pub fn claim(&self, resource: &Resource) -> Result<(), Error> {
        let mut remaining = self.remaining.lock().expect("capacity lock poisoned");
        if !remaining.can_fit(resource) {
            return Err(Error::InsufficientCapacity {
                requested_memory_mb: resource.memory_mb,
                requested_disk_mb: resource.disk_mb,
            });
        }

        remaining.memory_mb -= resource.memory_mb;
        remaining.disk_mb -= resource.disk_mb;
        remaining.containers -= 1;
        Ok(())
    }

    /// Returns a previously claimed `resource` to the available triple.
    pub fn release(&self, resource: &Resource) {
        let mut remaining = self.remaining.lock().expect("capacity lock poisoned");
        remaining.memory_mb += resource.memory_mb;
        remaining.disk_mb += resource.disk_mb;
        remaining.containers += 1;
    }
}
