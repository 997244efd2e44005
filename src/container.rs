//! Container model and lifecycle states.
//!
//! A [`Container`] is the central entity of the agent. It moves through a
//! strict state sequence:
//!
//! ```text
//!            reserve        initialize       create         mark running      complete
//!  (absent) ─────────► Reserved ─────► Initializing ─► Created ─────────► Running ─────► Completed
//!                          │                │              │                               ▲
//!                          │                └──fail────────┴───────────────────────────────┘
//!                          └── expire ──► (absent)
//! ```
//!
//! Transitions outside this graph fail with `InvalidTransition` and leave
//! state, capacity, and the runtime untouched.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::actions::Action;

/// Caller-supplied string tags attached to a container and written onto
/// the runtime object as prefixed properties.
pub type Tags = BTreeMap<String, String>;

// =============================================================================
// Lifecycle State
// =============================================================================

/// Container lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    /// Capacity is held; nothing exists in the runtime yet.
    Reserved,
    /// The caller has begun provisioning; still no runtime object.
    Initializing,
    /// A runtime sandbox exists but the step tree has not started.
    Created,
    /// The readiness gate has passed (or no monitor is configured).
    Running,
    /// Terminal. The runtime object survives until deletion or reaping.
    Completed,
}

impl ContainerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::Initializing => "initializing",
            Self::Created => "created",
            Self::Running => "running",
            Self::Completed => "completed",
        }
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Resources
// =============================================================================

/// Resource request attached to a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Memory in megabytes.
    pub memory_mb: u64,
    /// Disk in megabytes.
    pub disk_mb: u64,
    /// Relative CPU share weight.
    #[serde(default)]
    pub cpu_weight: u64,
    /// Inode limit passed to runtime create (0 means the agent default).
    #[serde(default)]
    pub inode_limit: u64,
}

// =============================================================================
// Network
// =============================================================================

/// A host-to-container port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
}

// =============================================================================
// Log Addressing
// =============================================================================

/// Where a container's log lines are attributed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log stream guid (usually the application guid, not the container's).
    pub guid: String,
    /// Source name stamped on each line, e.g. `APP`.
    pub source_name: String,
    /// Instance index within the log stream.
    #[serde(default)]
    pub index: u32,
}

// =============================================================================
// Run Result
// =============================================================================

/// Outcome of a container run, written onto the runtime object as a
/// property when the container completes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    /// True when the step tree failed for a reason other than an external
    /// stop.
    pub failed: bool,
    /// Human-readable reason. `"stopped"` for externally stopped runs.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub failure_reason: String,
    /// True when the run ended because of an external stop signal.
    #[serde(default)]
    pub stopped: bool,
}

impl RunResult {
    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            failed: true,
            failure_reason: reason.into(),
            stopped: false,
        }
    }

    pub fn stopped() -> Self {
        Self {
            failed: false,
            failure_reason: "stopped".to_string(),
            stopped: true,
        }
    }
}

// =============================================================================
// Container
// =============================================================================

/// Declarative container specification plus tracked lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    /// Caller-supplied unique identifier. Unique across all non-completed
    /// containers.
    pub guid: String,

    /// Current lifecycle state.
    #[serde(default = "default_state")]
    pub state: ContainerState,

    /// Requested resources.
    #[serde(default)]
    pub resource: Resource,

    /// Caller tags, also written onto the runtime object.
    #[serde(default)]
    pub tags: Tags,

    /// Externally routable IP of the node hosting this container.
    #[serde(default)]
    pub external_ip: String,

    /// Container-internal IP, once known. Used for instance-identity
    /// certificates.
    #[serde(default)]
    pub internal_ip: String,

    /// Host-to-container port mappings.
    #[serde(default)]
    pub ports: Vec<PortMapping>,

    /// Log addressing for step and process output.
    #[serde(default)]
    pub log: LogConfig,

    /// Optional action run before the main action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup: Option<Action>,

    /// The main action.
    pub action: Action,

    /// Optional monitor action gating the transition to `Running`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor: Option<Action>,

    /// Seconds the monitor may take to pass its first readiness check.
    /// Zero means no limit.
    #[serde(default)]
    pub start_timeout_secs: u64,

    /// Where instance-identity credentials are mounted inside the
    /// container, when issuance is enabled.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub credentials_mount_path: String,

    /// Result of the run; meaningful once `state` is `Completed` or after
    /// a failed initialize.
    #[serde(default)]
    pub run_result: RunResult,

    /// When the reservation was made.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocated_at: Option<chrono::DateTime<chrono::Utc>>,
}

fn default_state() -> ContainerState {
    ContainerState::Reserved
}

impl Container {
    /// Duration form of the start timeout; `None` when unlimited.
    pub fn start_timeout(&self) -> Option<std::time::Duration> {
        match self.start_timeout_secs {
            0 => None,
            secs => Some(std::time::Duration::from_secs(secs)),
        }
    }

    /// True once the container has a corresponding runtime object.
    pub fn has_runtime_object(&self) -> bool {
        matches!(
            self.state,
            ContainerState::Created | ContainerState::Running | ContainerState::Completed
        )
    }
}
