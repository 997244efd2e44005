//! Constants for the execution agent.
//!
//! All limits, timeouts, and property keys are defined here to keep them
//! consistent across the stores, steps, and API layers.

use std::time::Duration;

// =============================================================================
// Runtime Property Keys
// =============================================================================

/// Property naming the agent instance that owns a runtime container.
/// Written at create; used by startup resynchronization and list filters.
pub const CONTAINER_OWNER_PROPERTY: &str = "stevedore:owner";

/// Property carrying the container's lifecycle state.
pub const CONTAINER_STATE_PROPERTY: &str = "stevedore:state";

/// Property carrying the JSON-encoded run result once a container completes.
pub const CONTAINER_RESULT_PROPERTY: &str = "stevedore:result";

/// Prefix for caller-supplied tags stored as runtime properties.
pub const TAG_PROPERTY_PREFIX: &str = "tag:";

// =============================================================================
// Process Teardown
// =============================================================================

/// Grace period between the terminate signal and the kill signal when a
/// run step is cancelled.
pub const TERMINATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Total time a cancelled run step waits for the process to exit before
/// giving up with an exit-timeout error.
pub const EXIT_TIMEOUT: Duration = Duration::from_secs(60);

// =============================================================================
// Network Environment
// =============================================================================

/// Environment variables injected into run steps when network env export
/// is enabled.
pub const ENV_INSTANCE_IP: &str = "CF_INSTANCE_IP";
pub const ENV_INSTANCE_PORT: &str = "CF_INSTANCE_PORT";
pub const ENV_INSTANCE_ADDR: &str = "CF_INSTANCE_ADDR";
pub const ENV_INSTANCE_PORTS: &str = "CF_INSTANCE_PORTS";

// =============================================================================
// Defaults
// =============================================================================

/// How long a reservation may sit in `Reserved` before the pruner
/// reclaims it.
pub const DEFAULT_RESERVED_EXPIRATION: Duration = Duration::from_secs(60);

/// How long a completed container may linger before the reaper destroys it.
pub const DEFAULT_CONTAINER_REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Interval between liveness checks once a container is healthy.
pub const DEFAULT_HEALTHY_MONITORING_INTERVAL: Duration = Duration::from_secs(30);

/// Interval between readiness checks while a container is unhealthy.
pub const DEFAULT_UNHEALTHY_MONITORING_INTERVAL: Duration = Duration::from_millis(500);

/// Delay between startup pings while waiting for the runtime to answer.
pub const PING_RUNTIME_INTERVAL: Duration = Duration::from_secs(1);

pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 5;
pub const DEFAULT_MAX_CONCURRENT_UPLOADS: usize = 5;
pub const DEFAULT_HEALTHCHECK_WORK_POOL_SIZE: usize = 64;

/// Default inode limit passed to runtime create.
pub const DEFAULT_CONTAINER_INODE_LIMIT: u64 = 200_000;

/// Default owner names written on runtime containers.
pub const DEFAULT_CONTAINER_OWNER_NAME: &str = "stevedore";
pub const DEFAULT_HEALTHCHECK_OWNER_NAME: &str = "stevedore-health-check";

/// Default cap on the artifact download cache.
pub const DEFAULT_MAX_CACHE_SIZE_BYTES: u64 = 10 * 1024 * 1024 * 1024;

/// Per-subscriber event buffer depth. Emission to a full buffer drops the
/// event for that subscriber rather than blocking the emitter.
pub const EVENT_SUBSCRIBER_BUFFER: usize = 10;

/// Validity window for issued instance-identity certificates.
pub const DEFAULT_CREDENTIAL_VALIDITY: Duration = Duration::from_secs(24 * 60 * 60);
