//! Agent configuration.
//!
//! Deserializable from JSON; every field has a default matching long-run
//! production values. Durations are expressed in milliseconds on the
//! wire. [`AgentConfig::validate`] enforces the startup invariants:
//! a zero CPU-share cap or a non-positive monitoring interval is a fatal
//! configuration error.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capacity::Resources;
use crate::constants;
use crate::error::Error;
use crate::runtime::RuntimeCapacity;

/// Literal megabytes or `"auto"` (queried from the runtime).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacitySetting {
    /// Take whatever the runtime reports.
    Auto,
    /// Fixed number of megabytes.
    Mb(u64),
}

impl CapacitySetting {
    fn resolve(&self, reported_mb: u64) -> u64 {
        match self {
            Self::Auto => reported_mb,
            Self::Mb(mb) => *mb,
        }
    }
}

impl Serialize for CapacitySetting {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Auto => serializer.serialize_str("auto"),
            Self::Mb(mb) => serializer.serialize_u64(*mb),
        }
    }
}

impl<'de> Deserialize<'de> for CapacitySetting {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Mb(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Mb(mb) => Ok(Self::Mb(mb)),
            Raw::Text(text) if text == "auto" => Ok(Self::Auto),
            Raw::Text(other) => Err(serde::de::Error::custom(format!(
                "expected a number of megabytes or \"auto\", got \"{other}\""
            ))),
        }
    }
}

/// Process spec for the periodic runtime self-check container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthcheckProcess {
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
}

/// Instance-identity issuance settings. Issuance is enabled only when
/// `cred_dir` is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceIdentityConfig {
    /// Host directory holding per-container credential directories.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cred_dir: Option<String>,
    /// PEM-encoded CA certificate path.
    #[serde(default)]
    pub ca_cert_path: String,
    /// PEM-encoded CA private key path.
    #[serde(default)]
    pub ca_key_path: String,
    /// Certificate validity window in milliseconds.
    #[serde(default = "default_credential_validity", with = "duration_ms")]
    pub validity: Duration,
}

fn default_credential_validity() -> Duration {
    constants::DEFAULT_CREDENTIAL_VALIDITY
}

/// Top-level agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Tag written on every runtime container; used by startup
    /// resynchronization and list filters.
    pub container_owner_name: String,

    /// Owner name for the agent's own self-check containers, kept apart
    /// so resync does not reap an in-flight check.
    pub healthcheck_container_owner_name: String,

    /// Upper bound on a container's CPU share weight. Zero is invalid.
    pub container_max_cpu_shares: u64,

    /// Inode limit passed to runtime create when the request leaves it 0.
    pub container_inode_limit: u64,

    /// How long a reservation may sit unclaimed before the pruner
    /// reclaims it (milliseconds).
    #[serde(with = "duration_ms")]
    pub reserved_expiration_time: Duration,

    /// Age at which completed containers are reaped (milliseconds).
    #[serde(with = "duration_ms")]
    pub container_reap_interval: Duration,

    /// Interval between liveness checks once healthy (milliseconds).
    #[serde(with = "duration_ms")]
    pub healthy_monitoring_interval: Duration,

    /// Interval between readiness checks while unhealthy (milliseconds).
    #[serde(with = "duration_ms")]
    pub unhealthy_monitoring_interval: Duration,

    pub max_concurrent_downloads: usize,
    pub max_concurrent_uploads: usize,
    pub healthcheck_work_pool_size: usize,

    /// Total memory available for containers, literal MB or `"auto"`.
    pub memory_mb: CapacitySetting,

    /// Total disk available for containers, literal MB or `"auto"`.
    pub disk_mb: CapacitySetting,

    /// Inject `CF_INSTANCE_*` variables into run steps.
    pub export_network_env_vars: bool,

    /// Allow actions with `privileged: true`.
    pub allow_privileged: bool,

    /// Periodic runtime self-check: process to run inside a scratch
    /// container. Disabled when the path is empty.
    pub runtime_healthcheck_process: HealthcheckProcess,

    /// Interval between runtime self-checks (milliseconds).
    #[serde(with = "duration_ms")]
    pub runtime_healthcheck_interval: Duration,

    /// Give-up deadline for one runtime self-check (milliseconds).
    #[serde(with = "duration_ms")]
    pub runtime_healthcheck_timeout: Duration,

    /// Instance-identity issuance.
    pub instance_identity: InstanceIdentityConfig,

    /// Mount point for issued credentials inside containers that do not
    /// specify their own.
    pub credentials_mount_path: String,

    /// Extra PEM CA bundle trusted for outbound downloads.
    pub path_to_ca_certs_for_downloads: String,

    /// Skip TLS verification on outbound downloads.
    pub skip_cert_verify: bool,

    /// On-disk artifact cache location.
    pub cache_path: String,

    /// Cap on the artifact cache, in bytes.
    pub max_cache_size_bytes: u64,

    /// Scratch space for uploads and downloads.
    pub temp_dir: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            container_owner_name: constants::DEFAULT_CONTAINER_OWNER_NAME.to_string(),
            healthcheck_container_owner_name: constants::DEFAULT_HEALTHCHECK_OWNER_NAME
                .to_string(),
            container_max_cpu_shares: 1024,
            container_inode_limit: constants::DEFAULT_CONTAINER_INODE_LIMIT,
            reserved_expiration_time: constants::DEFAULT_RESERVED_EXPIRATION,
            container_reap_interval: constants::DEFAULT_CONTAINER_REAP_INTERVAL,
            healthy_monitoring_interval: constants::DEFAULT_HEALTHY_MONITORING_INTERVAL,
            unhealthy_monitoring_interval: constants::DEFAULT_UNHEALTHY_MONITORING_INTERVAL,
            max_concurrent_downloads: constants::DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            max_concurrent_uploads: constants::DEFAULT_MAX_CONCURRENT_UPLOADS,
            healthcheck_work_pool_size: constants::DEFAULT_HEALTHCHECK_WORK_POOL_SIZE,
            memory_mb: CapacitySetting::Auto,
            disk_mb: CapacitySetting::Auto,
            export_network_env_vars: false,
            allow_privileged: false,
            runtime_healthcheck_process: HealthcheckProcess::default(),
            runtime_healthcheck_interval: Duration::from_secs(10 * 60),
            runtime_healthcheck_timeout: Duration::from_secs(10 * 60),
            instance_identity: InstanceIdentityConfig::default(),
            credentials_mount_path: "/etc/cf-instance-credentials".to_string(),
            path_to_ca_certs_for_downloads: String::new(),
            skip_cert_verify: false,
            cache_path: "/tmp/cache".to_string(),
            max_cache_size_bytes: constants::DEFAULT_MAX_CACHE_SIZE_BYTES,
            temp_dir: "/tmp".to_string(),
        }
    }
}

impl AgentConfig {
    /// Checks the startup invariants. Failures are fatal.
    pub fn validate(&self) -> Result<(), Error> {
        if self.container_max_cpu_shares == 0 {
            return Err(Error::InvalidConfiguration(
                "container_max_cpu_shares must be positive".to_string(),
            ));
        }

        if self.healthy_monitoring_interval.is_zero() {
            return Err(Error::InvalidConfiguration(
                "healthy_monitoring_interval must be positive".to_string(),
            ));
        }

        if self.unhealthy_monitoring_interval.is_zero() {
            return Err(Error::InvalidConfiguration(
                "unhealthy_monitoring_interval must be positive".to_string(),
            ));
        }

        for (name, size) in [
            ("max_concurrent_downloads", self.max_concurrent_downloads),
            ("max_concurrent_uploads", self.max_concurrent_uploads),
            (
                "healthcheck_work_pool_size",
                self.healthcheck_work_pool_size,
            ),
        ] {
            if size == 0 {
                return Err(Error::InvalidConfiguration(format!(
                    "{name} must be positive"
                )));
            }
        }

        Ok(())
    }

    /// Resolves the configured capacity against what the runtime reports.
    pub fn resolve_capacity(&self, reported: RuntimeCapacity) -> Resources {
        Resources::new(
            self.memory_mb.resolve(reported.memory_mb),
            self.disk_mb.resolve(reported.disk_mb),
            reported.max_containers,
        )
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
