//! External container runtime client traits.
//!
//! The agent provisions sandboxes through a low-level runtime it does not
//! implement. These traits are the full contract the agent consumes:
//! lifecycle (`create`/`destroy`/`lookup`/`list`), per-sandbox process
//! execution with streaming IO, archive streaming in and out, and
//! key/value properties the agent uses to persist ownership, state, and
//! results across its own restarts.
//!
//! # Thread Safety
//!
//! Implementations must be `Send + Sync`; the agent calls them from many
//! tasks concurrently and never holds a store lock across a call.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::RuntimeError;

/// Boxed byte stream coming out of the runtime.
pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed byte stream going into the runtime.
pub type ByteWriter = Box<dyn AsyncWrite + Send + Unpin>;

// =============================================================================
// Specs
// =============================================================================

/// A host directory mounted into a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub src_path: String,
    pub dst_path: String,
    pub read_only: bool,
}

/// Everything the runtime needs to create a sandbox.
#[derive(Debug, Clone, Default)]
pub struct SandboxSpec {
    /// The container guid doubles as the runtime handle.
    pub handle: String,
    pub memory_limit_mb: u64,
    pub disk_limit_mb: u64,
    /// Relative CPU share weight, already clamped to the agent maximum.
    pub cpu_weight: u64,
    pub inode_limit: u64,
    /// Properties stamped on the sandbox at create.
    pub properties: HashMap<String, String>,
    pub bind_mounts: Vec<BindMount>,
}

/// A process to run inside a sandbox.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub path: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub dir: Option<String>,
    /// Open file descriptor cap, when set.
    pub nofile: Option<u64>,
    pub privileged: bool,
}

/// Where a process's output streams go.
#[derive(Default)]
pub struct ProcessIo {
    pub stdout: Option<ByteWriter>,
    pub stderr: Option<ByteWriter>,
}

/// Signal deliverable to a sandboxed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    /// Graceful termination request.
    Terminate,
    /// Forceful kill.
    Kill,
}

impl std::fmt::Display for ProcessSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Terminate => write!(f, "terminate"),
            Self::Kill => write!(f, "kill"),
        }
    }
}

// =============================================================================
// Info
// =============================================================================

/// Point-in-time sandbox information.
#[derive(Debug, Clone, Default)]
pub struct SandboxInfo {
    /// Noteworthy runtime events, e.g. `"out of memory"`.
    pub events: Vec<String>,
    /// Container-internal IP address.
    pub internal_ip: String,
    /// Externally routable host IP.
    pub external_ip: String,
    /// Current sandbox properties.
    pub properties: HashMap<String, String>,
}

/// Node capacity as reported by the runtime, used when the agent is
/// configured with `"auto"` memory or disk.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeCapacity {
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub max_containers: u64,
}

// =============================================================================
// Traits
// =============================================================================

/// Handle to a process started inside a sandbox.
#[async_trait]
pub trait SandboxProcess: Send {
    /// Waits for the process to exit and returns its exit status.
    async fn wait(&mut self) -> Result<i32, RuntimeError>;

    /// Delivers a signal. Non-blocking with respect to process exit.
    async fn signal(&self, signal: ProcessSignal) -> Result<(), RuntimeError>;
}

/// A runtime-managed isolated execution environment.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// The runtime handle, equal to the container guid.
    fn handle(&self) -> &str;

    /// Spawns a process with the given IO wiring.
    async fn run(
        &self,
        spec: ProcessSpec,
        io: ProcessIo,
    ) -> Result<Box<dyn SandboxProcess>, RuntimeError>;

    /// Streams a tar archive into the sandbox filesystem at `path`.
    async fn stream_in(&self, path: &str, archive: ByteReader) -> Result<(), RuntimeError>;

    /// Streams `path` out of the sandbox as a tar archive.
    async fn stream_out(&self, path: &str) -> Result<ByteReader, RuntimeError>;

    /// Writes one key/value property on the sandbox.
    async fn set_property(&self, key: &str, value: &str) -> Result<(), RuntimeError>;

    /// Current sandbox information.
    async fn info(&self) -> Result<SandboxInfo, RuntimeError>;
}

/// Client for the external low-level container runtime.
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Liveness probe. `RuntimeError::Unrecoverable` aborts agent startup.
    async fn ping(&self) -> Result<(), RuntimeError>;

    /// Total node capacity as seen by the runtime.
    async fn capacity(&self) -> Result<RuntimeCapacity, RuntimeError>;

    /// Creates a sandbox. The returned handle is immediately usable.
    async fn create(&self, spec: SandboxSpec) -> Result<std::sync::Arc<dyn Sandbox>, RuntimeError>;

    /// Destroys a sandbox and everything in it.
    async fn destroy(&self, handle: &str) -> Result<(), RuntimeError>;

    /// Looks up a live sandbox by handle.
    async fn lookup(&self, handle: &str) -> Result<std::sync::Arc<dyn Sandbox>, RuntimeError>;

    /// Lists sandboxes whose properties contain every given pair.
    async fn list(
        &self,
        properties: HashMap<String, String>,
    ) -> Result<Vec<std::sync::Arc<dyn Sandbox>>, RuntimeError>;
}
