//! Error types for the execution agent.

use std::time::Duration;

/// Result type alias for agent operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned synchronously to API callers.
///
/// Transition errors (`NotFound`, `AlreadyExists`, `InvalidTransition`,
/// `InsufficientCapacity`) are never retried internally and never surface
/// as container failures.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Transition Errors
    // =========================================================================
    /// No container with this guid in any store.
    #[error("container not found: {0}")]
    NotFound(String),

    /// A non-completed container already holds this guid.
    #[error("container already exists: {0}")]
    AlreadyExists(String),

    /// The requested transition does not appear in the lifecycle graph.
    #[error("container '{guid}' cannot transition from '{from}' via {operation}")]
    InvalidTransition {
        guid: String,
        from: &'static str,
        operation: &'static str,
    },

    /// The node cannot satisfy the requested resource triple.
    #[error("insufficient capacity: requested {requested_memory_mb}MB memory / {requested_disk_mb}MB disk")]
    InsufficientCapacity {
        requested_memory_mb: u64,
        requested_disk_mb: u64,
    },

    // =========================================================================
    // Configuration / Startup Errors
    // =========================================================================
    /// Configuration rejected at startup. Fatal: the embedding process
    /// should exit with status 1.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The runtime reported an unrecoverable error on the initial ping.
    /// Fatal: the embedding process should exit with status 1.
    #[error("runtime unreachable: {0}")]
    RuntimeUnreachable(String),

    // =========================================================================
    // Pass-through
    // =========================================================================
    /// Error from the external container runtime.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl Error {
    /// True for errors that should abort agent startup.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::InvalidConfiguration(_) | Error::RuntimeUnreachable(_)
        )
    }
}

/// Errors from the external low-level container runtime client.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The runtime has no container with this handle.
    #[error("runtime container not found: {0}")]
    ContainerNotFound(String),

    /// The runtime is in a state it cannot recover from; retrying is
    /// pointless and startup should abort.
    #[error("unrecoverable runtime error: {0}")]
    Unrecoverable(String),

    /// A runtime operation failed.
    #[error("runtime {operation} failed for '{handle}': {reason}")]
    OperationFailed {
        operation: &'static str,
        handle: String,
        reason: String,
    },

    /// Transport-level failure talking to the runtime.
    #[error("runtime connection error: {0}")]
    Connection(String),
}

impl RuntimeError {
    pub fn operation(
        operation: &'static str,
        handle: impl Into<String>,
        reason: impl ToString,
    ) -> Self {
        RuntimeError::OperationFailed {
            operation,
            handle: handle.into(),
            reason: reason.to_string(),
        }
    }
}

/// Errors from the cached artifact downloader.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    /// The fetch was cancelled before or during the transfer.
    #[error("download cancelled")]
    Cancelled,

    /// The server answered with a non-success status.
    #[error("fetch of '{url}' returned status {status}")]
    BadStatus { url: String, status: u16 },

    /// The fetched bytes did not match the expected checksum.
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Transfer or transform I/O failure.
    #[error("download failed: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP transport failure.
    #[error("download failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Errors from the artifact uploader.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// The upload was cancelled before or during the transfer.
    #[error("upload cancelled")]
    Cancelled,

    /// The server answered with a non-success status.
    #[error("upload returned status {status}")]
    BadStatus { status: u16 },

    /// Local file I/O failure.
    #[error("upload failed: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP transport failure.
    #[error("upload failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Errors from instance-identity credential issuance.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("failed to create credential directory {path}: {reason}")]
    CredDir { path: String, reason: String },

    #[error("failed to load CA material from {path}: {reason}")]
    CaMaterial { path: String, reason: String },

    #[error("certificate generation failed: {0}")]
    Generation(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A monitoring interval that must be positive was not.
#[derive(Debug, thiserror::Error)]
#[error("the {field} interval, {interval:?}, is not positive")]
pub struct InvalidIntervalError {
    pub field: &'static str,
    pub interval: Duration,
}
