//! Executable action steps.
//!
//! A step is the runtime materialization of one action-tree node, bound
//! to a container sandbox and log streamer. Every step performs exactly
//! once, may be cancelled at most once, and is cleaned up by its owning
//! combinator. Parents own their children exclusively; cancellation is
//! broadcast downward through hierarchical cancellation tokens, so a
//! combinator never needs a back-reference into a running child.
//!
//! Cancellation is cooperative: `cancel` is idempotent and non-blocking,
//! and a cancelled step fails with [`StepError::Cancelled`] at its next
//! suspension point. `Cancelled` is a sentinel: the run supervisor
//! recognizes it on the stop path and reports "stopped" instead of a
//! failure.

mod codependent;
mod download;
mod emit_progress;
mod long_running_monitor;
mod monitor;
mod parallel;
mod run;
mod serial;
mod timeout;
mod try_step;
mod upload;

pub use codependent::CodependentStep;
pub use download::DownloadStep;
pub use emit_progress::EmitProgressStep;
pub use long_running_monitor::LongRunningMonitorStep;
pub use monitor::MonitorStep;
pub use parallel::ParallelStep;
pub use run::{NetworkEnv, RunStep};
pub use serial::SerialStep;
pub use timeout::TimeoutStep;
pub use try_step::TryStep;
pub use upload::UploadStep;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{DownloadError, InvalidIntervalError, RuntimeError, UploadError};

/// Outcome of performing a step.
pub type StepResult = Result<(), StepError>;

/// Errors produced by steps.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// The step was cancelled. Sentinel: never surfaced as a failure on
    /// a stop path.
    #[error("cancelled")]
    Cancelled,

    /// An error carrying a user-facing message that has been written to
    /// the container's log stream.
    #[error("{message}")]
    Emittable {
        message: String,
        #[source]
        source: Option<Box<StepError>>,
    },

    /// A cancelled process refused to die within the exit timeout.
    #[error("process did not exit within {timeout:?} of being cancelled")]
    ExitTimeout { timeout: std::time::Duration },

    /// The action asked for privileges the agent does not permit.
    #[error("privileged actions are not permitted")]
    PrivilegedNotAllowed,

    #[error(transparent)]
    InvalidInterval(#[from] InvalidIntervalError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    /// URL parse failures stay opaque: the URL may embed credentials.
    #[error("invalid url")]
    InvalidUrl(#[from] url::ParseError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StepError {
    pub fn emittable(message: impl Into<String>, source: Option<StepError>) -> Self {
        StepError::Emittable {
            message: message.into(),
            source: source.map(Box::new),
        }
    }

    /// The user-facing message, when this error carries one.
    pub fn emittable_message(&self) -> Option<&str> {
        match self {
            StepError::Emittable { message, .. } => Some(message),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StepError::Cancelled)
    }
}

/// One executable node of the step tree.
#[async_trait]
pub trait Step: Send {
    /// The step's cancellation token. Combinators clone this to reach a
    /// child that has already been moved into a running task.
    fn cancel_token(&self) -> &CancellationToken;

    /// Requests cancellation. Idempotent, non-blocking, valid before,
    /// during, or after `perform`.
    fn cancel(&self) {
        self.cancel_token().cancel();
    }

    /// Does the step's work. Called exactly once.
    async fn perform(&mut self) -> StepResult;

    /// Best-effort teardown, called once by the containing combinator.
    async fn cleanup(&mut self) {}
}

/// Boxed step, as owned by combinators and the supervisor.
pub type BoxedStep = Box<dyn Step>;

/// Human-friendly byte count for progress lines, e.g. `3.5M`.
pub(crate) fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["K", "M", "G", "T"];

    if bytes < 1024 {
        return format!("{bytes}B");
    }

    let mut value = bytes as f64;
    let mut unit = "K";
    for u in UNITS {
        value /= 1024.0;
        unit = u;
        if value < 1024.0 {
            break;
        }
    }

    if value < 10.0 {
        format!("{value:.1}{unit}")
    } else {
        format!("{}{unit}", value.round() as u64)
    }
}

/// Human-friendly duration for timeout messages, e.g. `1m30s`.
pub(crate) fn format_duration(d: std::time::Duration) -> String {
    let total = d.as_secs();
    let (mins, secs) = (total / 60, total % 60);

    if total == 0 {
        format!("{}ms", d.as_millis())
    } else if mins == 0 {
        format!("{secs}s")
    } else if secs == 0 {
        format!("{mins}m")
    } else {
        format!("{mins}m{secs}s")
    }
}
