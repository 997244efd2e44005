//! Best-effort wrapper step.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::steps::{BoxedStep, Step, StepResult};

/// Performs the inner step and succeeds no matter what it returns.
/// Cancelling the try cancels the inner.
pub struct TryStep {
    inner: BoxedStep,
}

impl TryStep {
    pub fn new(inner: BoxedStep) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Step for TryStep {
    fn cancel_token(&self) -> &CancellationToken {
        self.inner.cancel_token()
    }

    async fn perform(&mut self) -> StepResult {
        if let Err(err) = self.inner.perform().await {
            debug!("ignoring failure of optional step: {err}");
        }
        Ok(())
    }

    async fn cleanup(&mut self) {
        self.inner.cleanup().await;
    }
}
