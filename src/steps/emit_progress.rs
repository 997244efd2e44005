//! Progress message wrapper step.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::logstream::LogStreamer;
use crate::steps::{BoxedStep, Step, StepResult};

/// Wraps an inner step with optional start/success/failure messages on
/// the container's log stream. The inner outcome passes through
/// unchanged.
pub struct EmitProgressStep {
    inner: BoxedStep,
    start_msg: Option<String>,
    success_msg: Option<String>,
    failure_msg: Option<String>,
    streamer: LogStreamer,
}

impl EmitProgressStep {
    pub fn new(
        inner: BoxedStep,
        start_msg: Option<String>,
        success_msg: Option<String>,
        failure_msg: Option<String>,
        streamer: LogStreamer,
    ) -> Self {
        Self {
            inner,
            start_msg,
            success_msg,
            failure_msg,
            streamer,
        }
    }
}

#[async_trait]
impl Step for EmitProgressStep {
    fn cancel_token(&self) -> &CancellationToken {
        self.inner.cancel_token()
    }

    async fn perform(&mut self) -> StepResult {
        if let Some(start) = &self.start_msg {
            self.streamer.stdout(start);
        }

        match self.inner.perform().await {
            Ok(()) => {
                if let Some(success) = &self.success_msg {
                    self.streamer.stdout(success);
                }
                Ok(())
            }
            Err(err) => {
                if let Some(failure) = &self.failure_msg {
                    match err.emittable_message() {
                        Some(detail) => self.streamer.stderr(format!("{failure}: {detail}")),
                        None => self.streamer.stderr(failure),
                    }
                }
                Err(err)
            }
        }
    }

    async fn cleanup(&mut self) {
        self.inner.cleanup().await;
    }
}
