//! Deadline wrapper step.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::steps::{format_duration, BoxedStep, Step, StepError, StepResult};

/// Races the inner step against a timer. If the timer wins, the inner is
/// cancelled, awaited to its natural exit, and the step fails with an
/// emittable timeout error wrapping whatever the inner returned.
pub struct TimeoutStep {
    inner: BoxedStep,
    deadline: Duration,
}

impl TimeoutStep {
    pub fn new(inner: BoxedStep, deadline: Duration) -> Self {
        Self { inner, deadline }
    }
}

#[async_trait]
impl Step for TimeoutStep {
    fn cancel_token(&self) -> &CancellationToken {
        self.inner.cancel_token()
    }

    async fn perform(&mut self) -> StepResult {
        let deadline = self.deadline;
        let inner_cancel = self.inner.cancel_token().clone();

        let fut = self.inner.perform();
        tokio::pin!(fut);

        tokio::select! {
            result = &mut fut => result,
            _ = tokio::time::sleep(deadline) => {
                info!(deadline = ?deadline, "step exceeded its deadline, cancelling");
                inner_cancel.cancel();
                let result = fut.await;
                Err(StepError::emittable(
                    format!("exceeded {} timeout", format_duration(deadline)),
                    result.err(),
                ))
            }
        }
    }

    async fn cleanup(&mut self) {
        self.inner.cleanup().await;
    }
}
