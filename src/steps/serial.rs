//! Sequential combinator step.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::steps::{BoxedStep, Step, StepError, StepResult};

/// Runs children strictly in array order. The first error
/// short-circuits; later children never start. Cleanup covers the
/// children that performed, in reverse order.
///
/// The combinator's token is the parent of every child's token, so
/// cancelling the serial reaches whichever child is currently running.
pub struct SerialStep {
    children: Vec<BoxedStep>,
    performed: usize,
    token: CancellationToken,
}

impl SerialStep {
    pub fn new(children: Vec<BoxedStep>, token: CancellationToken) -> Self {
        Self {
            children,
            performed: 0,
            token,
        }
    }
}

#[async_trait]
impl Step for SerialStep {
    fn cancel_token(&self) -> &CancellationToken {
        &self.token
    }

    async fn perform(&mut self) -> StepResult {
        for child in &mut self.children {
            if self.token.is_cancelled() {
                return Err(StepError::Cancelled);
            }

            self.performed += 1;
            child.perform().await?;
        }

        Ok(())
    }

    async fn cleanup(&mut self) {
        for child in self.children[..self.performed].iter_mut().rev() {
            child.cleanup().await;
        }
    }
}
