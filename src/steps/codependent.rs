//! Mutually dependent combinator step.

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::steps::{BoxedStep, Step, StepError, StepResult};

/// Starts all children concurrently; the first child to exit, success
/// or failure, cancels all siblings, and the combinator's outcome is
/// that first exit's result. Remaining children are still awaited to
/// their natural ends before the step returns.
///
/// Used to tie a container's main action to its monitor: whichever stops
/// first brings the other down.
pub struct CodependentStep {
    children: Vec<BoxedStep>,
    token: CancellationToken,
}

impl CodependentStep {
    pub fn new(children: Vec<BoxedStep>, token: CancellationToken) -> Self {
        Self { children, token }
    }
}

#[async_trait]
impl Step for CodependentStep {
    fn cancel_token(&self) -> &CancellationToken {
        &self.token
    }

    async fn perform(&mut self) -> StepResult {
        let children = std::mem::take(&mut self.children);
        let count = children.len();

        let mut set = JoinSet::new();
        for (index, mut child) in children.into_iter().enumerate() {
            set.spawn(async move {
                let result = child.perform().await;
                (index, child, result)
            });
        }

        let mut returned: Vec<Option<BoxedStep>> = (0..count).map(|_| None).collect();
        let mut first_exit: Option<StepResult> = None;

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, child, result)) => {
                    returned[index] = Some(child);
                    if first_exit.is_none() {
                        debug!("codependent child exited, cancelling siblings");
                        first_exit = Some(result);
                        self.token.cancel();
                    }
                }
                Err(join_err) => {
                    if first_exit.is_none() {
                        first_exit = Some(Err(StepError::Io(std::io::Error::other(
                            join_err.to_string(),
                        ))));
                        self.token.cancel();
                    }
                }
            }
        }

        self.children = returned.into_iter().flatten().collect();
        first_exit.unwrap_or(Ok(()))
    }

    async fn cleanup(&mut self) {
        for child in &mut self.children {
            child.cleanup().await;
        }
    }
}
