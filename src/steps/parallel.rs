//! Concurrent all-must-finish combinator step.

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::steps::{BoxedStep, Step, StepError, StepResult};

/// Starts all children concurrently and waits for every one of them.
/// The outcome is the first error observed in completion order, but
/// siblings of a failed child still run to completion. Cancellation
/// reaches every child through the token hierarchy.
pub struct ParallelStep {
    children: Vec<BoxedStep>,
    token: CancellationToken,
}

impl ParallelStep {
    pub fn new(children: Vec<BoxedStep>, token: CancellationToken) -> Self {
        Self { children, token }
    }
}

#[async_trait]
impl Step for ParallelStep {
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
        let mut first_error: Option<StepError> = None;

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, child, result)) => {
                    returned[index] = Some(child);
                    if let Err(err) = result {
                        first_error.get_or_insert(err);
                    }
                }
                Err(join_err) => {
                    first_error.get_or_insert(StepError::Io(std::io::Error::other(
                        join_err.to_string(),
                    )));
                }
            }
        }

        self.children = returned.into_iter().flatten().collect();

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn cleanup(&mut self) {
        for child in &mut self.children {
            child.cleanup().await;
        }
    }
}
