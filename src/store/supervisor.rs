//! Per-container run supervisor.
//!
//! One supervisor task drives each container run: it spawns the step
//! tree, watches for the external stop signal and the monitor's
//! readiness token, translates the tree's outcome into a run result, and
//! performs the `Running` and `Completed` transitions, always writing
//! runtime properties before emitting the matching event, so a
//! subscriber that reads the runtime on receipt sees state at least as
//! new as the event.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::constants::{CONTAINER_RESULT_PROPERTY, CONTAINER_STATE_PROPERTY};
use crate::container::{ContainerState, RunResult};
use crate::events::ContainerEvent;
use crate::runtime::Sandbox;
use crate::steps::{BoxedStep, StepError};
use crate::store::ContainerStore;

/// The channels a supervisor selects over.
pub(crate) struct SupervisorChannels {
    /// External stop signal.
    pub stop: CancellationToken,
    /// Readiness token from the monitor (pre-signaled when unmonitored).
    pub has_started_running: mpsc::Receiver<()>,
    /// Signals supervisor exit to whoever is awaiting a stop or destroy.
    pub done: watch::Sender<bool>,
}

/// Drives one container run to completion.
pub(crate) async fn supervise(
    store: Arc<ContainerStore>,
    guid: String,
    sandbox: Arc<dyn Sandbox>,
    root: BoxedStep,
    root_token: CancellationToken,
    channels: SupervisorChannels,
) {
    let SupervisorChannels {
        stop,
        mut has_started_running,
        done,
    } = channels;

    let mut tree = tokio::spawn(async move {
        let mut root = root;
        let result = root.perform().await;
        root.cleanup().await;
        result
    });

    let mut told_to_stop = false;
    let mut forced_failure: Option<String> = None;
    let mut stop = Some(stop);
    let mut readiness_open = true;

    // Biased order: a pending stop is observed before the readiness
    // token, and the readiness token before tree completion, so a
    // container whose tree finishes instantly still emits Running ahead
    // of Complete.
    let tree_result = loop {
        tokio::select! {
            biased;

            _ = async { stop.as_ref().expect("stop channel cleared").cancelled().await },
                if stop.is_some() =>
            {
                info!(guid, "supervisor told to stop, cancelling step tree");
                told_to_stop = true;
                root_token.cancel();
                stop = None;
            }

            token = has_started_running.recv(), if readiness_open => {
                readiness_open = false;
                if token.is_some() {
                    match transition_to_running(&store, &guid, &sandbox).await {
                        Ok(()) => {}
                        Err(err) => {
                            error!(guid, "failed to transition to running: {err}");
                            forced_failure = Some(err.to_string());
                            root_token.cancel();
                        }
                    }
                }
            }

            joined = &mut tree => {
                break joined.unwrap_or_else(|join_err| {
                    Err(StepError::Io(std::io::Error::other(join_err.to_string())))
                });
            }
        }
    };

    let result = match (tree_result, forced_failure) {
        (_, Some(reason)) => RunResult::failure(reason),
        (Ok(()), None) => RunResult::default(),
        (Err(_), None) if told_to_stop => RunResult::stopped(),
        (Err(err), None) => RunResult::failure(err.to_string()),
    };

    transition_to_complete(&store, &guid, &sandbox, result).await;
    let _ = done.send(true);
}

async fn transition_to_running(
    store: &Arc<ContainerStore>,
    guid: &str,
    sandbox: &Arc<dyn Sandbox>,
) -> Result<(), crate::error::RuntimeError> {
    sandbox
        .set_property(
            CONTAINER_STATE_PROPERTY,
            ContainerState::Running.as_str(),
        )
        .await?;

    if let Some(container) = store.mark_running(guid) {
        info!(guid, "container running");
        store.hub().emit(ContainerEvent::Running { container });
    }

    Ok(())
}

async fn transition_to_complete(
    store: &Arc<ContainerStore>,
    guid: &str,
    sandbox: &Arc<dyn Sandbox>,
    result: RunResult,
) {
    let result_json =
        serde_json::to_string(&result).unwrap_or_else(|_| "{\"failed\":true}".to_string());

    if let Err(err) = sandbox
        .set_property(CONTAINER_RESULT_PROPERTY, &result_json)
        .await
    {
        error!(guid, "failed to write run result property: {err}");
    }
    if let Err(err) = sandbox
        .set_property(
            CONTAINER_STATE_PROPERTY,
            ContainerState::Completed.as_str(),
        )
        .await
    {
        error!(guid, "failed to write state property: {err}");
    }

    if let Some(container) = store.mark_completed(guid, result.clone()) {
        info!(
            guid,
            failed = result.failed,
            reason = %result.failure_reason,
            "container complete"
        );
        store.hub().emit(ContainerEvent::Complete { container, result });
    }
}
