//! Periodic runtime self-check.
//!
//! Verifies on an interval that the runtime can still create a sandbox
//! and run a process in it. The check container carries its own owner
//! name so a normal resynchronization never reaps one mid-check. The
//! latest verdict is exposed to the API's ping handler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HealthcheckProcess;
use crate::constants::CONTAINER_OWNER_PROPERTY;
use crate::error::RuntimeError;
use crate::runtime::{ProcessIo, ProcessSpec, RuntimeClient, SandboxSpec};

/// Runs scratch containers against the runtime to prove it still works.
pub struct RuntimeHealthChecker {
    runtime: Arc<dyn RuntimeClient>,
    owner_name: String,
    process: HealthcheckProcess,
    timeout: Duration,
    healthy: AtomicBool,
}

impl RuntimeHealthChecker {
    pub fn new(
        runtime: Arc<dyn RuntimeClient>,
        owner_name: impl Into<String>,
        process: HealthcheckProcess,
        timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            owner_name: owner_name.into(),
            process,
            timeout,
            healthy: AtomicBool::new(true),
        }
    }

    /// Whether a check is configured at all.
    pub fn enabled(&self) -> bool {
        !self.process.path.is_empty()
    }

    /// The most recent verdict. Healthy until a check says otherwise.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// One full create-run-destroy cycle.
    pub async fn check_once(&self) -> Result<(), RuntimeError> {
        let handle = format!("check-{}", uuid::Uuid::new_v4());
        debug!(handle, "running runtime self-check");

        let spec = SandboxSpec {
            handle: handle.clone(),
            properties: HashMap::from([(
                CONTAINER_OWNER_PROPERTY.to_string(),
                self.owner_name.clone(),
            )]),
            ..SandboxSpec::default()
        };

        let sandbox = self.runtime.create(spec).await?;

        let outcome = async {
            let mut process = sandbox
                .run(
                    ProcessSpec {
                        path: self.process.path.clone(),
                        args: self.process.args.clone(),
                        env: self.process.env.clone(),
                        dir: self.process.dir.clone(),
                        ..ProcessSpec::default()
                    },
                    ProcessIo::default(),
                )
                .await?;

            match process.wait().await? {
                0 => Ok(()),
                status => Err(RuntimeError::operation(
                    "self-check",
                    &handle,
                    format!("check process exited with status {status}"),
                )),
            }
        };

        let result = match tokio::time::timeout(self.timeout, outcome).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::operation(
                "self-check",
                &handle,
                "check timed out",
            )),
        };

        if let Err(err) = self.runtime.destroy(&handle).await {
            if !matches!(err, RuntimeError::ContainerNotFound(_)) {
                warn!(handle, "failed to destroy self-check container: {err}");
            }
        }

        result
    }

    /// Long-running checker loop updating the exposed verdict.
    pub fn spawn(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        if !self.enabled() {
            return None;
        }

        let checker = Arc::clone(self);
        Some(tokio::spawn(async move {
            debug!("runtime health checker started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let healthy = match checker.check_once().await {
                            Ok(()) => true,
                            Err(err) => {
                                warn!("runtime self-check failed: {err}");
                                false
                            }
                        };
                        if healthy != checker.healthy.swap(healthy, Ordering::SeqCst) {
                            info!(healthy, "runtime health changed");
                        }
                    }
                    _ = shutdown.cancelled() => {
                        debug!("runtime health checker stopping");
                        return;
                    }
                }
            }
        }))
    }
}
