//! Process execution step.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::actions::{EnvVar, ProcessLimits};
use crate::constants::{
    ENV_INSTANCE_ADDR, ENV_INSTANCE_IP, ENV_INSTANCE_PORT, ENV_INSTANCE_PORTS, EXIT_TIMEOUT,
    TERMINATE_TIMEOUT,
};
use crate::container::PortMapping;
use crate::logstream::LogStreamer;
use crate::runtime::{ProcessIo, ProcessSignal, ProcessSpec, Sandbox, SandboxProcess};
use crate::steps::{Step, StepError, StepResult};

const OOM_EVENT: &str = "out of memory";

/// Network facts injected into the process environment when export is
/// enabled.
pub struct NetworkEnv {
    pub external_ip: String,
    pub ports: Vec<PortMapping>,
}

/// Runs one process inside the sandbox, streaming its output through the
/// container log streamer.
pub struct RunStep {
    sandbox: Arc<dyn Sandbox>,
    path: String,
    args: Vec<String>,
    env: Vec<EnvVar>,
    dir: Option<String>,
    limits: ProcessLimits,
    privileged: bool,
    streamer: LogStreamer,
    network_env: Option<NetworkEnv>,
    allow_privileged: bool,
    terminate_timeout: Duration,
    exit_timeout: Duration,
    token: CancellationToken,
}

#[allow(clippy::too_many_arguments)]
impl RunStep {
    pub fn new(
        sandbox: Arc<dyn Sandbox>,
        path: String,
        args: Vec<String>,
        env: Vec<EnvVar>,
        dir: Option<String>,
        limits: ProcessLimits,
        privileged: bool,
        streamer: LogStreamer,
        network_env: Option<NetworkEnv>,
        allow_privileged: bool,
        token: CancellationToken,
    ) -> Self {
        Self {
            sandbox,
            path,
            args,
            env,
            dir,
            limits,
            privileged,
            streamer,
            network_env,
            allow_privileged,
            terminate_timeout: TERMINATE_TIMEOUT,
            exit_timeout: EXIT_TIMEOUT,
            token,
        }
    }

    /// Shrinks the teardown ladder. Test hook.
    pub fn with_teardown_timeouts(mut self, terminate: Duration, exit: Duration) -> Self {
        self.terminate_timeout = terminate;
        self.exit_timeout = exit;
        self
    }

    fn process_env(&self) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = Vec::new();

        if let Some(network) = &self.network_env {
            // host:container pairs, comma-joined; all three port
            // variables are empty strings when no mappings exist.
            let ports = network
                .ports
                .iter()
                .map(|p| format!("{}:{}", p.host_port, p.container_port))
                .collect::<Vec<_>>()
                .join(",");
            let (port, addr) = match network.ports.first() {
                Some(first) => (
                    first.host_port.to_string(),
                    format!("{}:{}", network.external_ip, first.host_port),
                ),
                None => (String::new(), String::new()),
            };

            env.push((ENV_INSTANCE_IP.to_string(), network.external_ip.clone()));
            env.push((ENV_INSTANCE_PORT.to_string(), port));
            env.push((ENV_INSTANCE_ADDR.to_string(), addr));
            env.push((ENV_INSTANCE_PORTS.to_string(), ports));
        }

        env.extend(self.env.iter().map(|e| (e.name.clone(), e.value.clone())));
        env
    }

    async fn exit_message(&self, status: i32) -> String {
        let mut message = format!("Exited with status {status}");

        if let Ok(info) = self.sandbox.info().await {
            if info.events.iter().any(|e| e == OOM_EVENT) {
                message.push_str(" (out of memory)");
            }
        }

        message
    }

    /// Terminate, then kill, then give up. Returns the exit status if
    /// the process died in time.
    async fn tear_down(&self, process: &mut Box<dyn SandboxProcess>) -> Option<i32> {
        debug!(handle = %self.sandbox.handle(), "sending terminate to cancelled process");
        let _ = process.signal(ProcessSignal::Terminate).await;

        let killed_deadline = self.exit_timeout.saturating_sub(self.terminate_timeout);

        match tokio::time::timeout(self.terminate_timeout, process.wait()).await {
            Ok(_) => return None,
            Err(_) => {
                debug!(handle = %self.sandbox.handle(), "process survived terminate, killing");
                let _ = process.signal(ProcessSignal::Kill).await;
            }
        }

        match tokio::time::timeout(killed_deadline, process.wait()).await {
            Ok(_) => None,
            Err(_) => Some(-1),
        }
    }
}

#[async_trait]
impl Step for RunStep {
    fn cancel_token(&self) -> &CancellationToken {
        &self.token
    }

    async fn perform(&mut self) -> StepResult {
        if self.privileged && !self.allow_privileged {
            return Err(StepError::PrivilegedNotAllowed);
        }

        if self.token.is_cancelled() {
            return Err(StepError::Cancelled);
        }

        info!(handle = %self.sandbox.handle(), path = %self.path, "running process");

        let spec = ProcessSpec {
            path: self.path.clone(),
            args: self.args.clone(),
            env: self.process_env(),
            dir: self.dir.clone(),
            nofile: self.limits.nofile,
            privileged: self.privileged,
        };

        let io = ProcessIo {
            stdout: Some(Box::new(self.streamer.stdout_writer())),
            stderr: Some(Box::new(self.streamer.stderr_writer())),
        };

        let mut process = self.sandbox.run(spec, io).await?;

        let status = tokio::select! {
            status = process.wait() => status?,
            _ = self.token.cancelled() => {
                match self.tear_down(&mut process).await {
                    None => return Err(StepError::Cancelled),
                    Some(_) => {
                        return Err(StepError::ExitTimeout {
                            timeout: self.exit_timeout,
                        })
                    }
                }
            }
        };

        self.streamer.stdout(format!("Exit status {status}"));

        if status == 0 {
            info!(handle = %self.sandbox.handle(), "process exited cleanly");
            return Ok(());
        }

        let message = self.exit_message(status).await;
        info!(handle = %self.sandbox.handle(), %status, "process failed");
        Err(StepError::emittable(message, None))
    }
}
