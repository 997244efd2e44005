//! Action-to-step transformation.
//!
//! The transformer is the only place that knows how to turn a
//! declarative [`Action`] tree into an executable [`Step`] tree bound to
//! a sandbox and log streamer. It owns the process-wide sharing: the
//! download rate limiter, the upload semaphore, and the health-check
//! work pool all live here and are threaded into every step that needs
//! them.
//!
//! Tokens are hierarchical: every child step's token derives from its
//! parent's, so cancelling any node reaches its whole subtree.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::actions::Action;
use crate::container::Container;
use crate::downloader::ArtifactDownloader;
use crate::logstream::LogStreamer;
use crate::runtime::Sandbox;
use crate::steps::{
    BoxedStep, CodependentStep, DownloadStep, EmitProgressStep, LongRunningMonitorStep,
    MonitorStep, NetworkEnv, ParallelStep, RunStep, SerialStep, TimeoutStep, TryStep, UploadStep,
};
use crate::uploader::Uploader;
use crate::workpool::WorkPool;

/// Converts action trees into step trees.
#[derive(Clone)]
pub struct Transformer {
    downloader: Arc<dyn ArtifactDownloader>,
    uploader: Arc<dyn Uploader>,
    download_limiter: Arc<Semaphore>,
    upload_limiter: Arc<Semaphore>,
    healthcheck_pool: WorkPool,
    temp_dir: PathBuf,
    export_network_env_vars: bool,
    allow_privileged: bool,
    healthy_interval: Duration,
    unhealthy_interval: Duration,
}

#[allow(clippy::too_many_arguments)]
impl Transformer {
    pub fn new(
        downloader: Arc<dyn ArtifactDownloader>,
        uploader: Arc<dyn Uploader>,
        max_concurrent_downloads: usize,
        max_concurrent_uploads: usize,
        healthcheck_pool: WorkPool,
        temp_dir: PathBuf,
        export_network_env_vars: bool,
        allow_privileged: bool,
        healthy_interval: Duration,
        unhealthy_interval: Duration,
    ) -> Self {
        Self {
            downloader,
            uploader,
            download_limiter: Arc::new(Semaphore::new(max_concurrent_downloads)),
            upload_limiter: Arc::new(Semaphore::new(max_concurrent_uploads)),
            healthcheck_pool,
            temp_dir,
            export_network_env_vars,
            allow_privileged,
            healthy_interval,
            unhealthy_interval,
        }
    }

    /// Builds the complete step tree for one container run:
    /// `Serial{setup, Codependent{action, monitor}}`, trimmed of the
    /// parts the container does not configure. Without a monitor the
    /// started-running token is sent immediately: an unmonitored
    /// container counts as running the moment its tree starts.
    pub fn steps_for_run(
        &self,
        container: &Container,
        sandbox: Arc<dyn Sandbox>,
        streamer: &LogStreamer,
        has_started_running: mpsc::Sender<()>,
    ) -> (BoxedStep, CancellationToken) {
        let root_token = CancellationToken::new();

        let long_lived: BoxedStep = match &container.monitor {
            Some(monitor_action) => {
                // The action and monitor must be children of the
                // codependent's own token, so its first-exit cancel
                // reaches both of them.
                let codependent_token = root_token.child_token();
                let action_step = self.step_for(
                    streamer,
                    &container.action,
                    Arc::clone(&sandbox),
                    container,
                    codependent_token.child_token(),
                );
                let monitor_step = self.monitor_step_for(
                    monitor_action,
                    container,
                    Arc::clone(&sandbox),
                    streamer,
                    has_started_running,
                    codependent_token.child_token(),
                );
                Box::new(CodependentStep::new(
                    vec![action_step, monitor_step],
                    codependent_token,
                ))
            }
            None => {
                let _ = has_started_running.try_send(());
                self.step_for(
                    streamer,
                    &container.action,
                    Arc::clone(&sandbox),
                    container,
                    root_token.child_token(),
                )
            }
        };

        let root: BoxedStep = match &container.setup {
            Some(setup) => {
                let setup_step = self.step_for(
                    streamer,
                    setup,
                    sandbox,
                    container,
                    root_token.child_token(),
                );
                Box::new(SerialStep::new(
                    vec![setup_step, long_lived],
                    root_token.clone(),
                ))
            }
            None => long_lived,
        };

        (root, root_token)
    }

    /// Builds the step for one action node, recursing over children.
    pub fn step_for(
        &self,
        streamer: &LogStreamer,
        action: &Action,
        sandbox: Arc<dyn Sandbox>,
        container: &Container,
        token: CancellationToken,
    ) -> BoxedStep {
        match action {
            Action::Run {
                path,
                args,
                env,
                dir,
                resource_limits,
                privileged,
                log_source,
            } => {
                let streamer = match log_source {
                    Some(source) => streamer.with_source(source.clone()),
                    None => streamer.clone(),
                };

                let network_env = self.export_network_env_vars.then(|| NetworkEnv {
                    external_ip: container.external_ip.clone(),
                    ports: container.ports.clone(),
                });

                Box::new(RunStep::new(
                    sandbox,
                    path.clone(),
                    args.clone(),
                    env.clone(),
                    dir.clone(),
                    resource_limits.clone(),
                    *privileged,
                    streamer,
                    network_env,
                    self.allow_privileged,
                    token,
                ))
            }

            Action::Download {
                from_url,
                to_path,
                cache_key,
                checksum,
                artifact_name,
            } => Box::new(DownloadStep::new(
                sandbox,
                from_url.clone(),
                to_path.clone(),
                cache_key.clone(),
                checksum.clone(),
                artifact_name.clone(),
                Arc::clone(&self.downloader),
                Arc::clone(&self.download_limiter),
                streamer.clone(),
                token,
            )),

            Action::Upload {
                from_path,
                to_url,
                artifact_name,
            } => Box::new(UploadStep::new(
                sandbox,
                from_path.clone(),
                to_url.clone(),
                artifact_name.clone(),
                Arc::clone(&self.uploader),
                Arc::clone(&self.upload_limiter),
                self.temp_dir.clone(),
                streamer.clone(),
                token,
            )),

            Action::EmitProgress {
                start_msg,
                success_msg,
                failure_msg,
                inner,
            } => {
                let inner = self.step_for(streamer, inner, sandbox, container, token);
                Box::new(EmitProgressStep::new(
                    inner,
                    start_msg.clone(),
                    success_msg.clone(),
                    failure_msg.clone(),
                    streamer.clone(),
                ))
            }

            Action::Try { inner } => {
                let inner = self.step_for(streamer, inner, sandbox, container, token);
                Box::new(TryStep::new(inner))
            }

            Action::Timeout { deadline, inner } => {
                let inner = self.step_for(streamer, inner, sandbox, container, token);
                Box::new(TimeoutStep::new(inner, *deadline))
            }

            Action::Parallel { children } => {
                let children = self.steps_for_children(streamer, children, &sandbox, container, &token);
                Box::new(ParallelStep::new(children, token))
            }

            Action::Serial { children } => {
                let children = self.steps_for_children(streamer, children, &sandbox, container, &token);
                Box::new(SerialStep::new(children, token))
            }

            Action::Codependent { children } => {
                let children = self.steps_for_children(streamer, children, &sandbox, container, &token);
                Box::new(CodependentStep::new(children, token))
            }

            // A monitor nested in an ordinary action position gates
            // nothing; its started-running token goes nowhere.
            Action::Monitor { .. } => {
                let (tx, _rx) = mpsc::channel(1);
                self.monitor_step_for(action, container, sandbox, streamer, tx, token)
            }
        }
    }

    fn steps_for_children(
        &self,
        streamer: &LogStreamer,
        children: &[Action],
        sandbox: &Arc<dyn Sandbox>,
        container: &Container,
        parent: &CancellationToken,
    ) -> Vec<BoxedStep> {
        children
            .iter()
            .map(|child| {
                self.step_for(
                    streamer,
                    child,
                    Arc::clone(sandbox),
                    container,
                    parent.child_token(),
                )
            })
            .collect()
    }

    /// Builds the monitor step for a container. A `Monitor` action
    /// becomes the two-phase readiness/liveness monitor; any other
    /// action becomes a periodic monitor probing that action.
    fn monitor_step_for(
        &self,
        monitor_action: &Action,
        container: &Container,
        sandbox: Arc<dyn Sandbox>,
        streamer: &LogStreamer,
        has_started_running: mpsc::Sender<()>,
        token: CancellationToken,
    ) -> BoxedStep {
        match monitor_action {
            Action::Monitor {
                readiness,
                liveness,
                start_timeout_secs,
            } => {
                let start_timeout = match *start_timeout_secs {
                    0 => container.start_timeout(),
                    secs => Some(Duration::from_secs(secs)),
                };

                let readiness_factory =
                    self.check_factory(readiness.as_ref().clone(), container, Arc::clone(&sandbox));
                let liveness_factory = liveness.as_ref().map(|liveness| {
                    self.check_factory(liveness.as_ref().clone(), container, Arc::clone(&sandbox))
                });

                Box::new(LongRunningMonitorStep::new(
                    readiness_factory,
                    liveness_factory,
                    has_started_running,
                    streamer.clone(),
                    start_timeout,
                    self.unhealthy_interval,
                    self.healthy_interval,
                    self.healthcheck_pool.clone(),
                    token,
                ))
            }

            other => {
                let factory = self.check_factory(other.clone(), container, sandbox);
                let check_streamer = streamer.clone();
                Box::new(MonitorStep::new(
                    Box::new(move || factory(check_streamer.clone())),
                    has_started_running,
                    streamer.clone(),
                    container.start_timeout(),
                    self.healthy_interval,
                    self.unhealthy_interval,
                    token,
                ))
            }
        }
    }

    /// A factory producing a fresh single-use check step per invocation.
    fn check_factory(
        &self,
        action: Action,
        container: &Container,
        sandbox: Arc<dyn Sandbox>,
    ) -> Box<dyn Fn(LogStreamer) -> BoxedStep + Send + Sync> {
        let transformer = self.clone();
        let container = container.clone();

        Box::new(move |streamer: LogStreamer| {
            transformer.step_for(
                &streamer,
                &action,
                Arc::clone(&sandbox),
                &container,
                CancellationToken::new(),
            )
        })
    }
}
