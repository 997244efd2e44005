//! Two-phase readiness/liveness monitor step.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::logstream::LogStreamer;
use crate::steps::{format_duration, BoxedStep, Step, StepError, StepResult};
use crate::workpool::WorkPool;

/// Builds a fresh check step against the given streamer. Checks run
/// against a buffer streamer so their output only surfaces on failure.
pub type StreamingCheckFactory = Box<dyn Fn(LogStreamer) -> BoxedStep + Send + Sync>;

const HEALTH_SOURCE: &str = "HEALTH";

/// The monitor gating a container's `Running` transition.
///
/// Phase one submits readiness checks to the shared health-check work
/// pool until one succeeds, honoring `start_timeout`. On success it
/// announces health on the log stream and sends one token on the
/// started-running channel. Phase two probes liveness until a check
/// fails, which ends the step, and with it the container, carrying an
/// emittable error.
pub struct LongRunningMonitorStep {
    readiness_factory: StreamingCheckFactory,
    liveness_factory: Option<StreamingCheckFactory>,
    has_started_running: mpsc::Sender<()>,
    streamer: LogStreamer,
    health_streamer: LogStreamer,
    start_timeout: Option<Duration>,
    readiness_retry_interval: Duration,
    liveness_interval: Duration,
    work_pool: WorkPool,
    token: CancellationToken,
}

enum CheckOutcome {
    Done(StepResult),
    TimedOut(Option<StepError>),
    Cancelled,
}

#[allow(clippy::too_many_arguments)]
impl LongRunningMonitorStep {
    pub fn new(
        readiness_factory: StreamingCheckFactory,
        liveness_factory: Option<StreamingCheckFactory>,
        has_started_running: mpsc::Sender<()>,
        streamer: LogStreamer,
        start_timeout: Option<Duration>,
        readiness_retry_interval: Duration,
        liveness_interval: Duration,
        work_pool: WorkPool,
        token: CancellationToken,
    ) -> Self {
        let health_streamer = streamer.with_source(HEALTH_SOURCE);
        Self {
            readiness_factory,
            liveness_factory,
            has_started_running,
            streamer,
            health_streamer,
            start_timeout,
            readiness_retry_interval,
            liveness_interval,
            work_pool,
            token,
        }
    }

    /// Submits one check to the pool and waits for it, the optional
    /// deadline, or cancellation, whichever comes first. On deadline or
    /// cancellation the running check is cancelled and drained.
    async fn submit_check(
        &self,
        check: BoxedStep,
        deadline: Option<tokio::time::Instant>,
    ) -> CheckOutcome {
        let mut check = check;
        let check_cancel = check.cancel_token().clone();
        let (tx, mut rx) = oneshot::channel();

        self.work_pool.submit(async move {
            let _ = tx.send(check.perform().await);
        });

        let timer = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(timer);

        // Biased order: an external cancel beats a finished check, and a
        // finished check beats the deadline.
        tokio::select! {
            biased;

            _ = self.token.cancelled() => {
                check_cancel.cancel();
                let _ = rx.await;
                CheckOutcome::Cancelled
            }
            result = &mut rx => {
                CheckOutcome::Done(result.unwrap_or(Err(StepError::Cancelled)))
            }
            _ = &mut timer => {
                check_cancel.cancel();
                let last = rx.await.unwrap_or(Err(StepError::Cancelled));
                CheckOutcome::TimedOut(last.err())
            }
        }
    }

    fn flush_check_output(&self, buffer: &Arc<Mutex<String>>) {
        let output = {
            let mut buffer = buffer.lock().expect("health buffer lock poisoned");
            std::mem::take(&mut *buffer)
        };
        if !output.is_empty() {
            self.health_streamer.stderr(output);
        }
    }

    /// Readiness phase: probe until success, deadline, or cancellation.
    async fn await_healthy(&self, buffer: &Arc<Mutex<String>>) -> StepResult {
        let buffer_streamer = LogStreamer::buffered(Arc::clone(buffer));
        let deadline = self.start_timeout.map(|t| tokio::time::Instant::now() + t);

        loop {
            let check = (self.readiness_factory)(buffer_streamer.clone());

            match self.submit_check(check, deadline).await {
                CheckOutcome::Done(Ok(())) => return Ok(()),
                CheckOutcome::Done(Err(_)) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.readiness_retry_interval) => {}
                        _ = self.token.cancelled() => return Err(StepError::Cancelled),
                    }
                }
                CheckOutcome::TimedOut(last_err) => {
                    let timeout = self.start_timeout.unwrap_or_default();
                    self.flush_check_output(buffer);
                    self.streamer.stdout(format!(
                        "Timed out after {}: health check never passed.",
                        format_duration(timeout)
                    ));
                    info!("container timed out before becoming healthy");
                    return Err(StepError::emittable("Instance never healthy", last_err));
                }
                CheckOutcome::Cancelled => return Err(StepError::Cancelled),
            }
        }
    }

    /// Liveness phase: probe until a check fails or we are cancelled.
    async fn await_unhealthy(&self, buffer: &Arc<Mutex<String>>) -> StepResult {
        let Some(liveness_factory) = &self.liveness_factory else {
            // Nothing can fail this container; park until cancelled.
            self.token.cancelled().await;
            return Err(StepError::Cancelled);
        };

        let buffer_streamer = LogStreamer::buffered(Arc::clone(buffer));

        loop {
            let check = (liveness_factory)(buffer_streamer.clone());

            match self.submit_check(check, None).await {
                CheckOutcome::Done(Ok(())) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.liveness_interval) => {}
                        _ = self.token.cancelled() => return Err(StepError::Cancelled),
                    }
                }
                CheckOutcome::Done(Err(err)) => {
                    info!("container transitioned to unhealthy");
                    self.streamer.stdout("Container became unhealthy");
                    self.flush_check_output(buffer);
                    return Err(StepError::emittable("Instance became unhealthy", Some(err)));
                }
                CheckOutcome::TimedOut(_) => unreachable!("liveness checks have no deadline"),
                CheckOutcome::Cancelled => return Err(StepError::Cancelled),
            }
        }
    }
}

#[async_trait]
impl Step for LongRunningMonitorStep {
    fn cancel_token(&self) -> &CancellationToken {
        &self.token
    }

    async fn perform(&mut self) -> StepResult {
        self.streamer
            .stdout("Starting health monitoring of container");

        let buffer = Arc::new(Mutex::new(String::new()));

        self.await_healthy(&buffer).await?;

        info!("container transitioned to healthy");
        self.streamer.stdout("Container became healthy");
        let _ = self.has_started_running.try_send(());

        self.await_unhealthy(&buffer).await
    }
}
