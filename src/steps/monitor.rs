//! Periodic health monitor step.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::InvalidIntervalError;
use crate::logstream::LogStreamer;
use crate::steps::{format_duration, BoxedStep, Step, StepError, StepResult};

/// Builds a fresh check step for each probe. Checks are single-use; the
/// monitor never re-performs one.
pub type CheckFactory = Box<dyn Fn() -> BoxedStep + Send + Sync>;

/// Interval-driven monitor retained for plain (non readiness/liveness)
/// monitor actions.
///
/// Probes on `unhealthy_interval` until the first success, then sends
/// the started-running token and slows to `healthy_interval`. A failure
/// after the healthy transition ends the step with the check's error;
/// never reaching healthy within `start_timeout` ends it with the last
/// check error after writing a timeout notice to the log stream.
pub struct MonitorStep {
    check_factory: CheckFactory,
    has_started_running: mpsc::Sender<()>,
    streamer: LogStreamer,
    start_timeout: Option<Duration>,
    healthy_interval: Duration,
    unhealthy_interval: Duration,
    token: CancellationToken,
}

impl MonitorStep {
    pub fn new(
        check_factory: CheckFactory,
        has_started_running: mpsc::Sender<()>,
        streamer: LogStreamer,
        start_timeout: Option<Duration>,
        healthy_interval: Duration,
        unhealthy_interval: Duration,
        token: CancellationToken,
    ) -> Self {
        Self {
            check_factory,
            has_started_running,
            streamer,
            start_timeout,
            healthy_interval,
            unhealthy_interval,
            token,
        }
    }

    /// Runs one freshly built check to completion, honoring cancellation.
    async fn run_check(&self) -> StepResult {
        let mut check = (self.check_factory)();
        let check_cancel = check.cancel_token().clone();

        let mut task = tokio::spawn(async move { check.perform().await });

        tokio::select! {
            joined = &mut task => {
                joined.unwrap_or_else(|err| {
                    Err(StepError::Io(std::io::Error::other(err.to_string())))
                })
            }
            _ = self.token.cancelled() => {
                check_cancel.cancel();
                task.await.unwrap_or(Err(StepError::Cancelled))
            }
        }
    }
}

#[async_trait]
impl Step for MonitorStep {
    fn cancel_token(&self) -> &CancellationToken {
        &self.token
    }

    async fn perform(&mut self) -> StepResult {
        if self.healthy_interval.is_zero() {
            return Err(InvalidIntervalError {
                field: "healthy",
                interval: self.healthy_interval,
            }
            .into());
        }

        if self.unhealthy_interval.is_zero() {
            return Err(InvalidIntervalError {
                field: "unhealthy",
                interval: self.unhealthy_interval,
            }
            .into());
        }

        let mut healthy = false;
        let mut interval = self.unhealthy_interval;
        let mut start_by = self.start_timeout.map(|t| Instant::now() + t);

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.token.cancelled() => return Err(StepError::Cancelled),
            }

            let result = self.run_check().await;
            if self.token.is_cancelled() {
                return result;
            }

            let now_healthy = result.is_ok();

            if healthy && !now_healthy {
                info!("monitored container transitioned to unhealthy");
                return result;
            }

            if !healthy && now_healthy {
                info!("monitored container transitioned to healthy");
                healthy = true;
                let _ = self.has_started_running.try_send(());
                interval = self.healthy_interval;
                start_by = None;
            }

            if let Some(deadline) = start_by {
                if Instant::now() >= deadline {
                    if !healthy {
                        let timeout = self.start_timeout.unwrap_or_default();
                        self.streamer.stderr(format!(
                            "Timed out after {}: health check never passed.",
                            format_duration(timeout)
                        ));
                        info!("monitored container timed out before becoming healthy");
                        return result;
                    }
                    start_by = None;
                }
            }
        }
    }
}
