//! Monitor steps: readiness gating, liveness failure, start timeouts.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use stevedore::container::LogConfig;
use stevedore::logstream::LogStreamer;
use stevedore::steps::{
    BoxedStep, LongRunningMonitorStep, MonitorStep, Step, StepError, StepResult,
};
use stevedore::workpool::WorkPool;

use common::CapturingLogSink;

// =============================================================================
// Scripted Check
// =============================================================================

/// A single-use check whose verdict comes from a shared script: the
/// first `failures_before_success` invocations fail, the rest succeed.
struct ScriptedCheck {
    invocation: usize,
    failures_before_success: usize,
    streamer: Option<LogStreamer>,
    token: CancellationToken,
}

#[async_trait]
impl Step for ScriptedCheck {
    fn cancel_token(&self) -> &CancellationToken {
        &self.token
    }

    async fn perform(&mut self) -> StepResult {
        if self.token.is_cancelled() {
            return Err(StepError::Cancelled);
        }

        if self.invocation < self.failures_before_success {
            if let Some(streamer) = &self.streamer {
                streamer.stdout(format!("check {} failed", self.invocation));
            }
            Err(StepError::emittable("connection refused", None))
        } else {
            Ok(())
        }
    }
}

struct CheckScript {
    invocations: Arc<AtomicUsize>,
    failures_before_success: usize,
}

impl CheckScript {
    fn new(failures_before_success: usize) -> Self {
        Self {
            invocations: Arc::new(AtomicUsize::new(0)),
            failures_before_success,
        }
    }

    fn count(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    fn factory(&self) -> Box<dyn Fn(LogStreamer) -> BoxedStep + Send + Sync> {
        let invocations = Arc::clone(&self.invocations);
        let failures = self.failures_before_success;
        Box::new(move |streamer| {
            Box::new(ScriptedCheck {
                invocation: invocations.fetch_add(1, Ordering::SeqCst),
                failures_before_success: failures,
                streamer: Some(streamer),
                token: CancellationToken::new(),
            })
        })
    }

    fn plain_factory(&self) -> Box<dyn Fn() -> BoxedStep + Send + Sync> {
        let invocations = Arc::clone(&self.invocations);
        let failures = self.failures_before_success;
        Box::new(move || {
            Box::new(ScriptedCheck {
                invocation: invocations.fetch_add(1, Ordering::SeqCst),
                failures_before_success: failures,
                streamer: None,
                token: CancellationToken::new(),
            })
        })
    }
}

fn streamer() -> (LogStreamer, Arc<CapturingLogSink>) {
    let sink = CapturingLogSink::new();
    (
        LogStreamer::new(
            LogConfig {
                guid: "guid".to_string(),
                source_name: "TEST".to_string(),
                index: 0,
            },
            sink.clone(),
        ),
        sink,
    )
}

fn never_liveness() -> Box<dyn Fn(LogStreamer) -> BoxedStep + Send + Sync> {
    CheckScript::new(0).factory()
}

// =============================================================================
// Long-Running Monitor
// =============================================================================

#[tokio::test(start_paused = true)]
async fn readiness_success_sends_the_started_running_token() {
    let (streamer, sink) = streamer();
    let readiness = CheckScript::new(2);
    let (tx, mut rx) = mpsc::channel(1);

    let mut monitor = LongRunningMonitorStep::new(
        readiness.factory(),
        Some(never_liveness()),
        tx,
        streamer,
        Some(Duration::from_secs(60)),
        Duration::from_millis(10),
        Duration::from_millis(30),
        WorkPool::new(4).unwrap(),
        CancellationToken::new(),
    );

    let cancel = monitor.cancel_token().clone();
    let handle = tokio::spawn(async move { monitor.perform().await });

    // The third readiness check passes and produces exactly one token.
    rx.recv().await.expect("monitor should signal readiness");
    assert!(readiness.count() >= 3);

    cancel.cancel();
    let result = handle.await.unwrap();
    assert!(result.unwrap_err().is_cancelled());

    let messages = sink.messages();
    assert!(messages.iter().any(|m| m == "Container became healthy"));
}

#[tokio::test(start_paused = true)]
async fn readiness_timeout_reports_emittable_and_no_token() {
    let (streamer, sink) = streamer();
    let readiness = CheckScript::new(usize::MAX);
    let (tx, mut rx) = mpsc::channel(1);

    let mut monitor = LongRunningMonitorStep::new(
        readiness.factory(),
        Some(never_liveness()),
        tx,
        streamer,
        Some(Duration::from_millis(100)),
        Duration::from_millis(10),
        Duration::from_millis(30),
        WorkPool::new(4).unwrap(),
        CancellationToken::new(),
    );

    let err = monitor.perform().await.unwrap_err();

    assert_eq!(err.emittable_message(), Some("Instance never healthy"));
    assert!(
        rx.try_recv().is_err(),
        "no started-running token may be produced on timeout"
    );

    let messages = sink.messages();
    assert!(messages
        .iter()
        .any(|m| m.contains("health check never passed")));
    // The buffered check output surfaces on the HEALTH source.
    assert!(sink
        .lines
        .lock()
        .unwrap()
        .iter()
        .any(|l| l.source_name == "HEALTH"));
}

#[tokio::test(start_paused = true)]
async fn liveness_failure_ends_the_monitor_with_an_emittable() {
    let (streamer, sink) = streamer();
    let readiness = CheckScript::new(0);

    // Liveness: invocations 0 and 1 succeed, everything after fails.
    let liveness_invocations = Arc::new(AtomicUsize::new(0));
    let failing_after: Box<dyn Fn(LogStreamer) -> BoxedStep + Send + Sync> = {
        let invocations = Arc::clone(&liveness_invocations);
        Box::new(move |streamer: LogStreamer| {
            let invocation = invocations.fetch_add(1, Ordering::SeqCst);
            let healthy = invocation < 2;
            Box::new(ScriptedCheck {
                invocation: if healthy { 1 } else { 0 },
                failures_before_success: if healthy { 0 } else { 1 },
                streamer: Some(streamer),
                token: CancellationToken::new(),
            }) as BoxedStep
        })
    };

    let (tx, mut rx) = mpsc::channel(1);
    let mut monitor = LongRunningMonitorStep::new(
        readiness.factory(),
        Some(failing_after),
        tx,
        streamer,
        None,
        Duration::from_millis(10),
        Duration::from_millis(30),
        WorkPool::new(4).unwrap(),
        CancellationToken::new(),
    );

    let err = monitor.perform().await.unwrap_err();

    assert_eq!(err.emittable_message(), Some("Instance became unhealthy"));
    assert!(rx.try_recv().is_ok(), "readiness token was produced first");

    let messages = sink.messages();
    assert!(messages.iter().any(|m| m == "Container became healthy"));
    assert!(messages.iter().any(|m| m == "Container became unhealthy"));
}

// =============================================================================
// Periodic Monitor
// =============================================================================

#[tokio::test(start_paused = true)]
async fn periodic_monitor_signals_once_and_fails_on_relapse() {
    let (streamer, _sink) = streamer();
    // Succeed on invocations 1 and 2, fail from invocation 3 on.
    let invocations = Arc::new(AtomicUsize::new(0));
    let factory: Box<dyn Fn() -> BoxedStep + Send + Sync> = {
        let invocations = Arc::clone(&invocations);
        Box::new(move || {
            let invocation = invocations.fetch_add(1, Ordering::SeqCst);
            Box::new(ScriptedCheck {
                invocation: if (1..3).contains(&invocation) { 1 } else { 0 },
                failures_before_success: if (1..3).contains(&invocation) { 0 } else { 1 },
                streamer: None,
                token: CancellationToken::new(),
            }) as BoxedStep
        })
    };

    let (tx, mut rx) = mpsc::channel(1);
    let mut monitor = MonitorStep::new(
        factory,
        tx,
        streamer,
        None,
        Duration::from_millis(30),
        Duration::from_millis(10),
        CancellationToken::new(),
    );

    let result = monitor.perform().await;

    assert!(result.is_err(), "relapse ends the monitor with the failure");
    assert!(rx.try_recv().is_ok(), "one readiness token was produced");
    assert!(invocations.load(Ordering::SeqCst) >= 3);
}

#[tokio::test]
async fn periodic_monitor_rejects_non_positive_intervals() {
    let (streamer, _sink) = streamer();
    let script = CheckScript::new(0);
    let (tx, _rx) = mpsc::channel(1);

    let mut monitor = MonitorStep::new(
        script.plain_factory(),
        tx,
        streamer,
        None,
        Duration::ZERO,
        Duration::from_millis(10),
        CancellationToken::new(),
    );

    let err = monitor.perform().await.unwrap_err();
    assert!(matches!(err, StepError::InvalidInterval(_)));
}
