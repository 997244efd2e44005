//! Lifecycle event hub.
//!
//! A single-writer/multi-reader broadcast of container lifecycle events.
//! Each subscriber owns a small bounded buffer; emission to a full buffer
//! drops the event for that subscriber and never blocks the emitter.
//! Subscriptions start at the moment of `subscribe`; there is no
//! backfill.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::constants::EVENT_SUBSCRIBER_BUFFER;
use crate::container::{Container, RunResult};

/// A container lifecycle event. Emitted once per transition, carrying a
/// snapshot of the container at that transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ContainerEvent {
    /// Capacity was claimed and the container entered `Reserved`.
    Reserved { container: Container },
    /// Provisioning failed between `Initializing` and `Created`.
    InitializeFailed { container: Container, reason: String },
    /// A runtime sandbox now exists for the container.
    Created { container: Container },
    /// The readiness gate passed; the main action is considered up.
    Running { container: Container },
    /// Terminal transition with the run outcome.
    Complete {
        container: Container,
        result: RunResult,
    },
}

impl ContainerEvent {
    /// The guid of the container this event concerns.
    pub fn guid(&self) -> &str {
        match self {
            Self::Reserved { container }
            | Self::InitializeFailed { container, .. }
            | Self::Created { container }
            | Self::Running { container }
            | Self::Complete { container, .. } => &container.guid,
        }
    }
}

/// Subscribable stream of lifecycle events.
pub struct EventHub {
    subscribers: Mutex<Option<Vec<mpsc::Sender<ContainerEvent>>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Some(Vec::new())),
        }
    }

    /// Registers a new subscriber and returns its receiving end.
    ///
    /// Returns `None` once the hub has been closed.
    pub fn subscribe(&self) -> Option<mpsc::Receiver<ContainerEvent>> {
        let mut subscribers = self.subscribers.lock().expect("event hub lock poisoned");
        let subscribers = subscribers.as_mut()?;

        let (tx, rx) = mpsc::channel(EVENT_SUBSCRIBER_BUFFER);
        subscribers.push(tx);
        Some(rx)
    }

    /// Delivers `event` to all live subscribers in subscription order.
    ///
    /// Subscribers whose buffers are full miss this event; subscribers
    /// that have gone away are forgotten.
    pub fn emit(&self, event: ContainerEvent) {
        let mut subscribers = self.subscribers.lock().expect("event hub lock poisoned");
        let Some(subscribers) = subscribers.as_mut() else {
            return;
        };

        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("event subscriber buffer full, dropping event for it");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Terminates all subscriptions. Further `emit` calls are no-ops and
    /// further `subscribe` calls return `None`.
    pub fn close(&self) {
        let mut subscribers = self.subscribers.lock().expect("event hub lock poisoned");
        *subscribers = None;
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
