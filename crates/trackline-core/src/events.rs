//! Pipeline event system.
//!
//! Observers (logging, status displays, tests) subscribe to a broadcast of
//! [`PipelineEvent`]s describing what happened to each sample and each drain.

use serde::Serialize;
use tokio::sync::broadcast;

use trackline_types::{ConnectivityState, EntryId, Sample};

use crate::router::QueueReason;
use crate::sync::DrainOutcome;

/// Events emitted by the router, the sync engine and the monitor.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum PipelineEvent {
    /// A freshly captured sample went out on the fast path.
    SampleDelivered { sample: Sample },
    /// A freshly captured sample was written to the durable queue.
    SampleQueued {
        id: EntryId,
        sample: Sample,
        reason: QueueReason,
    },
    /// A queued entry was delivered and removed by a drain.
    EntryDelivered { id: EntryId },
    /// A queued entry was moved to the dead-letter table.
    EntryQuarantined { id: EntryId, reason: String },
    /// A drain pass ended.
    DrainFinished { outcome: DrainOutcome },
    /// The positioning source reported a failure.
    CaptureFailed { error: String },
    /// Connectivity changed.
    ConnectivityChanged { state: ConnectivityState },
}

/// Sender for pipeline events.
pub type EventSender = broadcast::Sender<PipelineEvent>;

/// Receiver for pipeline events.
pub type EventReceiver = broadcast::Receiver<PipelineEvent>;

/// Event dispatcher for sending events to multiple receivers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    /// Create a new event dispatcher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: PipelineEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(256)
    }
}
