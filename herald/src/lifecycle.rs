use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::message::EnvelopeMeta;
use crate::worker::WorkerSummary;

/// Something that happened to a message or worker, stamped with when.
#[derive(Clone, Debug, Serialize)]
pub struct LifecycleEvent {
    pub occurred_at: DateTime<Utc>,
    pub payload: LifecyclePayload,
}

impl LifecycleEvent {
    pub fn new(payload: LifecyclePayload) -> Self {
        Self {
            occurred_at: Utc::now(),
            payload,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum LifecyclePayload {
    /// Accepted by a queue.
    Enqueued { meta: EnvelopeMeta },
    /// Dispatched and every handler succeeded.
    Dispatched { meta: EnvelopeMeta, duration_ms: u64 },
    /// Dispatched and at least one handler failed. `failures` is 1 for
    /// commands and requests, and the number of failed handlers for events.
    Failed { meta: EnvelopeMeta, failures: usize },
    /// No usable handler registration for the message kind.
    Misconfigured { meta: EnvelopeMeta, error: String },
    /// A worker loop exited.
    WorkerStopped { worker: String, summary: WorkerSummary },
}

/// In-process lifecycle feed over a tokio broadcast channel.
///
/// Publishing never waits: with no subscribers the event is dropped, and a
/// subscriber that falls behind sees `RecvError::Lagged` instead of holding
/// up the pipeline.
#[derive(Clone)]
pub struct LifecycleBus {
    sender: broadcast::Sender<LifecycleEvent>,
    capacity: usize,
}

impl std::fmt::Debug for LifecycleBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl LifecycleBus {
    /// `capacity` is the number of events buffered per subscriber.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn publish(&self, payload: LifecyclePayload) {
        let _ = self.sender.send(LifecycleEvent::new(payload));
    }

    /// Receive every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }
}

impl Default for LifecycleBus {
    fn default() -> Self {
        Self::new(256)
    }
}
