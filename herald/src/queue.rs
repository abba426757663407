use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};

use crate::error::QueueError;
use crate::shutdown::ShutdownToken;

/// Buffer sizing for a [`MessageQueue`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueCapacity {
    /// Grows as needed.
    #[default]
    Unbounded,
    /// Rejects items beyond the given count instead of blocking the producer.
    Bounded(usize),
}

enum QueueSender<T> {
    Unbounded(mpsc::UnboundedSender<T>),
    Bounded(mpsc::Sender<T>),
}

enum QueueReceiver<T> {
    Unbounded(mpsc::UnboundedReceiver<T>),
    Bounded(mpsc::Receiver<T>),
}

impl<T> QueueReceiver<T> {
    async fn recv(&mut self) -> Option<T> {
        match self {
            QueueReceiver::Unbounded(rx) => rx.recv().await,
            QueueReceiver::Bounded(rx) => rx.recv().await,
        }
    }

    fn try_recv(&mut self) -> Option<T> {
        match self {
            QueueReceiver::Unbounded(rx) => rx.try_recv().ok(),
            QueueReceiver::Bounded(rx) => rx.try_recv().ok(),
        }
    }
}

/// In-memory FIFO buffer for one category of items.
///
/// Producers never wait: [`enqueue`](Self::enqueue) either accepts the item
/// or reports why it could not. Consumers read through
/// [`dequeue_all`](Self::dequeue_all), which ends cleanly when the queue is
/// closed and drained or when the shutdown signal fires. Dequeue order always
/// matches enqueue order on a single queue.
pub struct MessageQueue<T> {
    name: String,
    capacity: QueueCapacity,
    sender: RwLock<Option<QueueSender<T>>>,
    receiver: Mutex<QueueReceiver<T>>,
    depth: AtomicUsize,
}

impl<T: Send + 'static> MessageQueue<T> {
    pub fn new(name: impl Into<String>, capacity: QueueCapacity) -> Self {
        let (sender, receiver) = match capacity {
            QueueCapacity::Unbounded => {
                let (tx, rx) = mpsc::unbounded_channel();
                (QueueSender::Unbounded(tx), QueueReceiver::Unbounded(rx))
            }
            QueueCapacity::Bounded(limit) => {
                let (tx, rx) = mpsc::channel(limit.max(1));
                (QueueSender::Bounded(tx), QueueReceiver::Bounded(rx))
            }
        };

        Self {
            name: name.into(),
            capacity,
            sender: RwLock::new(Some(sender)),
            receiver: Mutex::new(receiver),
            depth: AtomicUsize::new(0),
        }
    }

    pub fn unbounded(name: impl Into<String>) -> Self {
        Self::new(name, QueueCapacity::Unbounded)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> QueueCapacity {
        self.capacity
    }

    /// Append an item without waiting.
    pub fn enqueue(&self, item: T) -> Result<(), QueueError> {
        let guard = self.sender.read();
        let sender = guard.as_ref().ok_or(QueueError::Closed)?;
        let limit = match self.capacity {
            QueueCapacity::Bounded(limit) => limit.max(1),
            QueueCapacity::Unbounded => usize::MAX,
        };

        // Count before sending so a fast consumer never decrements below zero.
        self.depth.fetch_add(1, Ordering::SeqCst);
        let result = match sender {
            QueueSender::Unbounded(tx) => tx.send(item).map_err(|_| QueueError::Closed),
            QueueSender::Bounded(tx) => tx.try_send(item).map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => QueueError::Full { capacity: limit },
                mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
            }),
        };

        if result.is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
        result
    }

    /// Wait for the next item.
    ///
    /// Returns `None` once the queue is closed and drained, or when `shutdown`
    /// fires first. A read abandoned by cancellation never loses an item.
    pub async fn dequeue(&self, shutdown: &ShutdownToken) -> Option<T> {
        let item = shutdown
            .run_until_cancelled(async {
                let mut receiver = self.receiver.lock().await;
                receiver.recv().await
            })
            .await
            .flatten();

        if item.is_some() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
        item
    }

    /// Take the next item if one is already buffered.
    pub fn try_dequeue(&self) -> Option<T> {
        let mut receiver = self.receiver.try_lock().ok()?;
        let item = receiver.try_recv();
        if item.is_some() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
        item
    }

    /// Lazy sequence of items, ending on close+drain or cancellation.
    ///
    /// Each call produces a fresh stream over the same buffer; several
    /// consumers may read concurrently and each item is delivered once.
    pub fn dequeue_all(
        self: &Arc<Self>,
        shutdown: ShutdownToken,
    ) -> impl Stream<Item = T> + Send + 'static {
        stream::unfold(
            (Arc::clone(self), shutdown),
            |(queue, shutdown)| async move {
                let item = queue.dequeue(&shutdown).await?;
                Some((item, (queue, shutdown)))
            },
        )
    }

    /// Stop accepting items. Buffered items remain readable.
    pub fn close(&self) {
        let dropped = self.sender.write().take();
        if dropped.is_some() {
            tracing::debug!(queue = %self.name, depth = self.depth(), "queue closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.read().is_none()
    }

    /// Number of buffered items. Approximate while producers are active.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            name: self.name.clone(),
            sampled_at: Utc::now(),
            capacity: self.capacity,
            depth: self.depth(),
            closed: self.is_closed(),
        }
    }
}

/// Snapshot of queue state at a point in time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub name: String,
    /// Timestamp when the snapshot was taken.
    pub sampled_at: DateTime<Utc>,
    pub capacity: QueueCapacity,
    /// Number of items waiting to be dequeued.
    pub depth: usize,
    pub closed: bool,
}
