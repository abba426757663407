use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::BatchConfig;
use crate::error::{HandlerError, QueueError};
use crate::queue::MessageQueue;
use crate::reporting::{self, ErrorReport, ErrorReporter, ReportOrigin};
use crate::shutdown::ShutdownToken;

/// Destination for accumulated items, e.g. a bulk insert into an audit log.
#[async_trait]
pub trait BatchSink<T>: Send + Sync {
    async fn flush(&self, batch: Vec<T>) -> anyhow::Result<()>;
}

/// Totals reported when a flush loop exits.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BatchSummary {
    pub batches: u64,
    pub flushed: u64,
    /// Items in batches whose flush failed.
    pub dropped: u64,
}

/// Buffers items and hands them to a [`BatchSink`] in groups.
///
/// A batch is flushed when `batch_size` items are waiting or when
/// `flush_interval` elapses with anything waiting. A failed flush is logged
/// and reported, and its items are dropped; the loop carries on. On shutdown
/// whatever is still buffered is flushed once before the loop exits.
pub struct BatchBuffer<T> {
    config: BatchConfig,
    queue: Arc<MessageQueue<T>>,
}

impl<T: Send + 'static> BatchBuffer<T> {
    pub fn new(config: BatchConfig) -> Self {
        let queue = Arc::new(MessageQueue::new(config.name.clone(), config.capacity));
        Self { config, queue }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Add an item without waiting.
    pub fn push(&self, item: T) -> Result<(), QueueError> {
        self.queue.enqueue(item)
    }

    /// Items waiting for the next flush.
    pub fn depth(&self) -> usize {
        self.queue.depth()
    }

    /// Stop accepting items. The flush loop exits once it has flushed what
    /// is left.
    pub fn close(&self) {
        self.queue.close();
    }

    pub fn spawn(
        &self,
        sink: Arc<dyn BatchSink<T>>,
        reporter: Arc<dyn ErrorReporter>,
        shutdown: ShutdownToken,
    ) -> JoinHandle<BatchSummary> {
        let flusher = Flusher {
            name: self.config.name.clone(),
            sink,
            reporter,
        };
        tokio::spawn(run_flush_loop(
            self.config.clone(),
            Arc::clone(&self.queue),
            flusher,
            shutdown,
        ))
    }
}

struct Flusher<T> {
    name: String,
    sink: Arc<dyn BatchSink<T>>,
    reporter: Arc<dyn ErrorReporter>,
}

impl<T: Send + 'static> Flusher<T> {
    async fn flush(&self, batch: Vec<T>, summary: &mut BatchSummary) {
        let items = batch.len() as u64;
        let result = AssertUnwindSafe(self.sink.flush(batch))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(HandlerError::from_panic(panic).into()));

        summary.batches += 1;
        match result {
            Ok(()) => {
                summary.flushed += items;
                tracing::debug!(buffer = %self.name, items, "batch flushed");
            }
            Err(err) => {
                summary.dropped += items;
                tracing::error!(buffer = %self.name, items, "batch flush failed, dropping items: {err:#}");
                reporting::submit(
                    self.reporter.as_ref(),
                    ErrorReport::new(
                        ReportOrigin::Batch,
                        "unhandled",
                        format!("flush of {items} items from `{}` failed", self.name),
                        format!("{err:?}"),
                    ),
                )
                .await;
            }
        }
    }
}

async fn run_flush_loop<T: Send + 'static>(
    config: BatchConfig,
    queue: Arc<MessageQueue<T>>,
    flusher: Flusher<T>,
    shutdown: ShutdownToken,
) -> BatchSummary {
    let batch_size = config.batch_size.max(1);
    let mut summary = BatchSummary::default();
    let mut pending = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval(config.flush_interval().max(std::time::Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            item = queue.dequeue(&shutdown) => match item {
                Some(item) => {
                    pending.push(item);
                    if pending.len() >= batch_size {
                        let batch = std::mem::replace(&mut pending, Vec::with_capacity(batch_size));
                        flusher.flush(batch, &mut summary).await;
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                if !pending.is_empty() {
                    let batch = std::mem::replace(&mut pending, Vec::with_capacity(batch_size));
                    flusher.flush(batch, &mut summary).await;
                }
            }
        }
    }

    while let Some(item) = queue.try_dequeue() {
        pending.push(item);
    }
    while !pending.is_empty() {
        let rest = pending.split_off(batch_size.min(pending.len()));
        let batch = std::mem::replace(&mut pending, rest);
        flusher.flush(batch, &mut summary).await;
    }

    tracing::info!(
        buffer = %config.name,
        batches = summary.batches,
        flushed = summary.flushed,
        dropped = summary.dropped,
        "batch buffer stopped"
    );
    summary
}
