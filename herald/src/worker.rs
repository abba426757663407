use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};

use crate::dispatch::{Dispatch, DispatchStatus, QueueItem};
use crate::lifecycle::{LifecycleBus, LifecyclePayload};
use crate::queue::MessageQueue;
use crate::readiness::Readiness;
use crate::reporting::{self, ErrorReport, ErrorReporter, ReportOrigin};
use crate::shutdown::ShutdownToken;
use crate::telemetry::{self, DispatchOutcome};

/// How a worker consumes its queue.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerMode {
    /// One message at a time, in queue order.
    #[default]
    Serial,
    /// Each message dispatched on its own task as soon as it is dequeued.
    Parallel,
}

/// Configuration for a single queue worker.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Name used in logs and lifecycle events.
    pub name: String,
    pub mode: WorkerMode,
    /// Upper bound on concurrent dispatches in parallel mode. `None` means
    /// unbounded.
    pub max_in_flight: Option<usize>,
    /// How long a stopping parallel worker waits for in-flight dispatches,
    /// in milliseconds, before detaching them.
    pub drain_timeout_ms: u64,
    /// Hold the loop until the platform client is ready.
    pub wait_for_ready: bool,
}

impl WorkerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn with_mode(mut self, mode: WorkerMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = Some(max_in_flight);
        self
    }

    pub fn with_drain_timeout(mut self, ms: u64) -> Self {
        self.drain_timeout_ms = ms;
        self
    }

    pub fn with_wait_for_ready(mut self, wait: bool) -> Self {
        self.wait_for_ready = wait;
        self
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            mode: WorkerMode::Serial,
            max_in_flight: None,
            drain_timeout_ms: 10_000,
            wait_for_ready: false,
        }
    }
}

/// Counts reported when a worker loop exits.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct WorkerSummary {
    /// Messages that reached a handler.
    pub dispatched: u64,
    /// Of those, how many had at least one handler failure.
    pub failed: u64,
    /// Messages dropped because no handler was registered for them.
    pub misconfigured: u64,
}

impl WorkerSummary {
    fn record(&mut self, outcome: DispatchOutcome) {
        match outcome {
            DispatchOutcome::Handled => self.dispatched += 1,
            DispatchOutcome::Failed | DispatchOutcome::PartiallyFailed => {
                self.dispatched += 1;
                self.failed += 1;
            }
            DispatchOutcome::Misconfigured => self.misconfigured += 1,
        }
    }
}

/// Per-message work shared by the serial loop and parallel tasks.
struct DispatchStep<D> {
    dispatcher: Arc<D>,
    reporter: Arc<dyn ErrorReporter>,
    lifecycle: Option<LifecycleBus>,
}

impl<D> Clone for DispatchStep<D> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: Arc::clone(&self.dispatcher),
            reporter: Arc::clone(&self.reporter),
            lifecycle: self.lifecycle.clone(),
        }
    }
}

impl<D> DispatchStep<D> {
    async fn process<I>(&self, item: I) -> DispatchOutcome
    where
        I: QueueItem,
        D: Dispatch<I>,
    {
        let meta = item.meta();
        let timer = telemetry::record_dispatch_start();
        let result = telemetry::instrument_dispatch(&meta, self.dispatcher.dispatch(item)).await;
        let duration_ms = timer.elapsed().as_millis() as u64;

        let (outcome, payload) = match result {
            Ok(DispatchStatus::Handled) => (
                DispatchOutcome::Handled,
                LifecyclePayload::Dispatched { meta, duration_ms },
            ),
            Ok(DispatchStatus::Failed) => (
                DispatchOutcome::Failed,
                LifecyclePayload::Failed { meta, failures: 1 },
            ),
            Ok(DispatchStatus::PartiallyFailed { failures }) => (
                DispatchOutcome::PartiallyFailed,
                LifecyclePayload::Failed { meta, failures },
            ),
            Err(err) => {
                tracing::error!(
                    message_id = %meta.id,
                    correlation_id = %meta.correlation_id,
                    category = %meta.category,
                    kind = meta.kind,
                    "unrecoverable handler configuration error, message dropped: {err}"
                );
                reporting::submit(
                    self.reporter.as_ref(),
                    ErrorReport::new(
                        ReportOrigin::Configuration,
                        "configuration",
                        format!("no usable {} handler for `{}`", meta.category, meta.kind),
                        err.to_string(),
                    )
                    .with_meta(&meta),
                )
                .await;
                telemetry::record_misconfigured(&meta);
                (
                    DispatchOutcome::Misconfigured,
                    LifecyclePayload::Misconfigured {
                        meta,
                        error: err.to_string(),
                    },
                )
            }
        };

        if outcome != DispatchOutcome::Misconfigured {
            telemetry::record_dispatch_end(timer, &meta, outcome);
        }
        if let Some(bus) = &self.lifecycle {
            bus.publish(payload);
        }
        outcome
    }

    async fn reap(&self, worker: &str, joined: Result<DispatchOutcome, JoinError>, summary: &mut WorkerSummary) {
        match joined {
            Ok(outcome) => summary.record(outcome),
            Err(err) if err.is_panic() => {
                tracing::error!(worker, "dispatch task panicked: {err}");
                summary.record(DispatchOutcome::Failed);
                reporting::submit(
                    self.reporter.as_ref(),
                    ErrorReport::new(
                        ReportOrigin::Worker,
                        "panicked",
                        format!("dispatch task in worker `{worker}` panicked"),
                        err.to_string(),
                    ),
                )
                .await;
            }
            Err(err) => tracing::warn!(worker, "dispatch task ended abnormally: {err}"),
        }
    }
}

/// Consumes one queue until it is closed and drained or shutdown fires.
pub struct Worker<I, D> {
    config: WorkerConfig,
    queue: Arc<MessageQueue<I>>,
    step: DispatchStep<D>,
    shutdown: ShutdownToken,
    readiness: Option<Readiness>,
}

impl<I, D> Worker<I, D>
where
    I: QueueItem,
    D: Dispatch<I> + 'static,
{
    pub fn new(
        config: WorkerConfig,
        queue: Arc<MessageQueue<I>>,
        dispatcher: Arc<D>,
        shutdown: ShutdownToken,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        Self {
            config,
            queue,
            step: DispatchStep {
                dispatcher,
                reporter,
                lifecycle: None,
            },
            shutdown,
            readiness: None,
        }
    }

    pub fn with_readiness(mut self, readiness: Readiness) -> Self {
        self.readiness = Some(readiness);
        self
    }

    pub fn with_lifecycle(mut self, bus: LifecycleBus) -> Self {
        self.step.lifecycle = Some(bus);
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn spawn(self) -> JoinHandle<WorkerSummary> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) -> WorkerSummary {
        let name = self.config.name.clone();

        if self.config.wait_for_ready {
            if let Some(readiness) = &self.readiness {
                if !readiness.is_ready() {
                    tracing::info!("Worker {} waiting for platform readiness", name);
                }
                if !readiness.wait_ready(&self.shutdown).await {
                    tracing::info!("Worker {} shutting down before becoming ready", name);
                    return self.finish(WorkerSummary::default());
                }
            }
        }

        tracing::info!(
            worker = %name,
            mode = ?self.config.mode,
            queue = self.queue.name(),
            "worker started"
        );

        let summary = match self.config.mode {
            WorkerMode::Serial => self.run_serial().await,
            WorkerMode::Parallel => self.run_parallel().await,
        };
        self.finish(summary)
    }

    fn finish(&self, summary: WorkerSummary) -> WorkerSummary {
        tracing::info!(
            dispatched = summary.dispatched,
            failed = summary.failed,
            misconfigured = summary.misconfigured,
            "Worker {} shutting down",
            self.config.name
        );
        if let Some(bus) = &self.step.lifecycle {
            bus.publish(LifecyclePayload::WorkerStopped {
                worker: self.config.name.clone(),
                summary,
            });
        }
        summary
    }

    async fn run_serial(&self) -> WorkerSummary {
        let mut summary = WorkerSummary::default();
        let mut items = Box::pin(self.queue.dequeue_all(self.shutdown.clone()));

        while let Some(item) = items.next().await {
            telemetry::set_queue_depth(self.queue.name(), self.queue.depth());
            summary.record(self.step.process(item).await);
        }
        summary
    }

    async fn run_parallel(&self) -> WorkerSummary {
        let name = self.config.name.as_str();
        let mut summary = WorkerSummary::default();
        let mut tasks: JoinSet<DispatchOutcome> = JoinSet::new();
        let limit = self
            .config
            .max_in_flight
            .map(|max| Arc::new(Semaphore::new(max.max(1))));

        loop {
            tokio::select! {
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    self.step.reap(name, joined, &mut summary).await;
                }
                next = self.next_parallel_item(limit.as_ref()) => match next {
                    Some((item, permit)) => {
                        telemetry::set_queue_depth(self.queue.name(), self.queue.depth());
                        let step = self.step.clone();
                        tasks.spawn(async move {
                            let _permit = permit;
                            step.process(item).await
                        });
                    }
                    None => break,
                },
            }
        }

        if !tasks.is_empty() {
            tracing::info!("Worker {} draining {} in-flight dispatches", name, tasks.len());
            let drained = tokio::time::timeout(self.config.drain_timeout(), async {
                while let Some(joined) = tasks.join_next().await {
                    self.step.reap(name, joined, &mut summary).await;
                }
            })
            .await;

            if drained.is_err() {
                tracing::warn!(
                    worker = name,
                    remaining = tasks.len(),
                    "drain timeout elapsed, detaching in-flight dispatches"
                );
                // Dropping a JoinSet aborts its tasks; detach so they finish.
                tasks.detach_all();
            }
        }
        summary
    }

    /// Wait for capacity, then for the next item.
    async fn next_parallel_item(&self, limit: Option<&Arc<Semaphore>>) -> Option<(I, Option<OwnedSemaphorePermit>)> {
        let permit = match limit {
            Some(semaphore) => Some(
                self.shutdown
                    .run_until_cancelled(Arc::clone(semaphore).acquire_owned())
                    .await?
                    .ok()?,
            ),
            None => None,
        };
        let item = self.queue.dequeue(&self.shutdown).await?;
        Some((item, permit))
    }
}

impl<I, D> std::fmt::Debug for Worker<I, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("config", &self.config)
            .field("dispatcher_type", &std::any::type_name::<D>())
            .field("shutdown_cancelled", &self.shutdown.is_cancelled())
            .finish()
    }
}
