use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::broadcaster::Broadcaster;
use crate::config::PipelineConfig;
use crate::dispatch::{
    CommandDispatcher, Dispatch, DispatchContext, EventDispatcher, PendingResponse, QueueItem,
    RequestDispatcher, RequestEnvelope,
};
use crate::error::DispatchError;
use crate::lifecycle::{LifecycleBus, LifecycleEvent, LifecyclePayload};
use crate::message::{Envelope, Message, MessageCategory, MessageId, ReplyContext, RequestMessage};
use crate::queue::{MessageQueue, QueueSnapshot};
use crate::readiness::Readiness;
use crate::reporting::ErrorReporter;
use crate::router::{CommandRegistry, EventRegistry, RequestRegistry};
use crate::shutdown::ShutdownToken;
use crate::telemetry;
use crate::worker::{Worker, WorkerConfig, WorkerSummary};

/// The four-queue dispatch pipeline.
///
/// `C` are serial commands, `P` parallel commands, `R` requests and `E`
/// events. Producers call the `enqueue_*`, `send_request` and
/// `publish_event` entry points, which never wait on a handler. One worker
/// per queue, spawned by [`start`](Self::start), does the dispatching.
pub struct Pipeline<C, P, R, E>
where
    C: Message,
    P: Message,
    R: RequestMessage,
    E: Message,
{
    config: PipelineConfig,
    commands: Arc<MessageQueue<Envelope<C>>>,
    parallel_commands: Arc<MessageQueue<Envelope<P>>>,
    requests: Arc<MessageQueue<RequestEnvelope<R>>>,
    events: Arc<MessageQueue<Envelope<E>>>,
    command_registry: Arc<CommandRegistry<C>>,
    parallel_registry: Arc<CommandRegistry<P>>,
    request_registry: Arc<RequestRegistry<R>>,
    event_registry: Arc<EventRegistry<E>>,
    context: DispatchContext,
    lifecycle: LifecycleBus,
    worker_handles: Mutex<Vec<(String, JoinHandle<WorkerSummary>)>>,
}

impl<C, P, R, E> fmt::Debug for Pipeline<C, P, R, E>
where
    C: Message,
    P: Message,
    R: RequestMessage,
    E: Message,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let worker_count = self
            .worker_handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();

        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("command_type", &type_name::<C>())
            .field("parallel_command_type", &type_name::<P>())
            .field("request_type", &type_name::<R>())
            .field("event_type", &type_name::<E>())
            .field("worker_count", &worker_count)
            .field("ready", &self.context.readiness.is_ready())
            .field("shutdown_cancelled", &self.context.shutdown.is_cancelled())
            .finish()
    }
}

impl<C, P, R, E> Pipeline<C, P, R, E>
where
    C: Message,
    P: Message,
    R: RequestMessage,
    E: Message,
{
    pub fn builder() -> PipelineBuilder<C, P, R, E> {
        PipelineBuilder::new(PipelineConfig::default())
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// The readiness signal handed to every handler.
    pub fn readiness(&self) -> &Readiness {
        &self.context.readiness
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.context.shutdown.clone()
    }

    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle.subscribe()
    }

    pub fn queue_snapshots(&self) -> Vec<QueueSnapshot> {
        vec![
            self.commands.snapshot(),
            self.parallel_commands.snapshot(),
            self.requests.snapshot(),
            self.events.snapshot(),
        ]
    }

    /// Queue a command for ordered, one-at-a-time handling.
    pub fn enqueue_command(
        &self,
        message: C,
        reply: Option<Arc<dyn ReplyContext>>,
    ) -> Result<MessageId, DispatchError> {
        let envelope = with_reply(Envelope::new(MessageCategory::Command, message), reply);
        let id = envelope.id;
        self.enqueue(&self.commands, envelope)?;
        Ok(id)
    }

    /// Queue a command that may run concurrently with other parallel
    /// commands.
    pub fn enqueue_parallel_command(
        &self,
        message: P,
        reply: Option<Arc<dyn ReplyContext>>,
    ) -> Result<MessageId, DispatchError> {
        let envelope = with_reply(Envelope::new(MessageCategory::ParallelCommand, message), reply);
        let id = envelope.id;
        self.enqueue(&self.parallel_commands, envelope)?;
        Ok(id)
    }

    /// Queue a request. The returned handle resolves with the handler's
    /// response, or with the translated failure.
    pub fn send_request(
        &self,
        message: R,
        reply: Option<Arc<dyn ReplyContext>>,
    ) -> Result<PendingResponse<R::Response>, DispatchError> {
        let envelope = with_reply(Envelope::new(MessageCategory::Request, message), reply);
        let (request, pending) = RequestEnvelope::new(envelope);
        self.enqueue(&self.requests, request)?;
        Ok(pending)
    }

    /// Queue an event for every handler registered for its kind.
    pub fn publish_event(&self, event: E) -> Result<MessageId, DispatchError> {
        let envelope = Envelope::new(MessageCategory::Event, event);
        let id = envelope.id;
        self.enqueue(&self.events, envelope)?;
        Ok(id)
    }

    fn enqueue<I: QueueItem>(&self, queue: &MessageQueue<I>, item: I) -> Result<(), DispatchError> {
        let meta = item.meta();
        let span = telemetry::enqueue_span(meta.category, meta.kind);
        let _entered = span.enter();

        if let Err(err) = queue.enqueue(item) {
            tracing::warn!(
                message_id = %meta.id,
                queue = queue.name(),
                "enqueue rejected: {err}"
            );
            return Err(err.into());
        }

        telemetry::record_enqueued(meta.category, meta.kind);
        telemetry::set_queue_depth(queue.name(), queue.depth());
        self.lifecycle.publish(LifecyclePayload::Enqueued { meta });
        Ok(())
    }

    /// Spawn one worker per queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipeline is already running or was shut down.
    pub async fn start(&self) -> anyhow::Result<()> {
        if self.context.shutdown.is_cancelled() {
            anyhow::bail!("pipeline has been shut down");
        }
        let mut handles = self.worker_handles.lock().await;
        if !handles.is_empty() {
            anyhow::bail!("pipeline already started");
        }

        handles.push(self.launch(
            self.config.command_worker.clone(),
            &self.commands,
            CommandDispatcher::new(Arc::clone(&self.command_registry), self.context.clone()),
        ));
        handles.push(self.launch(
            self.config.parallel_command_worker.clone(),
            &self.parallel_commands,
            CommandDispatcher::new(Arc::clone(&self.parallel_registry), self.context.clone()),
        ));
        handles.push(self.launch(
            self.config.request_worker.clone(),
            &self.requests,
            RequestDispatcher::new(Arc::clone(&self.request_registry), self.context.clone()),
        ));
        handles.push(self.launch(
            self.config.event_worker.clone(),
            &self.events,
            EventDispatcher::new(
                Broadcaster::new(Arc::clone(&self.event_registry)),
                self.context.clone(),
            ),
        ));

        tracing::info!(workers = handles.len(), "pipeline started");
        Ok(())
    }

    fn launch<I, D>(
        &self,
        config: WorkerConfig,
        queue: &Arc<MessageQueue<I>>,
        dispatcher: D,
    ) -> (String, JoinHandle<WorkerSummary>)
    where
        I: QueueItem,
        D: Dispatch<I> + 'static,
    {
        let name = config.name.clone();
        let handle = Worker::new(
            config,
            Arc::clone(queue),
            Arc::new(dispatcher),
            self.context.shutdown.clone(),
            Arc::clone(&self.context.reporter),
        )
        .with_readiness(self.context.readiness.clone())
        .with_lifecycle(self.lifecycle.clone())
        .spawn();
        (name, handle)
    }

    /// Stop the pipeline now.
    ///
    /// Cancels the shutdown token, closes every queue and waits up to
    /// `shutdown_timeout` for each worker. Messages still queued are dropped;
    /// their pending requests resolve with [`DispatchError::Cancelled`].
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        tracing::info!("Initiating graceful shutdown of dispatch pipeline");

        self.context.shutdown.cancel();
        self.close_queues();
        self.await_workers().await;

        tracing::info!("Dispatch pipeline shutdown complete");
        Ok(())
    }

    /// Stop accepting messages, let the workers finish everything already
    /// queued, then shut down.
    pub async fn drain(&self) -> anyhow::Result<()> {
        tracing::info!("Draining dispatch pipeline");

        self.close_queues();
        self.await_workers().await;
        self.context.shutdown.cancel();

        tracing::info!("Dispatch pipeline drained");
        Ok(())
    }

    fn close_queues(&self) {
        self.commands.close();
        self.parallel_commands.close();
        self.requests.close();
        self.events.close();
    }

    async fn await_workers(&self) {
        let handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };

        for (name, handle) in handles {
            match tokio::time::timeout(self.config.shutdown_timeout(), handle)
                .instrument(tracing::info_span!("herald.worker_join", worker = %name))
                .await
            {
                Ok(Ok(summary)) => tracing::debug!(
                    worker = %name,
                    dispatched = summary.dispatched,
                    failed = summary.failed,
                    "worker joined"
                ),
                Ok(Err(e)) => tracing::warn!("Worker {} task failed: {:?}", name, e),
                Err(_) => tracing::warn!("Worker {} timed out during shutdown", name),
            }
        }
    }
}

fn with_reply<M: Message>(envelope: Envelope<M>, reply: Option<Arc<dyn ReplyContext>>) -> Envelope<M> {
    match reply {
        Some(reply) => envelope.with_reply(reply),
        None => envelope,
    }
}

/// Assembles a [`Pipeline`] from its registries and services.
pub struct PipelineBuilder<C, P, R, E>
where
    C: Message,
    P: Message,
    R: RequestMessage,
    E: Message,
{
    config: PipelineConfig,
    commands: Option<Arc<CommandRegistry<C>>>,
    parallel_commands: Option<Arc<CommandRegistry<P>>>,
    requests: Option<Arc<RequestRegistry<R>>>,
    events: Option<Arc<EventRegistry<E>>>,
    reporter: Option<Arc<dyn ErrorReporter>>,
    readiness: Option<Readiness>,
    lifecycle: Option<LifecycleBus>,
}

impl<C, P, R, E> fmt::Debug for PipelineBuilder<C, P, R, E>
where
    C: Message,
    P: Message,
    R: RequestMessage,
    E: Message,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("config", &self.config)
            .field("commands_set", &self.commands.is_some())
            .field("parallel_commands_set", &self.parallel_commands.is_some())
            .field("requests_set", &self.requests.is_some())
            .field("events_set", &self.events.is_some())
            .field("reporter_set", &self.reporter.is_some())
            .field("readiness_set", &self.readiness.is_some())
            .field("lifecycle_set", &self.lifecycle.is_some())
            .finish()
    }
}

impl<C, P, R, E> PipelineBuilder<C, P, R, E>
where
    C: Message,
    P: Message,
    R: RequestMessage,
    E: Message,
{
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            commands: None,
            parallel_commands: None,
            requests: None,
            events: None,
            reporter: None,
            readiness: None,
            lifecycle: None,
        }
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the registry for serial commands.
    pub fn with_commands(mut self, registry: Arc<CommandRegistry<C>>) -> Self {
        self.commands = Some(registry);
        self
    }

    /// Set the registry for parallel commands.
    pub fn with_parallel_commands(mut self, registry: Arc<CommandRegistry<P>>) -> Self {
        self.parallel_commands = Some(registry);
        self
    }

    pub fn with_requests(mut self, registry: Arc<RequestRegistry<R>>) -> Self {
        self.requests = Some(registry);
        self
    }

    pub fn with_events(mut self, registry: Arc<EventRegistry<E>>) -> Self {
        self.events = Some(registry);
        self
    }

    /// Set the sink every handler failure is reported to.
    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Share an existing readiness signal. A fresh, not-ready one is created
    /// otherwise.
    pub fn with_readiness(mut self, readiness: Readiness) -> Self {
        self.readiness = Some(readiness);
        self
    }

    pub fn with_lifecycle(mut self, bus: LifecycleBus) -> Self {
        self.lifecycle = Some(bus);
        self
    }

    /// Build the pipeline. Workers are not running until
    /// [`Pipeline::start`].
    ///
    /// # Errors
    ///
    /// Returns an error if any registry or the reporter is missing.
    pub fn build(self) -> anyhow::Result<Pipeline<C, P, R, E>> {
        let command_registry = self
            .commands
            .ok_or_else(|| anyhow::anyhow!("command registry missing"))?;
        let parallel_registry = self
            .parallel_commands
            .ok_or_else(|| anyhow::anyhow!("parallel command registry missing"))?;
        let request_registry = self
            .requests
            .ok_or_else(|| anyhow::anyhow!("request registry missing"))?;
        let event_registry = self
            .events
            .ok_or_else(|| anyhow::anyhow!("event registry missing"))?;
        let reporter = self
            .reporter
            .ok_or_else(|| anyhow::anyhow!("error reporter missing"))?;
        let readiness = self.readiness.unwrap_or_default();
        let lifecycle = self
            .lifecycle
            .unwrap_or_else(|| LifecycleBus::new(self.config.lifecycle_capacity));

        let queues = self.config.queues.clone();
        Ok(Pipeline {
            commands: Arc::new(MessageQueue::new("commands", queues.commands)),
            parallel_commands: Arc::new(MessageQueue::new("parallel_commands", queues.parallel_commands)),
            requests: Arc::new(MessageQueue::new("requests", queues.requests)),
            events: Arc::new(MessageQueue::new("events", queues.events)),
            command_registry,
            parallel_registry,
            request_registry,
            event_registry,
            context: DispatchContext::new(ShutdownToken::new(), readiness, reporter),
            lifecycle,
            worker_handles: Mutex::new(Vec::new()),
            config: self.config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::handler::{CommandHandler, EventHandler, HandlerContext, RequestHandler};
    use crate::message::MessageKind;
    use crate::reporting::TracingReporter;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::time::timeout;

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    enum EchoKind {
        Echo,
    }

    impl MessageKind for EchoKind {
        fn all() -> &'static [Self] {
            &[EchoKind::Echo]
        }

        fn as_str(&self) -> &'static str {
            "echo"
        }
    }

    impl fmt::Display for EchoKind {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    #[derive(Debug)]
    struct Echo(String);

    impl Message for Echo {
        type Kind = EchoKind;

        fn kind(&self) -> EchoKind {
            EchoKind::Echo
        }
    }

    impl RequestMessage for Echo {
        type Response = String;
    }

    struct EchoHandler;

    #[async_trait]
    impl CommandHandler<Echo> for EchoHandler {
        async fn handle(&self, _message: &Echo, _cx: &HandlerContext) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[async_trait]
    impl RequestHandler<Echo> for EchoHandler {
        async fn handle(&self, message: &Echo, _cx: &HandlerContext) -> Result<String, HandlerError> {
            if message.0.is_empty() {
                return Err(HandlerError::validation("nothing to echo"));
            }
            Ok(message.0.to_uppercase())
        }
    }

    #[async_trait]
    impl EventHandler<Echo> for EchoHandler {
        async fn handle(&self, _event: &Echo, _cx: &HandlerContext) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    type EchoPipeline = Pipeline<Echo, Echo, Echo, Echo>;

    fn pipeline() -> EchoPipeline {
        let handler = Arc::new(EchoHandler);
        Pipeline::builder()
            .with_commands(Arc::new(
                CommandRegistry::<Echo>::builder(MessageCategory::Command)
                    .register(EchoKind::Echo, handler.clone())
                    .build()
                    .unwrap(),
            ))
            .with_parallel_commands(Arc::new(
                CommandRegistry::<Echo>::builder(MessageCategory::ParallelCommand)
                    .register(EchoKind::Echo, handler.clone())
                    .build()
                    .unwrap(),
            ))
            .with_requests(Arc::new(
                RequestRegistry::<Echo>::builder(MessageCategory::Request)
                    .register(EchoKind::Echo, handler.clone())
                    .build()
                    .unwrap(),
            ))
            .with_events(Arc::new(
                EventRegistry::<Echo>::builder(MessageCategory::Event)
                    .register(EchoKind::Echo, handler)
                    .build()
                    .unwrap(),
            ))
            .with_reporter(Arc::new(TracingReporter))
            .with_readiness(Readiness::ready())
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_requires_registries() {
        let result = EchoPipeline::builder()
            .with_reporter(Arc::new(TracingReporter))
            .build();
        let err = result.unwrap_err();
        assert!(err.to_string().contains("command registry missing"));
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let pipeline = pipeline();
        pipeline.start().await.unwrap();

        let pending = pipeline.send_request(Echo("hello".into()), None).unwrap();
        let response = timeout(Duration::from_secs(1), pending.recv()).await.unwrap();
        assert_eq!(response.unwrap(), "HELLO");

        let pending = pipeline.send_request(Echo(String::new()), None).unwrap();
        let failure = timeout(Duration::from_secs(1), pending.recv()).await.unwrap();
        match failure {
            Err(DispatchError::Handler { message }) => assert_eq!(message, "nothing to echo"),
            other => panic!("unexpected response: {other:?}"),
        }

        pipeline.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let pipeline = pipeline();
        pipeline.start().await.unwrap();
        assert!(pipeline.start().await.is_err());
        pipeline.shutdown().await.unwrap();
        assert!(pipeline.start().await.is_err());
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_is_rejected() {
        let pipeline = pipeline();
        pipeline.start().await.unwrap();
        pipeline.shutdown().await.unwrap();

        let err = pipeline.publish_event(Echo("late".into())).unwrap_err();
        assert!(matches!(err, DispatchError::Queue(crate::error::QueueError::Closed)));
        assert!(pipeline.queue_snapshots().iter().all(|snapshot| snapshot.closed));
    }

    #[tokio::test]
    async fn test_lifecycle_reports_enqueue_and_stop() {
        let pipeline = pipeline();
        let mut events = pipeline.subscribe_lifecycle();
        pipeline.start().await.unwrap();

        pipeline.enqueue_command(Echo("a".into()), None).unwrap();
        pipeline.drain().await.unwrap();

        let mut enqueued = 0;
        let mut stopped = 0;
        while let Ok(event) = events.try_recv() {
            match event.payload {
                LifecyclePayload::Enqueued { .. } => enqueued += 1,
                LifecyclePayload::WorkerStopped { .. } => stopped += 1,
                _ => {}
            }
        }
        assert_eq!(enqueued, 1);
        assert_eq!(stopped, 4);
    }

    #[tokio::test]
    async fn test_queued_request_is_cancelled_by_shutdown() {
        let pipeline = pipeline();
        let pending = pipeline.send_request(Echo("never".into()), None).unwrap();
        pipeline.shutdown().await.unwrap();

        // Never started: the queue was dropped with the request still in it.
        drop(pipeline);
        let err = pending.recv().await.unwrap_err();
        assert!(matches!(err, DispatchError::Cancelled));
    }
}
