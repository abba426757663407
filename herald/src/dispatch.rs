use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::broadcaster::Broadcaster;
use crate::error::{DispatchError, HandlerConfigurationError};
use crate::handler::HandlerContext;
use crate::message::{Envelope, EnvelopeMeta, Message, RequestMessage};
use crate::middleware::ErrorTranslator;
use crate::readiness::Readiness;
use crate::reporting::{self, ErrorReport, ErrorReporter};
use crate::router::{CommandRegistry, RequestRegistry};
use crate::shutdown::ShutdownToken;

/// Result of dispatching one queued item.
///
/// Handler failures have already been replied to, logged and reported by
/// the time a status is returned; the status only tells the worker what
/// happened.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DispatchStatus {
    /// Every handler succeeded.
    Handled,
    /// The single command or request handler failed.
    Failed,
    /// Some event handlers failed; the others still ran.
    PartiallyFailed { failures: usize },
}

/// Anything a worker can pull off a queue and describe in logs.
pub trait QueueItem: Send + 'static {
    fn meta(&self) -> EnvelopeMeta;
}

impl<M: Message> QueueItem for Envelope<M> {
    fn meta(&self) -> EnvelopeMeta {
        Envelope::meta(self)
    }
}

/// Routes one queued item to its handler(s).
///
/// A configuration error means the registry cannot serve the item at all;
/// it is a bootstrap defect, not a handler failure.
#[async_trait]
pub trait Dispatch<I: QueueItem>: Send + Sync {
    async fn dispatch(&self, item: I) -> Result<DispatchStatus, HandlerConfigurationError>;
}

/// Shared services every dispatcher hands to its handlers.
#[derive(Clone)]
pub struct DispatchContext {
    pub shutdown: ShutdownToken,
    pub readiness: Readiness,
    pub reporter: Arc<dyn ErrorReporter>,
}

impl DispatchContext {
    pub fn new(shutdown: ShutdownToken, readiness: Readiness, reporter: Arc<dyn ErrorReporter>) -> Self {
        Self {
            shutdown,
            readiness,
            reporter,
        }
    }

    pub fn translator(&self) -> ErrorTranslator {
        ErrorTranslator::new(Arc::clone(&self.reporter))
    }

    fn handler_context<M: Message>(&self, envelope: &Envelope<M>) -> HandlerContext {
        HandlerContext::new(
            envelope.meta(),
            envelope.reply_context().cloned(),
            self.shutdown.clone(),
            self.readiness.clone(),
        )
    }
}

/// Dispatches commands (serial or parallel) to their single handler through
/// the error-translation middleware.
pub struct CommandDispatcher<M: Message> {
    registry: Arc<CommandRegistry<M>>,
    translator: ErrorTranslator,
    context: DispatchContext,
}

impl<M: Message> CommandDispatcher<M> {
    pub fn new(registry: Arc<CommandRegistry<M>>, context: DispatchContext) -> Self {
        Self {
            registry,
            translator: context.translator(),
            context,
        }
    }
}

#[async_trait]
impl<M: Message> Dispatch<Envelope<M>> for CommandDispatcher<M> {
    async fn dispatch(&self, envelope: Envelope<M>) -> Result<DispatchStatus, HandlerConfigurationError> {
        let handler = self.registry.resolve_one(envelope.kind())?;
        let cx = self.context.handler_context(&envelope);

        let status = match self
            .translator
            .invoke(&cx, handler.handle(&envelope.message, &cx))
            .await
        {
            Ok(()) => DispatchStatus::Handled,
            Err(_) => DispatchStatus::Failed,
        };
        Ok(status)
    }
}

/// The caller's end of a request: resolves once the handler has run.
#[derive(Debug)]
pub struct PendingResponse<R> {
    receiver: oneshot::Receiver<Result<R, DispatchError>>,
}

impl<R> PendingResponse<R> {
    /// Wait for the response.
    ///
    /// Fails with [`DispatchError::Cancelled`] if the request was dropped
    /// without being dispatched, for example at shutdown.
    pub async fn recv(self) -> Result<R, DispatchError> {
        self.receiver.await.unwrap_or(Err(DispatchError::Cancelled))
    }

    pub fn into_inner(self) -> oneshot::Receiver<Result<R, DispatchError>> {
        self.receiver
    }
}

/// A request envelope paired with the channel its response goes back on.
pub struct RequestEnvelope<M: RequestMessage> {
    pub envelope: Envelope<M>,
    responder: oneshot::Sender<Result<M::Response, DispatchError>>,
}

impl<M: RequestMessage> RequestEnvelope<M> {
    pub fn new(envelope: Envelope<M>) -> (Self, PendingResponse<M::Response>) {
        let (responder, receiver) = oneshot::channel();
        (Self { envelope, responder }, PendingResponse { receiver })
    }

    fn respond(self, result: Result<M::Response, DispatchError>) {
        if self.responder.send(result).is_err() {
            tracing::debug!(message_id = %self.envelope.id, "request caller went away before the response");
        }
    }
}

impl<M: RequestMessage> std::fmt::Debug for RequestEnvelope<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestEnvelope")
            .field("envelope", &self.envelope)
            .field("caller_waiting", &!self.responder.is_closed())
            .finish()
    }
}

impl<M: RequestMessage> QueueItem for RequestEnvelope<M> {
    fn meta(&self) -> EnvelopeMeta {
        self.envelope.meta()
    }
}

/// Dispatches requests to their single handler and completes the caller's
/// [`PendingResponse`].
pub struct RequestDispatcher<M: RequestMessage> {
    registry: Arc<RequestRegistry<M>>,
    translator: ErrorTranslator,
    context: DispatchContext,
}

impl<M: RequestMessage> RequestDispatcher<M> {
    pub fn new(registry: Arc<RequestRegistry<M>>, context: DispatchContext) -> Self {
        Self {
            registry,
            translator: context.translator(),
            context,
        }
    }
}

#[async_trait]
impl<M: RequestMessage> Dispatch<RequestEnvelope<M>> for RequestDispatcher<M> {
    async fn dispatch(&self, request: RequestEnvelope<M>) -> Result<DispatchStatus, HandlerConfigurationError> {
        let handler = match self.registry.resolve_one(request.envelope.kind()) {
            Ok(handler) => handler,
            Err(err) => {
                request.respond(Err(DispatchError::Configuration(err.clone())));
                return Err(err);
            }
        };
        let cx = self.context.handler_context(&request.envelope);

        let outcome = self
            .translator
            .invoke(&cx, handler.handle(&request.envelope.message, &cx))
            .await;

        let status = match outcome {
            Ok(response) => {
                request.respond(Ok(response));
                DispatchStatus::Handled
            }
            Err(failure) => {
                request.respond(Err(DispatchError::Handler {
                    message: failure.user_message,
                }));
                DispatchStatus::Failed
            }
        };
        Ok(status)
    }
}

/// Dispatches events to all their handlers.
///
/// An aggregated failure is logged and reported once per event. It is not
/// surfaced to any originator: events have no reply channel.
pub struct EventDispatcher<E: Message> {
    broadcaster: Broadcaster<E>,
    context: DispatchContext,
}

impl<E: Message> EventDispatcher<E> {
    pub fn new(broadcaster: Broadcaster<E>, context: DispatchContext) -> Self {
        Self {
            broadcaster,
            context,
        }
    }
}

#[async_trait]
impl<E: Message> Dispatch<Envelope<E>> for EventDispatcher<E> {
    async fn dispatch(&self, envelope: Envelope<E>) -> Result<DispatchStatus, HandlerConfigurationError> {
        let cx = self.context.handler_context(&envelope);

        match self.broadcaster.broadcast(&envelope, &cx).await {
            Ok(()) => Ok(DispatchStatus::Handled),
            Err(aggregate) => {
                let meta = envelope.meta();
                tracing::error!(
                    message_id = %meta.id,
                    correlation_id = %meta.correlation_id,
                    kind = meta.kind,
                    failed = ?aggregate.failed_handlers(),
                    "event handlers failed: {aggregate}"
                );
                reporting::submit(
                    self.context.reporter.as_ref(),
                    ErrorReport::broadcast_failure(&meta, &aggregate),
                )
                .await;
                Ok(DispatchStatus::PartiallyFailed {
                    failures: aggregate.failures.len(),
                })
            }
        }
    }
}
