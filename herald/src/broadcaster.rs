use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::Instrument;

use crate::error::{AggregatedHandlerError, HandlerError, HandlerFailure};
use crate::handler::HandlerContext;
use crate::message::{Envelope, Message, MessageKind};
use crate::router::EventRegistry;
use crate::telemetry;

/// Fans one event out to every handler registered for its kind.
///
/// Handlers run one after another in registration order. A failing or
/// panicking handler never prevents the ones after it from running; the
/// failures are collected and returned together once all have run.
pub struct Broadcaster<E: Message> {
    registry: Arc<EventRegistry<E>>,
}

impl<E: Message> Clone for Broadcaster<E> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<E: Message> Broadcaster<E> {
    pub fn new(registry: Arc<EventRegistry<E>>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &EventRegistry<E> {
        &self.registry
    }

    /// Invoke every handler for the event's kind.
    ///
    /// Zero registered handlers is a successful no-op.
    pub async fn broadcast(
        &self,
        envelope: &Envelope<E>,
        cx: &HandlerContext,
    ) -> Result<(), AggregatedHandlerError> {
        let kind = envelope.kind();
        let handlers = self.registry.resolve_all(kind);
        if handlers.is_empty() {
            tracing::trace!(kind = kind.as_str(), "no event handlers registered");
            return Ok(());
        }

        let span = telemetry::broadcast_span(kind.as_str(), handlers.len());
        async {
            let mut failures = Vec::new();

            for handler in handlers {
                let outcome = AssertUnwindSafe(handler.handle(&envelope.message, cx))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(HandlerError::from_panic(panic)));

                if let Err(error) = outcome {
                    let name = handler.name();
                    tracing::debug!(handler = name, "event handler failed: {error}");
                    failures.extend(error.flatten().into_iter().map(|error| HandlerFailure {
                        handler: name.to_string(),
                        error,
                    }));
                }
            }

            if failures.is_empty() {
                Ok(())
            } else {
                Err(AggregatedHandlerError {
                    attempted: handlers.len(),
                    failures,
                })
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{CorrelationId, EnvelopeMeta, MessageCategory, MessageId};
    use crate::readiness::Readiness;
    use crate::shutdown::ShutdownToken;
    use crate::handler::EventHandler;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::fmt;

    #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
    enum GuildKind {
        MemberJoined,
        MemberLeft,
    }

    impl MessageKind for GuildKind {
        fn all() -> &'static [Self] {
            &[GuildKind::MemberJoined, GuildKind::MemberLeft]
        }

        fn as_str(&self) -> &'static str {
            match self {
                GuildKind::MemberJoined => "member_joined",
                GuildKind::MemberLeft => "member_left",
            }
        }
    }

    impl fmt::Display for GuildKind {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    struct GuildEvent(GuildKind);

    impl Message for GuildEvent {
        type Kind = GuildKind;

        fn kind(&self) -> GuildKind {
            self.0
        }
    }

    enum Behaviour {
        Succeed,
        Fail(&'static str),
        FailTwice,
        Panic,
    }

    struct Probe {
        name: &'static str,
        behaviour: Behaviour,
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl EventHandler<GuildEvent> for Probe {
        fn name(&self) -> &str {
            self.name
        }

        async fn handle(&self, _event: &GuildEvent, _cx: &HandlerContext) -> Result<(), HandlerError> {
            self.calls.lock().push(self.name);
            match self.behaviour {
                Behaviour::Succeed => Ok(()),
                Behaviour::Fail(text) => Err(HandlerError::validation(text)),
                Behaviour::FailTwice => Err(HandlerError::Aggregate(vec![
                    HandlerError::validation("first"),
                    HandlerError::validation("second"),
                ])),
                Behaviour::Panic => panic!("probe exploded"),
            }
        }
    }

    fn context() -> HandlerContext {
        let meta = EnvelopeMeta {
            id: MessageId::new(),
            correlation_id: CorrelationId::new(),
            category: MessageCategory::Event,
            kind: "member_joined",
        };
        HandlerContext::new(meta, None, ShutdownToken::new(), Readiness::ready())
    }

    fn broadcaster(probes: Vec<Probe>) -> Broadcaster<GuildEvent> {
        let builder = probes.into_iter().fold(
            EventRegistry::<GuildEvent>::builder(MessageCategory::Event),
            |builder, probe| builder.register(GuildKind::MemberJoined, Arc::new(probe)),
        );
        Broadcaster::new(Arc::new(builder.build().unwrap()))
    }

    fn probe(name: &'static str, behaviour: Behaviour, calls: &Arc<Mutex<Vec<&'static str>>>) -> Probe {
        Probe {
            name,
            behaviour,
            calls: Arc::clone(calls),
        }
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_later_handlers() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let broadcaster = broadcaster(vec![
            probe("h1", Behaviour::Fail("e1"), &calls),
            probe("h2", Behaviour::Succeed, &calls),
            probe("h3", Behaviour::Fail("e3"), &calls),
        ]);
        let envelope = Envelope::new(MessageCategory::Event, GuildEvent(GuildKind::MemberJoined));

        let err = broadcaster.broadcast(&envelope, &context()).await.unwrap_err();

        assert_eq!(*calls.lock(), vec!["h1", "h2", "h3"]);
        assert_eq!(err.attempted, 3);
        assert_eq!(err.failed_handlers(), vec!["h1", "h3"]);
        let texts: Vec<_> = err.errors().map(ToString::to_string).collect();
        assert_eq!(texts, vec!["e1", "e3"]);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_isolated() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let broadcaster = broadcaster(vec![
            probe("boom", Behaviour::Panic, &calls),
            probe("after", Behaviour::Succeed, &calls),
        ]);
        let envelope = Envelope::new(MessageCategory::Event, GuildEvent(GuildKind::MemberJoined));

        let err = broadcaster.broadcast(&envelope, &context()).await.unwrap_err();

        assert_eq!(*calls.lock(), vec!["boom", "after"]);
        assert_eq!(err.failures.len(), 1);
        assert_eq!(err.failures[0].error.kind_label(), "panicked");
    }

    #[tokio::test]
    async fn test_nested_aggregates_are_flattened() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let broadcaster = broadcaster(vec![probe("multi", Behaviour::FailTwice, &calls)]);
        let envelope = Envelope::new(MessageCategory::Event, GuildEvent(GuildKind::MemberJoined));

        let err = broadcaster.broadcast(&envelope, &context()).await.unwrap_err();

        assert_eq!(err.attempted, 1);
        assert_eq!(err.failed_handlers(), vec!["multi", "multi"]);
    }

    #[tokio::test]
    async fn test_no_handlers_is_a_no_op() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let broadcaster = broadcaster(vec![probe("joined_only", Behaviour::Succeed, &calls)]);
        let envelope = Envelope::new(MessageCategory::Event, GuildEvent(GuildKind::MemberLeft));

        assert!(broadcaster.broadcast(&envelope, &context()).await.is_ok());
        assert!(calls.lock().is_empty());
    }
}
