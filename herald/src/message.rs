use std::fmt::{self, Debug, Display};
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Delivery discipline a message is enqueued under.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageCategory {
    /// Exactly one handler, dispatched serially.
    Command,
    /// Exactly one handler, dispatched concurrently.
    ParallelCommand,
    /// Exactly one handler, produces a response.
    Request,
    /// Zero or more handlers.
    Event,
}

impl MessageCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageCategory::Command => "command",
            MessageCategory::ParallelCommand => "parallel_command",
            MessageCategory::Request => "request",
            MessageCategory::Event => "event",
        }
    }

    /// Whether the category requires exactly one registered handler per kind.
    pub fn requires_single_handler(&self) -> bool {
        !matches!(self, MessageCategory::Event)
    }
}

impl Display for MessageCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of discriminants for a message type.
///
/// `all` must list every variant; registry validation at startup relies on
/// it to prove every kind has a handler.
pub trait MessageKind:
    Copy + Eq + Hash + Debug + Display + Send + Sync + 'static
{
    fn all() -> &'static [Self];
    fn as_str(&self) -> &'static str;
}

pub trait Message: Send + Sync + 'static {
    type Kind: MessageKind;

    fn kind(&self) -> Self::Kind;
}

/// A message whose handler produces a value for the caller.
pub trait RequestMessage: Message {
    type Response: Send + 'static;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ties together every log line and report caused by one external action.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub Uuid);

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl From<Uuid> for CorrelationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Capability to answer whoever issued a command or request.
///
/// Implemented by the platform layer (for example a chat interaction).
#[async_trait]
pub trait ReplyContext: Send + Sync {
    async fn reply(&self, text: &str) -> anyhow::Result<()>;
}

/// A message plus the metadata the pipeline tracks for it.
///
/// The envelope is owned by its queue until dequeued and then by the worker
/// handling it; nothing else keeps a reference.
pub struct Envelope<M> {
    pub id: MessageId,
    pub correlation_id: CorrelationId,
    pub category: MessageCategory,
    pub enqueued_at: DateTime<Utc>,
    pub message: M,
    reply: Option<Arc<dyn ReplyContext>>,
}

impl<M: Message> Envelope<M> {
    pub fn new(category: MessageCategory, message: M) -> Self {
        Self {
            id: MessageId::new(),
            correlation_id: CorrelationId::new(),
            category,
            enqueued_at: Utc::now(),
            message,
            reply: None,
        }
    }

    pub fn with_reply(mut self, reply: Arc<dyn ReplyContext>) -> Self {
        self.reply = Some(reply);
        self
    }

    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn kind(&self) -> M::Kind {
        self.message.kind()
    }

    pub fn reply_context(&self) -> Option<&Arc<dyn ReplyContext>> {
        self.reply.as_ref()
    }

    /// Metadata only, for logs and reports.
    pub fn meta(&self) -> EnvelopeMeta {
        EnvelopeMeta {
            id: self.id,
            correlation_id: self.correlation_id,
            category: self.category,
            kind: self.message.kind().as_str(),
        }
    }
}

impl<M: Message> Debug for Envelope<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("id", &self.id)
            .field("correlation_id", &self.correlation_id)
            .field("category", &self.category)
            .field("kind", &self.message.kind())
            .field("enqueued_at", &self.enqueued_at)
            .field("has_reply", &self.reply.is_some())
            .finish()
    }
}

/// Copyable description of an envelope.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct EnvelopeMeta {
    pub id: MessageId,
    pub correlation_id: CorrelationId,
    pub category: MessageCategory,
    pub kind: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
    enum PingKind {
        Ping,
    }

    impl MessageKind for PingKind {
        fn all() -> &'static [Self] {
            &[PingKind::Ping]
        }

        fn as_str(&self) -> &'static str {
            "ping"
        }
    }

    impl Display for PingKind {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    struct Ping;

    impl Message for Ping {
        type Kind = PingKind;

        fn kind(&self) -> PingKind {
            PingKind::Ping
        }
    }

    #[test]
    fn test_category_serializes_snake_case() {
        let json = serde_json::to_string(&MessageCategory::ParallelCommand).unwrap();
        assert_eq!(json, "\"parallel_command\"");
        assert_eq!(MessageCategory::ParallelCommand.to_string(), "parallel_command");
    }

    #[test]
    fn test_only_events_allow_many_handlers() {
        assert!(MessageCategory::Command.requires_single_handler());
        assert!(MessageCategory::ParallelCommand.requires_single_handler());
        assert!(MessageCategory::Request.requires_single_handler());
        assert!(!MessageCategory::Event.requires_single_handler());
    }

    #[test]
    fn test_message_ids_are_unique() {
        let first = MessageId::new();
        let second = MessageId::new();
        assert_ne!(first, second);
        assert_eq!(first.0.get_version_num(), 7);
    }

    #[test]
    fn test_envelope_meta() {
        let correlation = CorrelationId::new();
        let envelope =
            Envelope::new(MessageCategory::Command, Ping).with_correlation(correlation);
        let meta = envelope.meta();

        assert_eq!(meta.id, envelope.id);
        assert_eq!(meta.correlation_id, correlation);
        assert_eq!(meta.kind, "ping");
        assert!(envelope.reply_context().is_none());
        assert!(format!("{envelope:?}").contains("has_reply: false"));
    }
}
