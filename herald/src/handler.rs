use std::sync::Arc;

use async_trait::async_trait;

use crate::error::HandlerError;
use crate::message::{EnvelopeMeta, Message, ReplyContext, RequestMessage};
use crate::readiness::Readiness;
use crate::shutdown::ShutdownToken;

/// Everything a handler may use besides the message itself.
#[derive(Clone)]
pub struct HandlerContext {
    meta: EnvelopeMeta,
    reply: Option<Arc<dyn ReplyContext>>,
    shutdown: ShutdownToken,
    readiness: Readiness,
}

impl HandlerContext {
    pub fn new(
        meta: EnvelopeMeta,
        reply: Option<Arc<dyn ReplyContext>>,
        shutdown: ShutdownToken,
        readiness: Readiness,
    ) -> Self {
        Self {
            meta,
            reply,
            shutdown,
            readiness,
        }
    }

    pub fn meta(&self) -> &EnvelopeMeta {
        &self.meta
    }

    pub fn reply_context(&self) -> Option<&Arc<dyn ReplyContext>> {
        self.reply.as_ref()
    }

    /// Reply to the originator, if the message carries a way to do so.
    ///
    /// Returns `Ok(false)` when there is nobody to reply to.
    pub async fn reply(&self, text: &str) -> anyhow::Result<bool> {
        match &self.reply {
            Some(reply) => {
                reply.reply(text).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Shared cancellation signal; long-running handlers should observe it.
    pub fn shutdown(&self) -> &ShutdownToken {
        &self.shutdown
    }

    pub fn readiness(&self) -> &Readiness {
        &self.readiness
    }
}

/// Handles one kind of command. Exactly one is registered per kind.
#[async_trait]
pub trait CommandHandler<M: Message>: Send + Sync {
    async fn handle(&self, message: &M, cx: &HandlerContext) -> Result<(), HandlerError>;
}

/// Handles one kind of request and produces its response.
#[async_trait]
pub trait RequestHandler<M: RequestMessage>: Send + Sync {
    async fn handle(&self, message: &M, cx: &HandlerContext) -> Result<M::Response, HandlerError>;
}

/// Reacts to an event. Any number may be registered per kind.
#[async_trait]
pub trait EventHandler<E: Message>: Send + Sync {
    /// Name used in logs and aggregated failures.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn handle(&self, event: &E, cx: &HandlerContext) -> Result<(), HandlerError>;
}
