use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;

use crate::error::HandlerError;
use crate::handler::HandlerContext;
use crate::reporting::{self, ErrorReport, ErrorReporter};

/// What is left of a handler failure once the middleware has dealt with it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TranslatedFailure {
    /// The text that was (or would have been) shown to the originator.
    pub user_message: String,
    pub error_kind: &'static str,
}

/// Error-translation boundary around exactly one command or request
/// handler invocation.
///
/// A failure (returned or panicked) is replied to the originator in
/// user-safe form when a reply context is present, logged, forwarded to the
/// error reporter, and then swallowed: the caller only learns that the
/// invocation failed, never the error itself.
#[derive(Clone)]
pub struct ErrorTranslator {
    reporter: Arc<dyn ErrorReporter>,
}

impl ErrorTranslator {
    pub fn new(reporter: Arc<dyn ErrorReporter>) -> Self {
        Self { reporter }
    }

    pub async fn invoke<T, F>(&self, cx: &HandlerContext, future: F) -> Result<T, TranslatedFailure>
    where
        F: Future<Output = Result<T, HandlerError>>,
    {
        let outcome = AssertUnwindSafe(future)
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(HandlerError::from_panic(panic)));

        match outcome {
            Ok(value) => Ok(value),
            Err(error) => Err(self.translate(cx, error).await),
        }
    }

    async fn translate(&self, cx: &HandlerContext, error: HandlerError) -> TranslatedFailure {
        let meta = cx.meta();
        let user_message = error.user_message();
        let error_kind = error.kind_label();

        match &error {
            HandlerError::Validation(_) => tracing::warn!(
                message_id = %meta.id,
                correlation_id = %meta.correlation_id,
                category = %meta.category,
                kind = meta.kind,
                error_kind,
                "handler rejected input: {error}"
            ),
            _ => tracing::error!(
                message_id = %meta.id,
                correlation_id = %meta.correlation_id,
                category = %meta.category,
                kind = meta.kind,
                error_kind,
                "handler failed: {error:?}"
            ),
        }

        match cx.reply(&user_message).await {
            Ok(_) => {}
            Err(reply_err) => tracing::warn!(
                message_id = %meta.id,
                "failed to send error reply: {reply_err:#}"
            ),
        }

        reporting::submit(
            self.reporter.as_ref(),
            ErrorReport::handler_failure(meta, &error),
        )
        .await;

        TranslatedFailure {
            user_message,
            error_kind,
        }
    }
}
