use std::fmt;

use thiserror::Error;

use crate::message::MessageCategory;

/// User-facing text for every failure that is not a validation problem.
pub const GENERIC_USER_MESSAGE: &str =
    "Something went wrong while handling that. The error has been reported.";

/// Error returned by a single handler invocation.
///
/// The variant decides how the failure is treated at the pipeline
/// boundaries: validation problems are shown to the user verbatim, transient
/// failures are eligible for retry, everything else is reported and surfaced
/// only as a generic message.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Caller or input problem. Surfaced verbatim, never retried.
    #[error("{0}")]
    Validation(String),

    /// A downstream call failed in a way that may succeed on retry.
    #[error("transient failure: {0:#}")]
    Transient(#[source] anyhow::Error),

    /// Anything else.
    #[error("unhandled failure: {0:#}")]
    Unhandled(#[source] anyhow::Error),

    /// Several failures raised together by one handler.
    #[error("{} errors: {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<HandlerError>),

    /// The handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    /// Build a validation error from a displayable message.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Wrap a downstream failure as transient.
    pub fn transient(error: impl Into<anyhow::Error>) -> Self {
        Self::Transient(error.into())
    }

    /// Wrap an arbitrary failure.
    pub fn unhandled(error: impl Into<anyhow::Error>) -> Self {
        Self::Unhandled(error.into())
    }

    /// Whether a retry could plausibly change the outcome.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transient(_) => true,
            Self::Unhandled(_) => true,
            Self::Aggregate(errors) => errors.iter().any(Self::is_retryable),
            Self::Validation(_) | Self::Panicked(_) => false,
        }
    }

    /// Concise, non-leaking text suitable for the originator of a message.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(message) => message.clone(),
            _ => GENERIC_USER_MESSAGE.to_string(),
        }
    }

    /// Short label used in logs, reports and metrics.
    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Transient(_) => "transient",
            Self::Unhandled(_) => "unhandled",
            Self::Aggregate(_) => "aggregate",
            Self::Panicked(_) => "panicked",
        }
    }

    /// Expand nested aggregates into a flat list of leaf errors.
    pub fn flatten(self) -> Vec<HandlerError> {
        match self {
            Self::Aggregate(errors) => {
                errors.into_iter().flat_map(Self::flatten).collect()
            }
            other => vec![other],
        }
    }

    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(text) = payload.downcast_ref::<&str>() {
            (*text).to_string()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::Panicked(message)
    }
}

fn join_errors(errors: &[HandlerError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Bootstrap defect: the registry does not match the message set.
///
/// This never indicates a runtime condition worth recovering from. It is
/// raised by registry validation at startup and, for registries built with
/// `build_partial`, when a message is dispatched.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerConfigurationError {
    /// Kinds with exactly-one-handler semantics that have no handler.
    #[error("no {category} handler registered for: {}", .kinds.join(", "))]
    Missing {
        category: MessageCategory,
        kinds: Vec<String>,
    },

    /// A message reached dispatch with no handler for its kind.
    #[error("no {category} handler registered for message kind `{kind}`")]
    Unregistered {
        category: MessageCategory,
        kind: String,
    },

    /// Two handlers were registered for an exactly-one-handler kind.
    #[error("duplicate {category} handler registered for message kind `{kind}`")]
    Duplicate {
        category: MessageCategory,
        kind: String,
    },
}

/// One handler's failure while broadcasting an event.
#[derive(Debug)]
pub struct HandlerFailure {
    /// Name of the handler that failed.
    pub handler: String,
    /// The flattened leaf error.
    pub error: HandlerError,
}

impl fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.handler, self.error)
    }
}

/// Every handler failure collected while broadcasting one event.
///
/// Only constructed when at least one handler failed; by the time the caller
/// sees it, every registered handler has already run.
#[derive(Debug, Error)]
#[error("{} of {attempted} event handlers failed: {}", .failures.len(), join_failures(.failures))]
pub struct AggregatedHandlerError {
    /// Number of handlers that were invoked.
    pub attempted: usize,
    /// Failures in invocation order.
    pub failures: Vec<HandlerFailure>,
}

impl AggregatedHandlerError {
    /// Names of the handlers that failed, in invocation order.
    pub fn failed_handlers(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.handler.as_str()).collect()
    }

    /// Iterate the leaf errors.
    pub fn errors(&self) -> impl Iterator<Item = &HandlerError> {
        self.failures.iter().map(|f| &f.error)
    }
}

fn join_failures(failures: &[HandlerFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failure to place an item on a queue.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The queue was closed; no further items are accepted.
    #[error("queue is closed")]
    Closed,

    /// An explicitly bounded queue is at capacity.
    #[error("queue is full (capacity {capacity})")]
    Full { capacity: usize },
}

/// Top-level error surfaced to producers of the pipeline.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Configuration(#[from] HandlerConfigurationError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    /// The handler failed; carries only the user-safe text.
    #[error("request failed: {message}")]
    Handler { message: String },

    /// The request was dropped before a response was produced.
    #[error("request was cancelled before it completed")]
    Cancelled,
}
