//! Herald - asynchronous message dispatch for chat platform integrations.
//!
//! Externally triggered actions (user commands, gateway events) are accepted
//! without blocking the caller, buffered per category and routed to exactly
//! the right handler(s). Handler failures are translated, reported and
//! isolated so one broken handler never suppresses unrelated work.
//!
//! # Core Concepts
//!
//! - **Message**: a user-defined type implementing [`Message`], tagged with a
//!   closed [`MessageKind`] discriminant. Requests additionally implement
//!   [`RequestMessage`] and carry a response type.
//!
//! - **Queue**: [`MessageQueue`] is an in-memory FIFO buffer for one
//!   category. Producers are never blocked; a bounded queue reports
//!   [`QueueError::Full`] instead.
//!
//! - **Registry**: [`HandlerRegistry`] maps each kind to exactly one handler
//!   (commands, requests) or to an ordered list (events). Missing
//!   registrations are rejected at build time.
//!
//! - **Worker**: [`Worker`] consumes one queue, either serially (ordered) or
//!   in parallel (unordered, optionally bounded).
//!
//! - **Error translation**: [`ErrorTranslator`] turns command and request
//!   failures into a user-facing reply plus an [`ErrorReport`].
//!
//! - **Broadcast**: [`Broadcaster`] runs every event handler regardless of
//!   earlier failures and aggregates what went wrong.
//!
//! - **Bulk retry**: [`execute_with_retry`] applies a fallible mutation to
//!   many targets with linear backoff and progress notifications.
//!
//! - **Pipeline**: [`Pipeline`] wires the four queues, their workers and the
//!   shared services together.
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use herald::*;
//!
//! let pipeline = Pipeline::builder()
//!     .with_commands(Arc::new(commands))
//!     .with_parallel_commands(Arc::new(parallel))
//!     .with_requests(Arc::new(requests))
//!     .with_events(Arc::new(events))
//!     .with_reporter(Arc::new(TracingReporter))
//!     .build()?;
//! pipeline.start().await?;
//! pipeline.enqueue_command(MyCommand::Ban { user }, Some(reply))?;
//! ```

/// Buffered, periodically flushed sinks for high-volume side effects.
pub mod batch;

/// Fan-out of one event to every registered handler.
pub mod broadcaster;

/// Configuration structures for the pipeline, its queues and batch buffers.
///
/// The `config` module defines [`PipelineConfig`], [`QueueConfig`] and
/// [`BatchConfig`]. Every field has a serde default.
pub mod config;

/// The seam between workers and handler invocation.
///
/// The `dispatch` module provides the [`Dispatch`] trait and the three
/// dispatchers:
/// - [`CommandDispatcher`] - one handler, through the error translator
/// - [`RequestDispatcher`] - one handler, response sent back to the caller
/// - [`EventDispatcher`] - every handler, through the broadcaster
pub mod dispatch;

/// Error taxonomy: handler, configuration, queue and dispatch errors.
pub mod error;

/// Handler traits and the context passed to every handler.
pub mod handler;

/// Lifecycle events for observers of the pipeline.
///
/// The `lifecycle` module provides [`LifecycleBus`], an in-process
/// broadcast of [`LifecycleEvent`]s that never blocks publishers.
pub mod lifecycle;

/// Core message definitions and traits.
///
/// The `message` module defines:
/// - [`Message`] and [`RequestMessage`] - traits for payload types
/// - [`MessageKind`] - closed discriminant set per message type
/// - [`MessageCategory`] - which queue a message belongs to
/// - [`Envelope`] - a message plus its identifiers and reply context
/// - [`MessageId`] and [`CorrelationId`] - unique identifiers
pub mod message;

#[cfg(feature = "metrics")]
/// Prometheus metrics.
///
/// Enabled with the `metrics` feature. All collectors live in a dedicated
/// registry; see [`metrics::gather_metrics`].
pub mod metrics;

/// Error translation for command and request handlers.
pub mod middleware;

/// The assembled four-queue pipeline and its builder.
pub mod pipeline;

/// In-memory FIFO queues and snapshotting.
pub mod queue;

/// Platform readiness signal.
pub mod readiness;

/// Structured error reports and the sinks that receive them.
pub mod reporting;

/// Bulk retry-with-backoff over many targets.
pub mod retry;

/// Handler registries and lookup.
pub mod router;

/// Graceful shutdown signalling.
pub mod shutdown;

/// Tracing spans and metric recording helpers.
pub mod telemetry;

/// Worker loops that drain one queue each.
///
/// The `worker` module provides [`Worker`], configured by [`WorkerConfig`]
/// to run serially or in parallel, and the [`WorkerSummary`] it returns.
pub mod worker;

pub use batch::*;
pub use broadcaster::*;
pub use config::*;
pub use dispatch::*;
pub use error::*;
pub use handler::*;
pub use lifecycle::*;
pub use message::*;
pub use middleware::*;
pub use pipeline::*;
pub use queue::*;
pub use readiness::*;
pub use reporting::*;
pub use retry::*;
pub use router::*;
pub use shutdown::*;
pub use worker::*;
