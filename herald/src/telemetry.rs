//! Tracing and telemetry instrumentation for herald.
//!
//! Span constructors and `record_*` helpers used across the pipeline. Each
//! helper writes a structured log line and, with the `metrics` feature
//! enabled, updates the matching Prometheus series. Without the feature the
//! metric half compiles away.
//!
//! # Example
//!
//! ```ignore
//! use herald::telemetry::{dispatch_span, record_dispatch_start, record_dispatch_end};
//!
//! let span = dispatch_span(&envelope.meta());
//! let timer = record_dispatch_start();
//! // ... handler runs inside the span
//! record_dispatch_end(timer, &envelope.meta(), DispatchOutcome::Handled);
//! ```

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::{info_span, Instrument, Span};

use crate::message::{EnvelopeMeta, MessageCategory};

/// Outcome label attached to dispatch logs and metrics.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DispatchOutcome {
    Handled,
    Failed,
    PartiallyFailed,
    Misconfigured,
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchOutcome::Handled => "handled",
            DispatchOutcome::Failed => "failed",
            DispatchOutcome::PartiallyFailed => "partially_failed",
            DispatchOutcome::Misconfigured => "misconfigured",
        }
    }
}

/// Span covering one message's trip through its dispatcher.
#[must_use]
pub fn dispatch_span(meta: &EnvelopeMeta) -> Span {
    info_span!(
        "herald.dispatch",
        message_id = %meta.id,
        correlation_id = %meta.correlation_id,
        category = %meta.category,
        kind = meta.kind,
    )
}

/// Span covering an enqueue call.
#[must_use]
pub fn enqueue_span(category: MessageCategory, kind: &str) -> Span {
    info_span!("herald.enqueue", category = %category, kind = %kind)
}

/// Span covering the fan-out of one event to its handlers.
#[must_use]
pub fn broadcast_span(kind: &str, handlers: usize) -> Span {
    info_span!("herald.broadcast", kind = %kind, handlers = handlers)
}

/// Span covering a whole bulk retry run.
#[must_use]
pub fn bulk_retry_span(operation: &str, targets: usize) -> Span {
    info_span!("herald.bulk_retry", operation = %operation, targets = targets)
}

/// Attach a dispatch span to any future.
pub fn instrument_dispatch<F>(meta: &EnvelopeMeta, future: F) -> impl Future<Output = F::Output>
where
    F: Future,
{
    future.instrument(dispatch_span(meta))
}

pub fn record_enqueued(category: MessageCategory, kind: &str) {
    tracing::debug!(category = %category, kind = %kind, "message enqueued");

    #[cfg(feature = "metrics")]
    crate::metrics::record_enqueued(category.as_str(), kind);
}

/// Record a message whose kind had no usable handler registration.
pub fn record_misconfigured(meta: &EnvelopeMeta) {
    #[cfg(feature = "metrics")]
    crate::metrics::record_dispatched(
        meta.category.as_str(),
        meta.kind,
        DispatchOutcome::Misconfigured.as_str(),
    );
    #[cfg(not(feature = "metrics"))]
    let _ = meta;
}

pub fn set_queue_depth(queue: &str, depth: usize) {
    tracing::trace!(queue = %queue, depth, "queue depth sampled");

    #[cfg(feature = "metrics")]
    crate::metrics::set_queue_depth(queue, depth as f64);
}

/// Count one attempt made by the bulk retry helper.
pub fn record_retry_attempt(operation: &str, succeeded: bool) {
    #[cfg(feature = "metrics")]
    crate::metrics::record_retry_attempt(operation, if succeeded { "success" } else { "failure" });
    #[cfg(not(feature = "metrics"))]
    let _ = (operation, succeeded);
}

/// Start timing a dispatch. Pass the handle to [`record_dispatch_end`].
pub fn record_dispatch_start() -> DispatchTimer {
    DispatchTimer {
        start: Instant::now(),
    }
}

pub fn record_dispatch_end(timer: DispatchTimer, meta: &EnvelopeMeta, outcome: DispatchOutcome) {
    let duration = timer.elapsed();
    tracing::debug!(
        message_id = %meta.id,
        category = %meta.category,
        kind = meta.kind,
        outcome = outcome.as_str(),
        duration_ms = duration.as_millis() as u64,
        "message dispatched"
    );

    #[cfg(feature = "metrics")]
    {
        crate::metrics::record_dispatched(meta.category.as_str(), meta.kind, outcome.as_str());
        crate::metrics::observe_handler_duration(
            meta.category.as_str(),
            meta.kind,
            outcome.as_str(),
            duration.as_secs_f64(),
        );
    }
}

/// Opaque timing handle returned by [`record_dispatch_start`].
#[derive(Debug)]
pub struct DispatchTimer {
    start: Instant,
}

impl DispatchTimer {
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{CorrelationId, MessageId};

    fn meta() -> EnvelopeMeta {
        EnvelopeMeta {
            id: MessageId::new(),
            correlation_id: CorrelationId::new(),
            category: MessageCategory::Event,
            kind: "member_joined",
        }
    }

    // Spans are disabled without a subscriber, so install one for the
    // metadata assertions below.
    fn with_subscriber(f: impl FnOnce()) {
        let subscriber = tracing_subscriber::fmt().with_test_writer().finish();
        tracing::subscriber::with_default(subscriber, f);
    }

    #[test]
    fn test_span_names() {
        with_subscriber(|| {
            assert_eq!(dispatch_span(&meta()).metadata().unwrap().name(), "herald.dispatch");
            assert_eq!(
                enqueue_span(MessageCategory::Command, "define").metadata().unwrap().name(),
                "herald.enqueue"
            );
            assert_eq!(broadcast_span("member_joined", 3).metadata().unwrap().name(), "herald.broadcast");
            assert_eq!(bulk_retry_span("assign_role", 10).metadata().unwrap().name(), "herald.bulk_retry");
        });
    }

    #[test]
    fn test_dispatch_timer() {
        let timer = record_dispatch_start();
        std::thread::sleep(Duration::from_millis(1));
        assert!(timer.elapsed() > Duration::ZERO);

        // Must not panic with or without the metrics feature.
        record_dispatch_end(timer, &meta(), DispatchOutcome::PartiallyFailed);
        record_enqueued(MessageCategory::Event, "member_joined");
        record_misconfigured(&meta());
        record_retry_attempt("assign_role", false);
        set_queue_depth("events", 4);
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(DispatchOutcome::Handled.as_str(), "handled");
        assert_eq!(DispatchOutcome::PartiallyFailed.as_str(), "partially_failed");
    }
}
