//! Prometheus metrics for herald.
//!
//! Compiled only with the `metrics` feature.
//!
//! # Metrics
//!
//! ## Counters
//! - `herald_messages_enqueued_total` - Messages accepted by a queue
//! - `herald_messages_dispatched_total` - Messages taken off a queue and dispatched
//! - `herald_retry_attempts_total` - Attempts made by the bulk retry helper
//!
//! ## Gauges
//! - `herald_queue_depth` - Items waiting in each queue
//!
//! ## Histograms
//! - `herald_handler_duration_seconds` - Time spent dispatching one message
#![cfg(feature = "metrics")]

use prometheus::{exponential_buckets, CounterVec, GaugeVec, HistogramVec, Opts, Registry};
use std::sync::LazyLock;

/// Global Prometheus registry for herald metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels: `category`, `kind`.
pub static MESSAGES_ENQUEUED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("herald_messages_enqueued_total", "Messages accepted by a queue");
    CounterVec::new(opts, &["category", "kind"])
        .expect("herald_messages_enqueued_total metric creation failed")
});

/// Labels: `category`, `kind`, `outcome` (handled, failed, partially_failed,
/// misconfigured).
pub static MESSAGES_DISPATCHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("herald_messages_dispatched_total", "Messages dispatched to handlers");
    CounterVec::new(opts, &["category", "kind", "outcome"])
        .expect("herald_messages_dispatched_total metric creation failed")
});

/// Labels: `operation`, `outcome` (success, failure).
pub static RETRY_ATTEMPTS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("herald_retry_attempts_total", "Attempts made by bulk retry operations");
    CounterVec::new(opts, &["operation", "outcome"])
        .expect("herald_retry_attempts_total metric creation failed")
});

/// Labels: `queue`.
pub static QUEUE_DEPTH: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new("herald_queue_depth", "Items waiting in each queue");
    GaugeVec::new(opts, &["queue"]).expect("herald_queue_depth metric creation failed")
});

/// Labels: `category`, `kind`, `outcome`.
pub static HANDLER_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.0005, 2.0, 16).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "herald_handler_duration_seconds",
        "Time spent dispatching one message",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["category", "kind", "outcome"])
        .expect("herald_handler_duration_seconds metric creation failed")
});

/// Register every metric with [`REGISTRY`]. Safe to call more than once.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(MESSAGES_ENQUEUED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(MESSAGES_DISPATCHED_TOTAL.clone()),
        Box::new(RETRY_ATTEMPTS_TOTAL.clone()),
        Box::new(QUEUE_DEPTH.clone()),
        Box::new(HANDLER_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            if !matches!(e, prometheus::Error::AlreadyReg) {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_enqueued(category: &str, kind: &str) {
    MESSAGES_ENQUEUED_TOTAL.with_label_values(&[category, kind]).inc();
}

pub fn record_dispatched(category: &str, kind: &str, outcome: &str) {
    MESSAGES_DISPATCHED_TOTAL
        .with_label_values(&[category, kind, outcome])
        .inc();
}

pub fn record_retry_attempt(operation: &str, outcome: &str) {
    RETRY_ATTEMPTS_TOTAL.with_label_values(&[operation, outcome]).inc();
}

pub fn set_queue_depth(queue: &str, depth: f64) {
    QUEUE_DEPTH.with_label_values(&[queue]).set(depth);
}

pub fn observe_handler_duration(category: &str, kind: &str, outcome: &str, duration_secs: f64) {
    HANDLER_DURATION_SECONDS
        .with_label_values(&[category, kind, outcome])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
