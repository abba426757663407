//! Out-of-band error reporting.
//!
//! Every handler failure is forwarded to an [`ErrorReporter`] in addition to
//! the structured log. What the reporter does with it (post to an operations
//! channel, page someone) is up to the platform layer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{AggregatedHandlerError, HandlerError};
use crate::message::{CorrelationId, EnvelopeMeta, MessageCategory, MessageId};

/// Where in the pipeline a reported failure originated.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportOrigin {
    /// A command or request handler failed.
    Handler,
    /// One or more event handlers failed during a broadcast.
    Broadcast,
    /// No handler was registered for a dispatched message.
    Configuration,
    /// A batch sink failed to flush.
    Batch,
    /// A spawned dispatch task ended abnormally.
    Worker,
}

/// Summary of a failure, suitable for an operations log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorReport {
    pub origin: ReportOrigin,
    pub category: Option<MessageCategory>,
    pub kind: Option<String>,
    pub message_id: Option<MessageId>,
    pub correlation_id: Option<CorrelationId>,
    /// Taxonomy label, e.g. `validation` or `transient`.
    pub error_kind: String,
    /// One-line description.
    pub summary: String,
    /// Full error chain.
    pub detail: String,
    pub occurred_at: DateTime<Utc>,
}

impl ErrorReport {
    pub fn new(
        origin: ReportOrigin,
        error_kind: impl Into<String>,
        summary: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            origin,
            category: None,
            kind: None,
            message_id: None,
            correlation_id: None,
            error_kind: error_kind.into(),
            summary: summary.into(),
            detail: detail.into(),
            occurred_at: Utc::now(),
        }
    }

    /// Report for a failed command or request handler.
    pub fn handler_failure(meta: &EnvelopeMeta, error: &HandlerError) -> Self {
        Self::new(
            ReportOrigin::Handler,
            error.kind_label(),
            format!("{} `{}` handler failed", meta.category, meta.kind),
            format!("{error:?}"),
        )
        .with_meta(meta)
    }

    /// Report for an event broadcast with failing handlers.
    pub fn broadcast_failure(meta: &EnvelopeMeta, error: &AggregatedHandlerError) -> Self {
        Self::new(
            ReportOrigin::Broadcast,
            "aggregate",
            format!(
                "{} of {} handlers failed for event `{}`",
                error.failures.len(),
                error.attempted,
                meta.kind
            ),
            error.to_string(),
        )
        .with_meta(meta)
    }

    pub fn with_meta(mut self, meta: &EnvelopeMeta) -> Self {
        self.category = Some(meta.category);
        self.kind = Some(meta.kind.to_string());
        self.message_id = Some(meta.id);
        self.correlation_id = Some(meta.correlation_id);
        self
    }
}

/// External error-reporting sink.
#[async_trait]
pub trait ErrorReporter: Send + Sync {
    async fn report(&self, report: &ErrorReport) -> anyhow::Result<()>;
}

/// Forward a report, logging rather than propagating a reporter failure.
pub async fn submit(reporter: &dyn ErrorReporter, report: ErrorReport) {
    if let Err(err) = reporter.report(&report).await {
        tracing::warn!(
            origin = ?report.origin,
            summary = %report.summary,
            "error reporter failed: {err:#}"
        );
    }
}

/// Reporter that only writes the report to the structured log.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingReporter;

#[async_trait]
impl ErrorReporter for TracingReporter {
    async fn report(&self, report: &ErrorReport) -> anyhow::Result<()> {
        tracing::error!(
            origin = ?report.origin,
            category = ?report.category,
            kind = report.kind.as_deref().unwrap_or("-"),
            message_id = ?report.message_id,
            error_kind = %report.error_kind,
            detail = %report.detail,
            "{}",
            report.summary
        );
        Ok(())
    }
}

/// Reporter that hands reports to a consumer task over a channel.
#[derive(Clone, Debug)]
pub struct ChannelReporter {
    sender: mpsc::UnboundedSender<ErrorReport>,
}

impl ChannelReporter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ErrorReport>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl ErrorReporter for ChannelReporter {
    async fn report(&self, report: &ErrorReport) -> anyhow::Result<()> {
        self.sender
            .send(report.clone())
            .map_err(|_| anyhow::anyhow!("error report channel closed"))
    }
}
