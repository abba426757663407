//! Bulk retry-with-backoff.
//!
//! Applies one mutation to each of a list of targets (assign a role to every
//! member, award points to every participant) with a bounded number of
//! attempts per target, linearly increasing backoff between attempts, a
//! courtesy delay between targets, and threshold-based progress reporting.
//!
//! Failures never escape the per-target loop: the caller gets a
//! [`BulkOutcome`] with counts and per-target detail.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::error::HandlerError;
use crate::shutdown::ShutdownToken;
use crate::telemetry;

/// Configuration for [`execute_with_retry`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Label for logs and metrics.
    pub name: String,
    /// Attempts per target, including the first.
    pub max_attempts: u32,
    /// Backoff unit in milliseconds. The wait after attempt `n` fails is
    /// `base_delay_ms * n`.
    pub base_delay_ms: u64,
    /// Wait between targets in milliseconds, whatever the outcome.
    pub inter_item_delay_ms: u64,
    /// Report progress every this many percentage points. `None` disables
    /// threshold notifications; the final one is still sent.
    pub progress_granularity: Option<u8>,
}

impl RetryConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn inter_item_delay(&self) -> Duration {
        Duration::from_millis(self.inter_item_delay_ms)
    }

    /// Wait before the retry that follows failed attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay().saturating_mul(attempt)
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_delay(mut self, ms: u64) -> Self {
        self.base_delay_ms = ms;
        self
    }

    pub fn with_inter_item_delay(mut self, ms: u64) -> Self {
        self.inter_item_delay_ms = ms;
        self
    }

    pub fn with_progress_granularity(mut self, percent: Option<u8>) -> Self {
        self.progress_granularity = percent;
        self
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            name: "bulk".to_string(),
            max_attempts: 3,
            base_delay_ms: 1_000,
            inter_item_delay_ms: 0,
            progress_granularity: Some(10),
        }
    }
}

/// Where a target ended up.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    /// Not attempted because the run was cancelled first.
    Pending,
    Succeeded,
    Failed,
    /// Cancelled between attempts.
    Cancelled,
}

/// One target plus what happened to it during this run.
#[derive(Clone, Debug)]
pub struct RetryTarget<T> {
    pub item: T,
    pub attempts: u32,
    pub status: TargetStatus,
    /// Display text of the most recent failure, if any.
    pub last_error: Option<String>,
}

impl<T> RetryTarget<T> {
    fn new(item: T) -> Self {
        Self {
            item,
            attempts: 0,
            status: TargetStatus::Pending,
            last_error: None,
        }
    }
}

/// Result of a bulk run.
#[derive(Clone, Debug)]
pub struct BulkOutcome<T> {
    pub succeeded: usize,
    pub failed: usize,
    /// The run stopped early because shutdown was signalled.
    pub cancelled: bool,
    /// Every target, in input order.
    pub targets: Vec<RetryTarget<T>>,
}

impl<T> BulkOutcome<T> {
    pub fn all_succeeded(&self) -> bool {
        !self.cancelled && self.failed == 0
    }

    pub fn failed_targets(&self) -> impl Iterator<Item = &RetryTarget<T>> {
        self.targets
            .iter()
            .filter(|target| target.status == TargetStatus::Failed)
    }
}

/// A progress notification.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct Progress {
    /// Targets finished so far.
    pub completed: usize,
    pub total: usize,
    /// The threshold crossed, or 100 for the final notification.
    pub percent: u8,
    /// Set only on the completion notification, which follows the 100%
    /// threshold when granularity divides 100.
    pub is_final: bool,
}

/// Receives progress notifications from a bulk run.
pub trait ProgressSink: Send + Sync {
    fn notify(&self, progress: Progress);
}

impl ProgressSink for mpsc::UnboundedSender<Progress> {
    fn notify(&self, progress: Progress) {
        let _ = self.send(progress);
    }
}

struct ProgressTracker<'a> {
    sink: Option<&'a dyn ProgressSink>,
    granularity: u8,
    total: usize,
    last_threshold: u8,
}

impl<'a> ProgressTracker<'a> {
    fn new(sink: Option<&'a dyn ProgressSink>, granularity: Option<u8>, total: usize) -> Self {
        let granularity = granularity.map(|g| g.clamp(1, 100)).unwrap_or(0);
        Self {
            sink,
            granularity,
            total,
            last_threshold: 0,
        }
    }

    /// Emit one notification per threshold crossed since the last call.
    fn advance(&mut self, completed: usize) {
        let Some(sink) = self.sink else { return };
        if self.total == 0 || self.granularity == 0 {
            return;
        }
        let percent = (completed.saturating_mul(100) / self.total).min(100) as u8;
        let mut next = self.last_threshold + self.granularity;
        while next <= percent {
            sink.notify(Progress {
                completed,
                total: self.total,
                percent: next,
                is_final: false,
            });
            self.last_threshold = next;
            next = match next.checked_add(self.granularity) {
                Some(value) => value,
                None => break,
            };
        }
    }

    fn finish(&self, completed: usize) {
        if let Some(sink) = self.sink {
            sink.notify(Progress {
                completed,
                total: self.total,
                percent: 100,
                is_final: true,
            });
        }
    }
}

/// Apply `mutate` to every target with bounded retries.
///
/// Each target is attempted up to `max_attempts` times; after failed attempt
/// `n` the helper waits `base_delay * n`. Validation errors are not retried.
/// Between targets it waits `inter_item_delay`. Shutdown is observed between
/// targets and inside every wait, ending the run with the counts gathered so
/// far; a cancelled run sends no final progress notification.
pub async fn execute_with_retry<T, F, Fut>(
    targets: Vec<T>,
    mut mutate: F,
    config: &RetryConfig,
    shutdown: &ShutdownToken,
    progress: Option<&dyn ProgressSink>,
) -> BulkOutcome<T>
where
    T: Clone,
    F: FnMut(T) -> Fut,
    Fut: Future<Output = Result<(), HandlerError>>,
{
    let total = targets.len();
    let max_attempts = config.max_attempts.max(1);
    let span = telemetry::bulk_retry_span(&config.name, total);

    async move {
        let mut outcome = BulkOutcome {
            succeeded: 0,
            failed: 0,
            cancelled: false,
            targets: targets.into_iter().map(RetryTarget::new).collect(),
        };
        let mut tracker = ProgressTracker::new(progress, config.progress_granularity, total);

        'targets: for index in 0..total {
            if shutdown.is_cancelled() {
                outcome.cancelled = true;
                break;
            }

            let target = &mut outcome.targets[index];
            loop {
                target.attempts += 1;
                let result = mutate(target.item.clone()).await;
                telemetry::record_retry_attempt(&config.name, result.is_ok());

                match result {
                    Ok(()) => {
                        target.status = TargetStatus::Succeeded;
                        outcome.succeeded += 1;
                        break;
                    }
                    Err(err) => {
                        let attempt = target.attempts;
                        target.last_error = Some(err.to_string());

                        if !err.is_retryable() || attempt >= max_attempts {
                            tracing::warn!(
                                index,
                                attempts = attempt,
                                error_kind = err.kind_label(),
                                "giving up on target: {err}"
                            );
                            target.status = TargetStatus::Failed;
                            outcome.failed += 1;
                            break;
                        }

                        let delay = config.delay_for_attempt(attempt);
                        tracing::debug!(
                            index,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "attempt failed, backing off: {err}"
                        );
                        if !shutdown.sleep(delay).await {
                            target.status = TargetStatus::Cancelled;
                            outcome.cancelled = true;
                            break 'targets;
                        }
                    }
                }
            }

            tracker.advance(index + 1);

            if index + 1 < total && !shutdown.sleep(config.inter_item_delay()).await {
                outcome.cancelled = true;
                break;
            }
        }

        if outcome.cancelled {
            tracing::info!(
                succeeded = outcome.succeeded,
                failed = outcome.failed,
                total,
                "bulk operation cancelled"
            );
        } else {
            tracker.finish(total);
            tracing::info!(
                succeeded = outcome.succeeded,
                failed = outcome.failed,
                total,
                "bulk operation finished"
            );
        }
        outcome
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn fast() -> RetryConfig {
        RetryConfig::new("test").with_base_delay(100).with_inter_item_delay(10)
    }

    #[test]
    fn test_linear_backoff() {
        let config = RetryConfig::default().with_base_delay(250);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(250));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(500));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(750));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_target_converges() {
        let calls = Arc::new(Mutex::new(HashMap::<&str, u32>::new()));
        let mutate = {
            let calls = Arc::clone(&calls);
            move |target: &'static str| {
                let calls = Arc::clone(&calls);
                async move {
                    let attempt = {
                        let mut calls = calls.lock();
                        let count = calls.entry(target).or_default();
                        *count += 1;
                        *count
                    };
                    if target == "t2" && attempt < 3 {
                        Err(HandlerError::transient(anyhow::anyhow!("rate limited")))
                    } else {
                        Ok(())
                    }
                }
            }
        };

        let outcome =
            execute_with_retry(vec!["t1", "t2", "t3"], mutate, &fast(), &ShutdownToken::new(), None).await;

        assert_eq!(outcome.succeeded, 3);
        assert_eq!(outcome.failed, 0);
        assert!(outcome.all_succeeded());
        let attempts: Vec<_> = outcome.targets.iter().map(|t| t.attempts).collect();
        assert_eq!(attempts, vec![1, 3, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_waits_grow_linearly() {
        let started = tokio::time::Instant::now();
        let stamps = Arc::new(Mutex::new(Vec::new()));
        let mutate = {
            let stamps = Arc::clone(&stamps);
            move |_: u8| {
                stamps.lock().push(started.elapsed());
                async { Err(HandlerError::transient(anyhow::anyhow!("down"))) }
            }
        };

        let outcome = execute_with_retry(vec![1], mutate, &fast(), &ShutdownToken::new(), None).await;

        assert_eq!(outcome.failed, 1);
        let stamps = stamps.lock().clone();
        assert_eq!(stamps.len(), 3);
        assert!(stamps[1] - stamps[0] >= Duration::from_millis(100));
        assert!(stamps[1] - stamps[0] < Duration::from_millis(200));
        assert!(stamps[2] - stamps[1] >= Duration::from_millis(200));
        assert!(stamps[2] - stamps[1] < Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_target_does_not_block_the_rest() {
        let mutate = |target: u32| async move {
            if target == 0 {
                Err(HandlerError::unhandled(anyhow::anyhow!("member left the guild")))
            } else {
                Ok(())
            }
        };

        let outcome =
            execute_with_retry(vec![0, 1, 2], mutate, &fast(), &ShutdownToken::new(), None).await;

        assert_eq!(outcome.targets[0].attempts, 3);
        assert_eq!(outcome.targets[0].status, TargetStatus::Failed);
        assert_eq!(outcome.succeeded, 2);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.failed_targets().count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_errors_are_not_retried() {
        let mutate = |_: u32| async { Err(HandlerError::validation("unknown member")) };

        let outcome = execute_with_retry(vec![7], mutate, &fast(), &ShutdownToken::new(), None).await;

        assert_eq!(outcome.targets[0].attempts, 1);
        assert_eq!(outcome.targets[0].last_error.as_deref(), Some("unknown member"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_reports_each_threshold_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = fast().with_inter_item_delay(0);

        let outcome = execute_with_retry(
            (0..100).collect(),
            |_: u32| async { Ok(()) },
            &config,
            &ShutdownToken::new(),
            Some(&tx),
        )
        .await;
        assert_eq!(outcome.succeeded, 100);

        let mut seen = Vec::new();
        while let Ok(progress) = rx.try_recv() {
            seen.push(progress.percent);
        }
        assert_eq!(seen, vec![10, 20, 30, 40, 50, 60, 70, 80, 90, 100, 100]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_notification_is_marked_final() {
        let (tx, mut rx) = mpsc::unbounded_channel();

        execute_with_retry(
            (0..10).collect(),
            |_: u32| async { Ok(()) },
            &fast().with_progress_granularity(Some(50)),
            &ShutdownToken::new(),
            Some(&tx),
        )
        .await;

        let mut seen = Vec::new();
        while let Ok(progress) = rx.try_recv() {
            seen.push((progress.percent, progress.is_final));
        }
        assert_eq!(seen, vec![(50, false), (100, false), (100, true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_granularity_still_reports_completion() {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let outcome = execute_with_retry(
            vec![1, 2, 3],
            |_: u32| async { Ok(()) },
            &fast().with_progress_granularity(None),
            &ShutdownToken::new(),
            Some(&tx),
        )
        .await;
        assert_eq!(outcome.succeeded, 3);

        let mut seen = Vec::new();
        while let Ok(progress) = rx.try_recv() {
            seen.push(progress);
        }
        assert_eq!(
            seen,
            vec![Progress {
                completed: 3,
                total: 3,
                percent: 100,
                is_final: true,
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_skipping_thresholds_still_reports_each() {
        let (tx, mut rx) = mpsc::unbounded_channel();

        // Three targets: 33%, 66%, 100%.
        execute_with_retry(
            vec![1, 2, 3],
            |_: u32| async { Ok(()) },
            &fast(),
            &ShutdownToken::new(),
            Some(&tx),
        )
        .await;

        let mut seen = Vec::new();
        while let Ok(progress) = rx.try_recv() {
            seen.push(progress.percent);
        }
        assert_eq!(seen, vec![10, 20, 30, 40, 50, 60, 70, 80, 90, 100, 100]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_backoff_stops_cleanly() {
        let shutdown = ShutdownToken::new();
        let canceller = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        let (tx, mut rx) = mpsc::unbounded_channel();

        let outcome = execute_with_retry(
            vec![1, 2, 3],
            |_: u32| async { Err(HandlerError::transient(anyhow::anyhow!("timeout"))) },
            &fast(),
            &shutdown,
            Some(&tx),
        )
        .await;

        assert!(outcome.cancelled);
        assert_eq!(outcome.targets[0].status, TargetStatus::Cancelled);
        assert_eq!(outcome.targets[0].attempts, 1);
        assert_eq!(outcome.targets[1].status, TargetStatus::Pending);
        assert_eq!(outcome.targets[1].attempts, 0);
        assert!(rx.try_recv().is_err(), "no final notification after cancel");
    }

    #[tokio::test]
    async fn test_empty_targets_reports_completion() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = execute_with_retry(
            Vec::<u32>::new(),
            |_| async { Ok(()) },
            &RetryConfig::default(),
            &ShutdownToken::new(),
            Some(&tx),
        )
        .await;

        assert_eq!(outcome.succeeded, 0);
        assert_eq!(rx.try_recv().unwrap().percent, 100);
    }
}
