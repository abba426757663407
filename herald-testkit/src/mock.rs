use async_trait::async_trait;
use herald::*;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::{TestKind, TestMessage};

/// One completed handler invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandledRecord {
    pub handler: String,
    pub tag: String,
    pub kind: TestKind,
}

/// Invocation log shared by several handlers, so cross-handler order can be
/// asserted.
#[derive(Clone, Debug, Default)]
pub struct Journal {
    records: Arc<Mutex<Vec<HandledRecord>>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<HandledRecord> {
        self.records.lock().clone()
    }

    pub fn tags(&self) -> Vec<String> {
        self.records.lock().iter().map(|r| r.tag.clone()).collect()
    }

    pub fn handlers(&self) -> Vec<String> {
        self.records.lock().iter().map(|r| r.handler.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    fn push(&self, record: HandledRecord) {
        self.records.lock().push(record);
    }
}

/// How a [`RecordingHandler`] ends each invocation.
#[derive(Clone, Debug, Default)]
pub enum Behavior {
    #[default]
    Succeed,
    Validation(String),
    Transient(String),
    Unhandled(String),
    Panic(String),
}

/// Handler double implementing all three handler traits.
///
/// Every invocation is appended to its [`Journal`] (failing ones included),
/// after the optional delay. The behavior in effect when the invocation
/// starts decides its result. Peak concurrency is tracked for parallel
/// worker tests.
#[derive(Clone)]
pub struct RecordingHandler {
    name: String,
    journal: Journal,
    behavior: Arc<Mutex<Behavior>>,
    delay: Option<Duration>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl RecordingHandler {
    pub fn new(name: impl Into<String>, journal: Journal) -> Self {
        Self {
            name: name.into(),
            journal,
            behavior: Arc::new(Mutex::new(Behavior::Succeed)),
            delay: None,
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_behavior(self, behavior: Behavior) -> Self {
        *self.behavior.lock() = behavior;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock() = behavior;
    }

    /// Highest number of invocations observed running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn invoke(&self, message: &TestMessage) -> Result<String, HandlerError> {
        let behavior = self.behavior.lock().clone();
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        self.journal.push(HandledRecord {
            handler: self.name.clone(),
            tag: message.tag.clone(),
            kind: message.kind,
        });

        match behavior {
            Behavior::Succeed => Ok(format!("{}:{}", self.name, message.tag)),
            Behavior::Validation(text) => Err(HandlerError::validation(text)),
            Behavior::Transient(text) => Err(HandlerError::transient(anyhow::anyhow!(text))),
            Behavior::Unhandled(text) => Err(HandlerError::unhandled(anyhow::anyhow!(text))),
            Behavior::Panic(text) => panic!("{text}"),
        }
    }
}

#[async_trait]
impl CommandHandler<TestMessage> for RecordingHandler {
    async fn handle(&self, message: &TestMessage, _cx: &HandlerContext) -> Result<(), HandlerError> {
        self.invoke(message).await.map(|_| ())
    }
}

#[async_trait]
impl RequestHandler<TestMessage> for RecordingHandler {
    async fn handle(&self, message: &TestMessage, _cx: &HandlerContext) -> Result<String, HandlerError> {
        self.invoke(message).await
    }
}

#[async_trait]
impl EventHandler<TestMessage> for RecordingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &TestMessage, _cx: &HandlerContext) -> Result<(), HandlerError> {
        self.invoke(event).await.map(|_| ())
    }
}

/// Reply context that keeps every text it was asked to send.
#[derive(Clone, Default)]
pub struct RecordingReply {
    replies: Arc<Mutex<Vec<String>>>,
    fail: bool,
}

impl RecordingReply {
    pub fn new() -> Self {
        Self::default()
    }

    /// A reply context whose every send fails, like an expired interaction.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn replies(&self) -> Vec<String> {
        self.replies.lock().clone()
    }
}

#[async_trait]
impl ReplyContext for RecordingReply {
    async fn reply(&self, text: &str) -> anyhow::Result<()> {
        self.replies.lock().push(text.to_string());
        if self.fail {
            anyhow::bail!("interaction expired");
        }
        Ok(())
    }
}

/// Error reporter that keeps every report.
#[derive(Clone, Default)]
pub struct RecordingReporter {
    reports: Arc<Mutex<Vec<ErrorReport>>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<ErrorReport> {
        self.reports.lock().clone()
    }

    pub fn assert_report_count_eq(&self, expected: usize) {
        let actual = self.reports.lock().len();
        assert_eq!(actual, expected, "Expected {} reports, got {}", expected, actual);
    }

    pub fn clear(&self) {
        self.reports.lock().clear();
    }
}

#[async_trait]
impl ErrorReporter for RecordingReporter {
    async fn report(&self, report: &ErrorReport) -> anyhow::Result<()> {
        self.reports.lock().push(report.clone());
        Ok(())
    }
}

/// Poll `condition` until it holds or `limit` elapses.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
