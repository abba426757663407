//! Benchmarks for queue and dispatch throughput using criterion.
//!
//! These benchmarks measure:
//! - Single enqueue + dequeue on a `MessageQueue`
//! - End-to-end serial and parallel command dispatch through a `Pipeline`
//! - Event fan-out to a growing number of handlers

#![allow(missing_docs)]

use std::sync::Arc;

use async_trait::async_trait;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use herald::*;
use herald_testkit::{TestKind, TestMessage};
use tokio::runtime::Runtime;

/// Creates a tokio runtime for async benchmarks.
fn create_runtime() -> Runtime {
    Runtime::new().expect("Failed to create tokio runtime")
}

struct Noop;

#[async_trait]
impl CommandHandler<TestMessage> for Noop {
    async fn handle(&self, _message: &TestMessage, _cx: &HandlerContext) -> Result<(), HandlerError> {
        Ok(())
    }
}

#[async_trait]
impl RequestHandler<TestMessage> for Noop {
    async fn handle(&self, message: &TestMessage, _cx: &HandlerContext) -> Result<String, HandlerError> {
        Ok(message.tag.clone())
    }
}

#[async_trait]
impl EventHandler<TestMessage> for Noop {
    async fn handle(&self, _event: &TestMessage, _cx: &HandlerContext) -> Result<(), HandlerError> {
        Ok(())
    }
}

fn pipeline(event_handlers: usize) -> Pipeline<TestMessage, TestMessage, TestMessage, TestMessage> {
    let noop = Arc::new(Noop);
    let mut events = EventRegistry::<TestMessage>::builder(MessageCategory::Event);
    for _ in 0..event_handlers {
        events = events.register(TestKind::Alpha, noop.clone());
    }

    Pipeline::builder()
        .with_commands(Arc::new(
            CommandRegistry::<TestMessage>::builder(MessageCategory::Command)
                .register(TestKind::Alpha, noop.clone())
                .register(TestKind::Beta, noop.clone())
                .build()
                .expect("command registry"),
        ))
        .with_parallel_commands(Arc::new(
            CommandRegistry::<TestMessage>::builder(MessageCategory::ParallelCommand)
                .register(TestKind::Alpha, noop.clone())
                .register(TestKind::Beta, noop.clone())
                .build()
                .expect("parallel command registry"),
        ))
        .with_requests(Arc::new(
            RequestRegistry::<TestMessage>::builder(MessageCategory::Request)
                .register(TestKind::Alpha, noop.clone())
                .register(TestKind::Beta, noop)
                .build()
                .expect("request registry"),
        ))
        .with_events(Arc::new(events.build().expect("event registry")))
        .with_reporter(Arc::new(TracingReporter))
        .with_readiness(Readiness::ready())
        .build()
        .expect("pipeline")
}

/// Benchmark: enqueue then dequeue one message.
fn bench_queue_round_trip(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("queue_round_trip");
    group.sample_size(100);

    group.bench_function("unbounded", |b| {
        let queue = MessageQueue::unbounded("bench");
        let shutdown = ShutdownToken::new();

        b.to_async(&rt).iter(|| async {
            queue
                .enqueue(Envelope::new(MessageCategory::Command, TestMessage::alpha("bench")))
                .expect("enqueue should succeed");
            queue.dequeue(&shutdown).await.expect("item should be queued")
        });
    });

    group.finish();
}

/// Benchmark: push a burst of commands through a running pipeline and drain it.
fn bench_command_dispatch(c: &mut Criterion) {
    let rt = create_runtime();
    let burst_sizes = [100, 1_000];

    let mut group = c.benchmark_group("command_dispatch");
    group.sample_size(20);

    for burst in burst_sizes {
        group.throughput(Throughput::Elements(burst as u64));

        group.bench_with_input(BenchmarkId::new("serial", burst), &burst, |b, &size| {
            b.to_async(&rt).iter(|| async move {
                let pipeline = pipeline(0);
                pipeline.start().await.expect("start");
                for i in 0..size {
                    pipeline
                        .enqueue_command(TestMessage::alpha(format!("c{i}")), None)
                        .expect("enqueue should succeed");
                }
                pipeline.drain().await.expect("drain");
            });
        });

        group.bench_with_input(BenchmarkId::new("parallel", burst), &burst, |b, &size| {
            b.to_async(&rt).iter(|| async move {
                let pipeline = pipeline(0);
                pipeline.start().await.expect("start");
                for i in 0..size {
                    pipeline
                        .enqueue_parallel_command(TestMessage::alpha(format!("p{i}")), None)
                        .expect("enqueue should succeed");
                }
                pipeline.drain().await.expect("drain");
            });
        });
    }

    group.finish();
}

/// Benchmark: broadcast 100 events to N handlers.
fn bench_event_fan_out(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("event_fan_out");
    group.sample_size(20);

    for handlers in [1, 4, 16] {
        group.throughput(Throughput::Elements(100 * handlers as u64));
        group.bench_with_input(BenchmarkId::from_parameter(handlers), &handlers, |b, &count| {
            b.to_async(&rt).iter(|| async move {
                let pipeline = pipeline(count);
                pipeline.start().await.expect("start");
                for i in 0..100 {
                    pipeline
                        .publish_event(TestMessage::alpha(format!("e{i}")))
                        .expect("publish should succeed");
                }
                pipeline.drain().await.expect("drain");
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_queue_round_trip,
    bench_command_dispatch,
    bench_event_fan_out
);
criterion_main!(benches);
