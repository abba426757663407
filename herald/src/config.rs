use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::queue::QueueCapacity;
use crate::worker::{WorkerConfig, WorkerMode};

/// Buffer sizing for the four pipeline queues.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub commands: QueueCapacity,
    pub parallel_commands: QueueCapacity,
    pub requests: QueueCapacity,
    pub events: QueueCapacity,
}

impl QueueConfig {
    /// Use the same capacity for every queue.
    pub fn uniform(capacity: QueueCapacity) -> Self {
        Self {
            commands: capacity,
            parallel_commands: capacity,
            requests: capacity,
            events: capacity,
        }
    }
}

/// Top-level configuration for a [`Pipeline`](crate::pipeline::Pipeline).
///
/// Every field has a default, so a partial document deserializes.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub queues: QueueConfig,
    /// Worker for the serial command queue.
    pub command_worker: WorkerConfig,
    /// Worker for the parallel command queue.
    pub parallel_command_worker: WorkerConfig,
    /// Worker for the request queue.
    pub request_worker: WorkerConfig,
    /// Worker for the event queue.
    pub event_worker: WorkerConfig,
    /// How long `shutdown` waits for each worker to exit, in milliseconds.
    pub shutdown_timeout_ms: u64,
    /// Events buffered per lifecycle subscriber.
    pub lifecycle_capacity: usize,
}

impl PipelineConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn with_queues(mut self, queues: QueueConfig) -> Self {
        self.queues = queues;
        self
    }

    pub fn with_shutdown_timeout(mut self, ms: u64) -> Self {
        self.shutdown_timeout_ms = ms;
        self
    }

    pub fn with_max_parallel_commands(mut self, max_in_flight: usize) -> Self {
        self.parallel_command_worker.max_in_flight = Some(max_in_flight);
        self
    }

    /// Run requests concurrently instead of one at a time.
    pub fn with_parallel_requests(mut self) -> Self {
        self.request_worker.mode = WorkerMode::Parallel;
        self
    }

    /// Hold every worker until the platform client reports ready.
    pub fn with_wait_for_ready(mut self, wait: bool) -> Self {
        for worker in [
            &mut self.command_worker,
            &mut self.parallel_command_worker,
            &mut self.request_worker,
            &mut self.event_worker,
        ] {
            worker.wait_for_ready = wait;
        }
        self
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queues: QueueConfig::default(),
            command_worker: WorkerConfig::new("commands"),
            parallel_command_worker: WorkerConfig::new("parallel-commands").with_mode(WorkerMode::Parallel),
            request_worker: WorkerConfig::new("requests"),
            event_worker: WorkerConfig::new("events"),
            shutdown_timeout_ms: 30_000,
            lifecycle_capacity: 256,
        }
    }
}

/// Configuration for a [`BatchBuffer`](crate::batch::BatchBuffer).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub name: String,
    /// Flush as soon as this many items are waiting.
    pub batch_size: usize,
    /// Flush whatever is waiting at least this often, in milliseconds.
    pub flush_interval_ms: u64,
    pub capacity: QueueCapacity,
}

impl BatchConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_flush_interval(mut self, ms: u64) -> Self {
        self.flush_interval_ms = ms;
        self
    }

    pub fn with_capacity(mut self, capacity: QueueCapacity) -> Self {
        self.capacity = capacity;
        self
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            name: "batch".to_string(),
            batch_size: 100,
            flush_interval_ms: 1_000,
            capacity: QueueCapacity::Unbounded,
        }
    }
}
