//! Monitoring events emitted by the scheduler and worker loop
//!
//! The scheduler does not aggregate anything itself: every observation is
//! handed to a [`MetricsSink`], which forwards it to whatever backend the
//! deployment uses.

use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

/// A single monitoring observation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MetricEvent {
    /// Queued rows in a queue at the start of a worker pass
    QueueDepth { queue: String, depth: u64 },

    /// A handler returned success
    JobSucceeded {
        queue: String,
        job_type: String,
        runtime: Duration,
    },

    /// A handler failed (or was missing)
    JobFailed {
        queue: String,
        job_type: String,
        dead_lettered: bool,
    },

    /// Time between creation and claim
    ClaimWait {
        queue: String,
        job_type: String,
        wait: Duration,
    },

    /// A claim candidate was deferred by tenant rate limiting
    JobThrottled { queue: String, tenant: String },
}

impl MetricEvent {
    /// Metric name, as used by the tracing sink
    pub fn name(&self) -> &'static str {
        match self {
            Self::QueueDepth { .. } => "queue_depth",
            Self::JobSucceeded { .. } => "job_succeeded",
            Self::JobFailed { .. } => "job_failed",
            Self::ClaimWait { .. } => "claim_wait",
            Self::JobThrottled { .. } => "job_throttled",
        }
    }

    pub fn queue(&self) -> &str {
        match self {
            Self::QueueDepth { queue, .. }
            | Self::JobSucceeded { queue, .. }
            | Self::JobFailed { queue, .. }
            | Self::ClaimWait { queue, .. }
            | Self::JobThrottled { queue, .. } => queue,
        }
    }
}

/// Receiver for [`MetricEvent`]s
///
/// Called inline from the worker loop; implementations must not block.
pub trait MetricsSink: Send + Sync + 'static {
    fn record(&self, event: MetricEvent);
}

/// Emits every event as a `tracing` event on target `fairqueue::metrics`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn record(&self, event: MetricEvent) {
        match event {
            MetricEvent::QueueDepth { queue, depth } => {
                tracing::info!(target: "fairqueue::metrics", metric = "queue_depth", %queue, depth);
            }
            MetricEvent::JobSucceeded {
                queue,
                job_type,
                runtime,
            } => {
                tracing::info!(
                    target: "fairqueue::metrics",
                    metric = "job_succeeded",
                    %queue,
                    %job_type,
                    runtime_ms = runtime.as_millis() as u64,
                );
            }
            MetricEvent::JobFailed {
                queue,
                job_type,
                dead_lettered,
            } => {
                tracing::info!(
                    target: "fairqueue::metrics",
                    metric = "job_failed",
                    %queue,
                    %job_type,
                    dead_lettered,
                );
            }
            MetricEvent::ClaimWait {
                queue,
                job_type,
                wait,
            } => {
                tracing::info!(
                    target: "fairqueue::metrics",
                    metric = "claim_wait",
                    %queue,
                    %job_type,
                    wait_secs = wait.as_secs_f64(),
                );
            }
            MetricEvent::JobThrottled { queue, tenant } => {
                tracing::info!(target: "fairqueue::metrics", metric = "job_throttled", %queue, %tenant);
            }
        }
    }
}

/// Discards every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn record(&self, _event: MetricEvent) {}
}

/// Collects events in memory (for tests)
#[derive(Debug, Default)]
pub struct InMemoryMetricsSink {
    events: Mutex<Vec<MetricEvent>>,
}

impl InMemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded events
    pub fn events(&self) -> Vec<MetricEvent> {
        self.events.lock().clone()
    }

    /// Number of recorded events with the given metric name
    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name() == name).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl MetricsSink for InMemoryMetricsSink {
    fn record(&self, event: MetricEvent) {
        self.events.lock().push(event);
    }
}
