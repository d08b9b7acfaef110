//! # Fair Job Queue
//!
//! A PostgreSQL-backed job queue and worker scheduler for multi-tenant
//! background work.
//!
//! ## Features
//!
//! - **Lease-based claiming**: one transaction selects, throttles and leases jobs with `SKIP LOCKED`
//! - **Crash recovery by lease expiry**: a job whose lease times out is reclaimed by another worker
//! - **Tenant fairness**: per-queue token buckets and per-batch in-flight caps
//! - **Typed retries**: per-job-type exponential backoff, then dead-lettering
//! - **Fenced outcomes**: a worker that lost its lease cannot overwrite the new owner's result
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Worker                               │
//! │  (polls queues, runs handlers from the HandlerRegistry)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Scheduler                             │
//! │  (routing, ClaimPlanner, retry table, rate limiter, clock)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        JobStore                              │
//! │  (PostgreSQL: fq_jobs, fq_dead_letter_jobs)                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use fairqueue::prelude::*;
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(InMemoryJobStore::new());
//! let scheduler = Scheduler::new(store, SchedulerConfig::default())?;
//!
//! let job = scheduler
//!     .enqueue(EnqueueRequest::new("x", json!({"id": 7})).with_queue("standard"))
//!     .await?;
//!
//! let claimed = scheduler.claim("standard", 1, "w1").await?;
//! assert_eq!(claimed[0].id, job.id);
//! assert_eq!(claimed[0].attempt_count, 1);
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod metrics;
pub mod model;
pub mod persistence;
pub mod reliability;
pub mod scheduler;
mod serde_duration;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::{SchedulerConfig, TenantLimits, WorkerConfig};
    pub use crate::metrics::{MetricEvent, MetricsSink};
    pub use crate::model::{DeadLetterJob, Job, JobStatus};
    pub use crate::persistence::{
        DeadLetterFilter, InMemoryJobStore, JobStore, Pagination, PostgresJobStore, StoreError,
    };
    pub use crate::reliability::{RetryPolicy, RetryPolicyTable};
    pub use crate::scheduler::{EnqueueRequest, FailureOutcome, Scheduler};
    pub use crate::worker::{HandlerError, HandlerRegistry, HandlerResult, Worker, WorkerError};
}

// Re-export key types at crate root
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, QueueLimits, SchedulerConfig, TenantLimits, WorkerConfig};
pub use metrics::{InMemoryMetricsSink, MetricEvent, MetricsSink, NoopMetricsSink, TracingMetricsSink};
pub use model::{DeadLetterJob, Job, JobStatus, Lease, NewJob, DEFAULT_PRIORITY};
pub use persistence::{
    DeadLetterFilter, InMemoryJobStore, JobStore, Pagination, PostgresJobStore, StoreError,
};
pub use reliability::{RateLimiter, RetryPolicy, RetryPolicyTable, TokenBucketLimiter};
pub use scheduler::{EnqueueRequest, FailureOutcome, Scheduler};
pub use worker::{HandlerError, HandlerRegistry, HandlerResult, JobHandler, Worker, WorkerError};
