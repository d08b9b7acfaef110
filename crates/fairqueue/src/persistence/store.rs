//! JobStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::{DeadLetterJob, Job, Lease, NewJob};
use crate::scheduler::ClaimPlanner;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Job not found
    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    /// Dead-letter record not found
    #[error("dead letter not found: {0}")]
    DeadLetterNotFound(Uuid),

    /// The lease no longer matches the row (reclaimed by another worker)
    #[error("lease lost on job {job_id} held by {worker_id}")]
    LeaseLost { job_id: Uuid, worker_id: String },

    /// Rejected before reaching storage
    #[error("invalid job: {0}")]
    InvalidJob(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub(crate) fn lease_lost(lease: &Lease) -> Self {
        Self::LeaseLost {
            job_id: lease.job_id,
            worker_id: lease.worker_id.clone(),
        }
    }
}

/// Parameters for one claim transaction
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub queue_name: String,
    pub worker_id: String,
    pub now: DateTime<Utc>,
    pub lock_timeout: Duration,

    /// Maximum candidate rows read (limit times the over-fetch multiplier)
    pub fetch_limit: usize,
}

/// Filter for listing dead letters
#[derive(Debug, Clone, Default)]
pub struct DeadLetterFilter {
    pub queue_name: Option<String>,
    pub tenant_id: Option<String>,
    pub job_type: Option<String>,
}

impl DeadLetterFilter {
    pub(crate) fn matches(&self, dead: &DeadLetterJob) -> bool {
        self.queue_name
            .as_deref()
            .map_or(true, |q| dead.queue_name == q)
            && self
                .tenant_id
                .as_deref()
                .map_or(true, |t| dead.tenant_id.as_deref() == Some(t))
            && self
                .job_type
                .as_deref()
                .map_or(true, |t| dead.job_type == t)
    }
}

/// Pagination parameters
#[derive(Debug, Clone)]
pub struct Pagination {
    pub offset: u32,
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

/// Durable storage for jobs and dead letters
///
/// Every mutating method is its own transaction. Outcome writes are
/// conditioned on the caller's [`Lease`]: if the row is no longer running
/// under exactly that lease, nothing changes and `LeaseLost` is returned.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Persist a new queued job
    async fn insert(&self, job: NewJob, now: DateTime<Utc>) -> Result<Job, StoreError>;

    /// Select, throttle and lease jobs in one transaction
    ///
    /// Candidates are rows in the queue with `run_at <= now` that are either
    /// queued without a valid lease or running under an expired one, ordered
    /// by priority, then run_at, then created_at. The planner decides each
    /// candidate until it is full. Leases are committed before returning.
    async fn claim(
        &self,
        request: ClaimRequest,
        planner: &mut ClaimPlanner,
    ) -> Result<Vec<Job>, StoreError>;

    /// Mark a leased job succeeded
    async fn complete(&self, lease: &Lease, now: DateTime<Utc>) -> Result<Job, StoreError>;

    /// Return a leased job to the queue at `run_at`
    async fn reschedule(
        &self,
        lease: &Lease,
        run_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError>;

    /// Move a leased job to the dead-letter table
    async fn dead_letter(
        &self,
        lease: &Lease,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<DeadLetterJob, StoreError>;

    /// Get a job by ID
    async fn get_job(&self, id: Uuid) -> Result<Job, StoreError>;

    /// Number of queued rows in a queue
    async fn queue_depth(&self, queue_name: &str) -> Result<u64, StoreError>;

    /// List dead letters, newest first
    async fn list_dead_letters(
        &self,
        filter: DeadLetterFilter,
        pagination: Pagination,
    ) -> Result<Vec<DeadLetterJob>, StoreError>;

    /// Get a dead letter by ID
    async fn get_dead_letter(&self, id: Uuid) -> Result<DeadLetterJob, StoreError>;
}
