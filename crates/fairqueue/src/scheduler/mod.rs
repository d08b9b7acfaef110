//! Scheduler facade
//!
//! [`Scheduler`] ties a [`JobStore`] to configuration, the tenant rate
//! limiter, the clock and the metrics sink. Producers call
//! [`Scheduler::enqueue`]; workers call [`Scheduler::claim`] and then
//! [`Scheduler::complete`] or [`Scheduler::fail`].

mod claim;
mod routing;

pub use claim::{
    ClaimDecision, ClaimPlanner, ThrottledJob, ATTEMPTS_EXHAUSTED, LEASE_EXPIRED, TENANT_THROTTLED,
};
pub use routing::resolve_queue;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, SchedulerConfig};
use crate::metrics::{MetricEvent, MetricsSink, TracingMetricsSink};
use crate::model::{DeadLetterJob, Job, NewJob, DEFAULT_PRIORITY};
use crate::persistence::{ClaimRequest, DeadLetterFilter, JobStore, Pagination, StoreError};
use crate::reliability::{FailureDecision, RateLimiter, RetryPolicyTable, TokenBucketLimiter};

/// A job to enqueue
///
/// # Example
///
/// ```
/// use fairqueue::EnqueueRequest;
/// use serde_json::json;
///
/// let request = EnqueueRequest::new("data_export", json!({"report": 42}))
///     .with_tenant("acme")
///     .with_priority(10);
/// assert_eq!(request.priority, 10);
/// ```
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub job_type: String,
    pub payload: serde_json::Value,
    pub tenant_id: Option<String>,
    pub queue_name: Option<String>,
    pub priority: i32,
    /// Defaults to the scheduler's current time
    pub run_at: Option<DateTime<Utc>>,
    pub max_attempts: Option<u32>,
}

impl EnqueueRequest {
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            tenant_id: None,
            queue_name: None,
            priority: DEFAULT_PRIORITY,
            run_at: None,
            max_attempts: None,
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// Result of [`Scheduler::fail`]
#[derive(Debug, Clone)]
pub enum FailureOutcome {
    /// Job went back to the queue
    Rescheduled { job: Job, delay: Duration },

    /// Attempts exhausted; the job row is gone
    DeadLettered(DeadLetterJob),
}

impl FailureOutcome {
    pub fn is_dead_lettered(&self) -> bool {
        matches!(self, Self::DeadLettered(_))
    }
}

/// Job scheduler backed by a [`JobStore`]
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    config: SchedulerConfig,
    retry: Arc<RetryPolicyTable>,
    limiter: Arc<dyn RateLimiter>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Create a scheduler with the system clock, an in-process token bucket
    /// limiter and tracing metrics
    pub fn new(store: Arc<dyn JobStore>, config: SchedulerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            store,
            retry: Arc::new(config.retry.clone()),
            config,
            limiter: Arc::new(TokenBucketLimiter::new()),
            clock: Arc::new(SystemClock),
            metrics: Arc::new(TracingMetricsSink),
        })
    }

    /// Replace the clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the tenant rate limiter
    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Replace the metrics sink
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn metrics(&self) -> &dyn MetricsSink {
        self.metrics.as_ref()
    }

    /// Current time from the scheduler's clock
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Resolve the queue a job of `job_type` would be enqueued on
    pub fn resolve_queue<'a>(&'a self, job_type: &str, explicit: Option<&'a str>) -> &'a str {
        resolve_queue(&self.config, job_type, explicit)
    }

    /// Persist a new queued job
    #[instrument(skip(self, request), fields(job_type = %request.job_type))]
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<Job, StoreError> {
        if request.max_attempts == Some(0) {
            return Err(StoreError::InvalidJob(
                "max_attempts must be at least 1".into(),
            ));
        }

        let now = self.now();
        let queue_name = self
            .resolve_queue(&request.job_type, request.queue_name.as_deref())
            .to_string();

        let job = self
            .store
            .insert(
                NewJob {
                    queue_name,
                    job_type: request.job_type,
                    tenant_id: request.tenant_id,
                    payload: request.payload,
                    priority: request.priority,
                    run_at: request.run_at.unwrap_or(now),
                    max_attempts: request.max_attempts,
                },
                now,
            )
            .await?;

        info!(job_id = %job.id, queue = %job.queue_name, run_at = %job.run_at, "enqueued job");
        Ok(job)
    }

    /// Lease up to `limit` ready jobs from `queue_name` for `worker_id`
    ///
    /// Leases are committed before this returns.
    #[instrument(skip(self))]
    pub async fn claim(
        &self,
        queue_name: &str,
        limit: usize,
        worker_id: &str,
    ) -> Result<Vec<Job>, StoreError> {
        if limit == 0 {
            return Ok(vec![]);
        }

        let now = self.now();
        let mut planner = ClaimPlanner::new(
            queue_name,
            limit,
            self.config.tenant_limits(queue_name),
            Arc::clone(&self.limiter),
            Arc::clone(&self.retry),
        );
        let request = ClaimRequest {
            queue_name: queue_name.to_string(),
            worker_id: worker_id.to_string(),
            now,
            lock_timeout: self.config.lock_timeout,
            fetch_limit: self.config.fetch_limit(limit),
        };

        let jobs = self.store.claim(request, &mut planner).await?;

        for throttled in planner.throttled() {
            self.metrics.record(MetricEvent::JobThrottled {
                queue: queue_name.to_string(),
                tenant: throttled.tenant_id.clone(),
            });
        }
        for exhausted in planner.dead_lettered() {
            warn!(job_id = %exhausted.id, job_type = %exhausted.job_type, "no attempts left at claim, dead-lettered");
            self.metrics.record(MetricEvent::JobFailed {
                queue: queue_name.to_string(),
                job_type: exhausted.job_type.clone(),
                dead_lettered: true,
            });
        }
        if !planner.throttled().is_empty() {
            debug!(count = planner.throttled().len(), "throttled candidates deferred");
        }

        Ok(jobs)
    }

    /// Mark a claimed job succeeded
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    pub async fn complete(&self, job: &Job) -> Result<Job, StoreError> {
        let lease = job.lease().ok_or(StoreError::LeaseLost {
            job_id: job.id,
            worker_id: String::new(),
        })?;
        let done = self.store.complete(&lease, self.now()).await?;
        debug!("job succeeded");
        Ok(done)
    }

    /// Apply the retry policy to a claimed job whose attempt failed
    #[instrument(skip(self, job, error), fields(job_id = %job.id, attempt = job.attempt_count))]
    pub async fn fail(&self, job: &Job, error: &str) -> Result<FailureOutcome, StoreError> {
        let lease = job.lease().ok_or(StoreError::LeaseLost {
            job_id: job.id,
            worker_id: String::new(),
        })?;
        let now = self.now();

        match self.retry.decide_failure(job, now) {
            FailureDecision::Retry { run_at, delay } => {
                let job = self.store.reschedule(&lease, run_at, error, now).await?;
                info!(%run_at, delay_secs = delay.as_secs_f64(), error, "job rescheduled");
                Ok(FailureOutcome::Rescheduled { job, delay })
            }
            FailureDecision::DeadLetter => {
                let dead = self.store.dead_letter(&lease, error, now).await?;
                warn!(dead_letter_id = %dead.id, attempts = dead.attempt_count, error, "job dead-lettered");
                Ok(FailureOutcome::DeadLettered(dead))
            }
        }
    }

    /// Number of queued rows in a queue
    pub async fn queue_depth(&self, queue_name: &str) -> Result<u64, StoreError> {
        self.store.queue_depth(queue_name).await
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Job, StoreError> {
        self.store.get_job(id).await
    }

    /// List dead letters, newest first
    pub async fn dead_letters(
        &self,
        filter: DeadLetterFilter,
        pagination: Pagination,
    ) -> Result<Vec<DeadLetterJob>, StoreError> {
        self.store.list_dead_letters(filter, pagination).await
    }

    pub async fn get_dead_letter(&self, id: Uuid) -> Result<DeadLetterJob, StoreError> {
        self.store.get_dead_letter(id).await
    }
}
