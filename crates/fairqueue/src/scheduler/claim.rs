//! Per-candidate claim decisions
//!
//! A [`ClaimPlanner`] is created for one claim call and consulted by the store
//! for every candidate row, in priority order, inside the claim transaction.
//! It tracks the batch's per-tenant grants, so the fairness cap applies to the
//! batch being built.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::config::TenantLimits;
use crate::model::{Job, JobStatus};
use crate::reliability::{RateLimiter, RetryPolicyTable};

/// `last_error` written on throttled candidates
pub const TENANT_THROTTLED: &str = "tenant_throttled";

/// `last_error` for an expired lease on a job with no attempts left
pub const LEASE_EXPIRED: &str = "lease_expired";

/// `last_error` for a queued row whose attempt budget is already spent
pub const ATTEMPTS_EXHAUSTED: &str = "attempts_exhausted";

/// What the store must do with one candidate row
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimDecision {
    /// Grant the lease and return the job
    Lease,

    /// Tenant already holds its share of this batch; leave the row untouched
    SkipCapped,

    /// Tenant is over its rate; requeue at `run_at` without using an attempt.
    ///
    /// `run_at` is `now` plus the limiter's retry-after rounded up to whole
    /// seconds, never less than one second.
    Throttle { run_at: DateTime<Utc> },

    /// No attempts left; move the row to the dead-letter table
    DeadLetter { error: &'static str },
}

/// A candidate deferred by the rate limiter
#[derive(Debug, Clone, PartialEq)]
pub struct ThrottledJob {
    pub job_id: Uuid,
    pub tenant_id: String,
    pub run_at: DateTime<Utc>,
}

/// Admission control for a single claim batch
pub struct ClaimPlanner {
    queue_name: String,
    limit: usize,
    tenant_limits: Option<TenantLimits>,
    limiter: Arc<dyn RateLimiter>,
    retry: Arc<RetryPolicyTable>,
    in_flight: HashMap<String, u32>,
    accepted: usize,
    throttled: Vec<ThrottledJob>,
    dead_lettered: Vec<Job>,
}

impl std::fmt::Debug for ClaimPlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimPlanner")
            .field("queue_name", &self.queue_name)
            .field("limit", &self.limit)
            .field("tenant_limits", &self.tenant_limits)
            .field("accepted", &self.accepted)
            .finish_non_exhaustive()
    }
}

impl ClaimPlanner {
    pub fn new(
        queue_name: impl Into<String>,
        limit: usize,
        tenant_limits: Option<TenantLimits>,
        limiter: Arc<dyn RateLimiter>,
        retry: Arc<RetryPolicyTable>,
    ) -> Self {
        Self {
            queue_name: queue_name.into(),
            limit,
            tenant_limits,
            limiter,
            retry,
            in_flight: HashMap::new(),
            accepted: 0,
            throttled: Vec::new(),
            dead_lettered: Vec::new(),
        }
    }

    /// Jobs granted so far
    pub fn accepted(&self) -> usize {
        self.accepted
    }

    /// Whether the batch has reached its limit
    pub fn is_full(&self) -> bool {
        self.accepted >= self.limit
    }

    /// Candidates deferred by the rate limiter in this batch
    pub fn throttled(&self) -> &[ThrottledJob] {
        &self.throttled
    }

    /// Rows dead-lettered in this batch because no attempts were left
    pub fn dead_lettered(&self) -> &[Job] {
        &self.dead_lettered
    }

    /// Decide the fate of one candidate row.
    ///
    /// A `Lease` decision is counted against the batch; the caller must apply
    /// it or abort the whole transaction.
    pub fn decide(&mut self, job: &Job, now: DateTime<Utc>) -> ClaimDecision {
        if !self.retry.has_attempts_remaining(job) {
            let error = match job.status {
                JobStatus::Running => LEASE_EXPIRED,
                _ => ATTEMPTS_EXHAUSTED,
            };
            debug!(job_id = %job.id, attempts = job.attempt_count, error, "no attempts left");
            self.dead_lettered.push(job.clone());
            return ClaimDecision::DeadLetter { error };
        }

        if let (Some(tenant), Some(limits)) = (job.tenant_id.as_deref(), self.tenant_limits) {
            let held = self.in_flight.get(tenant).copied().unwrap_or(0);
            if held >= limits.max_in_flight {
                debug!(job_id = %job.id, tenant, held, "tenant at fairness cap");
                return ClaimDecision::SkipCapped;
            }

            let key = format!("{}:{}", self.queue_name, tenant);
            let decision = self.limiter.allow(
                &key,
                limits.burst as f64,
                limits.refill_per_sec(),
                now,
            );
            if !decision.allowed {
                let secs = decision.retry_after.as_secs_f64().ceil().max(1.0) as i64;
                let run_at = now + chrono::Duration::seconds(secs);
                debug!(job_id = %job.id, tenant, %run_at, "tenant throttled");
                self.throttled.push(ThrottledJob {
                    job_id: job.id,
                    tenant_id: tenant.to_string(),
                    run_at,
                });
                return ClaimDecision::Throttle { run_at };
            }

            *self.in_flight.entry(tenant.to_string()).or_insert(0) += 1;
        }

        self.accepted += 1;
        ClaimDecision::Lease
    }
}
