//! Job and dead-letter records
//!
//! A [`Job`] row is created by enqueue, leased by the claim transaction and
//! then either succeeds, is rescheduled, or is moved to the dead-letter table
//! as a [`DeadLetterJob`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default priority for enqueued jobs. Lower values are more urgent.
pub const DEFAULT_PRIORITY: i32 = 100;

/// Job status
///
/// Dead-lettered jobs are not a status: the row is deleted and copied into
/// the dead-letter table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `run_at` and a free lease
    Queued,
    /// Leased by a worker
    Running,
    /// Finished successfully (terminal)
    Succeeded,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A persisted job row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub queue_name: String,
    pub job_type: String,
    pub tenant_id: Option<String>,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub status: JobStatus,
    pub run_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub attempt_count: u32,
    /// Per-job override of the job type's retry budget
    pub max_attempts: Option<u32>,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// The lease currently held on this row, if any.
    pub fn lease(&self) -> Option<Lease> {
        match (&self.locked_by, self.locked_at) {
            (Some(worker_id), Some(locked_at)) => Some(Lease {
                job_id: self.id,
                worker_id: worker_id.clone(),
                locked_at,
            }),
            _ => None,
        }
    }

    /// Whether the row carries a lease that is still valid at `now`.
    pub fn has_valid_lease(&self, now: DateTime<Utc>, lock_timeout: Duration) -> bool {
        match self.locked_at {
            Some(locked_at) => locked_at >= lease_cutoff(now, lock_timeout),
            None => false,
        }
    }

    /// Time the job spent between creation and `now`
    pub fn wait_time(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or_default()
    }
}

/// Leases taken strictly before the returned instant have expired.
pub fn lease_cutoff(now: DateTime<Utc>, lock_timeout: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lock_timeout)
        .ok()
        .and_then(|timeout| now.checked_sub_signed(timeout))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Exclusive, time-bounded ownership of a job by one worker
///
/// `locked_at` doubles as a fencing token: every claim writes a fresh value,
/// so outcome writes conditioned on it are rejected once another worker has
/// reclaimed the row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub job_id: Uuid,
    pub worker_id: String,
    pub locked_at: DateTime<Utc>,
}

/// A job ready to be inserted (queue already resolved)
#[derive(Debug, Clone)]
pub struct NewJob {
    pub queue_name: String,
    pub job_type: String,
    pub tenant_id: Option<String>,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub run_at: DateTime<Utc>,
    pub max_attempts: Option<u32>,
}

/// A job that exhausted its retry budget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterJob {
    pub id: Uuid,
    pub original_job_id: Uuid,
    pub queue_name: String,
    pub job_type: String,
    pub tenant_id: Option<String>,
    pub payload: serde_json::Value,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub failed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl DeadLetterJob {
    /// Build the dead-letter copy of `job`, failed at `now` with `error`.
    pub fn from_job(job: &Job, error: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            original_job_id: job.id,
            queue_name: job.queue_name.clone(),
            job_type: job.job_type.clone(),
            tenant_id: job.tenant_id.clone(),
            payload: job.payload.clone(),
            attempt_count: job.attempt_count,
            last_error: Some(error.to_string()),
            last_attempt_at: job.last_attempt_at,
            failed_at: now,
            created_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(now: DateTime<Utc>) -> Job {
        Job {
            id: Uuid::now_v7(),
            queue_name: "standard".into(),
            job_type: "x".into(),
            tenant_id: None,
            payload: serde_json::json!({}),
            priority: DEFAULT_PRIORITY,
            status: JobStatus::Queued,
            run_at: now,
            locked_at: None,
            locked_by: None,
            attempt_count: 0,
            max_attempts: None,
            last_error: None,
            last_attempt_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [JobStatus::Queued, JobStatus::Running, JobStatus::Succeeded] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("dead".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_lease_requires_both_fields() {
        let now = Utc::now();
        let mut job = job(now);
        assert!(job.lease().is_none());

        job.locked_by = Some("w1".into());
        assert!(job.lease().is_none());

        job.locked_at = Some(now);
        let lease = job.lease().unwrap();
        assert_eq!(lease.worker_id, "w1");
        assert_eq!(lease.locked_at, now);
    }

    #[test]
    fn test_lease_validity_window() {
        let now = Utc::now();
        let mut job = job(now);
        job.locked_at = Some(now - chrono::Duration::seconds(30));

        assert!(job.has_valid_lease(now, Duration::from_secs(60)));
        assert!(job.has_valid_lease(now, Duration::from_secs(30)));
        assert!(!job.has_valid_lease(now, Duration::from_secs(29)));
        assert!(!job.has_valid_lease(now, Duration::from_secs(10)));
    }

    #[test]
    fn test_dead_letter_copy_preserves_identity() {
        let now = Utc::now();
        let mut job = job(now);
        job.attempt_count = 3;
        job.tenant_id = Some("acme".into());

        let dead = DeadLetterJob::from_job(&job, "boom", now);
        assert_eq!(dead.original_job_id, job.id);
        assert_eq!(dead.attempt_count, 3);
        assert_eq!(dead.last_error.as_deref(), Some("boom"));
        assert_eq!(dead.tenant_id.as_deref(), Some("acme"));
        assert_eq!(dead.failed_at, now);
    }
}
