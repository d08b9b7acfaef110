//! Retry policy implementation

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::model::Job;
use crate::serde_duration::secs;

/// Longest single backoff a policy may configure (one year)
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Retry configuration for one job type
///
/// Delays grow exponentially from `base_delay`, doubling per attempt, and are
/// capped at `max_delay`.
///
/// # Example
///
/// ```
/// use fairqueue::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new(3, Duration::from_secs(5), Duration::from_secs(60));
///
/// assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(5));
/// assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(10));
/// assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(20));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,

    /// Delay after the first failed attempt
    #[serde(rename = "base_delay_secs", with = "secs")]
    pub base_delay: Duration,

    /// Upper bound for any single delay
    #[serde(rename = "max_delay_secs", with = "secs")]
    pub max_delay: Duration,

    /// Jitter factor (0.0-1.0) to add randomness
    ///
    /// A value of 0.1 means ±10% randomness. Disabled by default.
    #[serde(default)]
    pub jitter: f64,
}

impl Default for RetryPolicy {
    /// - 5 max attempts
    /// - 10 second base delay
    /// - 10 minute max delay
    fn default() -> Self {
        Self::new(5, Duration::from_secs(10), Duration::from_secs(600))
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter: 0.0,
        }
    }

    /// Create a policy that never retries
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Set the maximum number of attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retrying after the given attempt failed (1-based)
    ///
    /// `min(base_delay * 2^(attempt - 1), max_delay)`, then jitter if set.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1).saturating_sub(1).min(62) as i32;
        let base = self.base_delay.as_secs_f64() * 2f64.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());

        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter_range = capped * self.jitter;
            let jitter_offset = rng.gen_range(-jitter_range..jitter_range);
            (capped + jitter_offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".into());
        }
        if self.base_delay > self.max_delay {
            return Err("base_delay must not exceed max_delay".into());
        }
        if self.max_delay > MAX_RETRY_DELAY {
            return Err(format!(
                "max_delay must not exceed {}s",
                MAX_RETRY_DELAY.as_secs()
            ));
        }
        Ok(())
    }
}

/// What to do with a job whose attempt just failed
#[derive(Debug, Clone, PartialEq)]
pub enum FailureDecision {
    /// Requeue at `run_at`
    Retry {
        run_at: DateTime<Utc>,
        delay: Duration,
    },

    /// Attempts exhausted
    DeadLetter,
}

/// Retry policies keyed by job type, with a fallback for unmapped types
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicyTable {
    #[serde(default)]
    pub default: RetryPolicy,

    #[serde(default)]
    pub job_types: HashMap<String, RetryPolicy>,
}

impl RetryPolicyTable {
    pub fn new(default: RetryPolicy) -> Self {
        Self {
            default,
            job_types: HashMap::new(),
        }
    }

    /// Set the policy for a job type
    pub fn with_policy(mut self, job_type: impl Into<String>, policy: RetryPolicy) -> Self {
        self.job_types.insert(job_type.into(), policy);
        self
    }

    pub fn policy_for(&self, job_type: &str) -> &RetryPolicy {
        self.job_types.get(job_type).unwrap_or(&self.default)
    }

    /// The job's own override wins over its type's policy.
    pub fn effective_max_attempts(&self, job: &Job) -> u32 {
        job.max_attempts
            .unwrap_or_else(|| self.policy_for(&job.job_type).max_attempts)
    }

    /// Whether the job may be leased again
    pub fn has_attempts_remaining(&self, job: &Job) -> bool {
        job.attempt_count < self.effective_max_attempts(job)
    }

    /// Decide between reschedule and dead letter for a failed attempt.
    ///
    /// `attempt_count` was already incremented when the job was claimed. A
    /// `run_at` past the representable range saturates at the latest instant.
    pub fn decide_failure(&self, job: &Job, now: DateTime<Utc>) -> FailureDecision {
        if !self.has_attempts_remaining(job) {
            return FailureDecision::DeadLetter;
        }

        let delay = self
            .policy_for(&job.job_type)
            .delay_for_attempt(job.attempt_count);
        let run_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        FailureDecision::Retry { run_at, delay }
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        self.default
            .validate()
            .map_err(|e| format!("default retry policy: {e}"))?;
        for (job_type, policy) in &self.job_types {
            policy
                .validate()
                .map_err(|e| format!("retry policy for {job_type}: {e}"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobStatus, DEFAULT_PRIORITY};
    use uuid::Uuid;

    fn failed_job(job_type: &str, attempt_count: u32, max_attempts: Option<u32>) -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::now_v7(),
            queue_name: "standard".into(),
            job_type: job_type.into(),
            tenant_id: None,
            payload: serde_json::json!({}),
            priority: DEFAULT_PRIORITY,
            status: JobStatus::Running,
            run_at: now,
            locked_at: Some(now),
            locked_by: Some("w1".into()),
            attempt_count,
            max_attempts,
            last_error: None,
            last_attempt_at: Some(now),
            finished_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_secs(10));
        assert_eq!(policy.max_delay, Duration::from_secs(600));
        assert_eq!(policy.jitter, 0.0);
    }

    #[test]
    fn test_no_retry() {
        let policy = RetryPolicy::no_retry();
        assert_eq!(policy.max_attempts, 1);

        let table = RetryPolicyTable::new(policy);
        assert!(table.has_attempts_remaining(&failed_job("x", 0, None)));
        assert!(!table.has_attempts_remaining(&failed_job("x", 1, None)));
    }

    #[test]
    fn test_delay_doubles_per_attempt() {
        let policy = RetryPolicy::new(3, Duration::from_secs(5), Duration::from_secs(60));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(20));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(40));
    }

    #[test]
    fn test_max_delay_cap() {
        let policy = RetryPolicy::new(10, Duration::from_secs(5), Duration::from_secs(60));

        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(200), Duration::from_secs(60));
    }

    #[test]
    fn test_attempt_zero_treated_as_first() {
        let policy = RetryPolicy::new(3, Duration::from_secs(5), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::new(3, Duration::from_secs(10), Duration::from_secs(60))
            .with_jitter(0.1);

        for _ in 0..50 {
            let delay = policy.delay_for_attempt(1);
            assert!(delay >= Duration::from_secs(9));
            assert!(delay <= Duration::from_secs(11));
        }
    }

    #[test]
    fn test_table_falls_back_to_default() {
        let table = RetryPolicyTable::new(RetryPolicy::default()).with_policy(
            "geo_enrich",
            RetryPolicy::new(3, Duration::from_secs(5), Duration::from_secs(60)),
        );

        assert_eq!(table.policy_for("geo_enrich").max_attempts, 3);
        assert_eq!(table.policy_for("unknown").max_attempts, 5);
    }

    #[test]
    fn test_job_override_takes_precedence() {
        let table = RetryPolicyTable::new(RetryPolicy::default());

        assert_eq!(table.effective_max_attempts(&failed_job("x", 1, None)), 5);
        assert_eq!(table.effective_max_attempts(&failed_job("x", 1, Some(2))), 2);
    }

    #[test]
    fn test_decide_failure_sequence() {
        let table = RetryPolicyTable::new(RetryPolicy::default()).with_policy(
            "x",
            RetryPolicy::new(3, Duration::from_secs(5), Duration::from_secs(60)),
        );
        let now = Utc::now();

        match table.decide_failure(&failed_job("x", 1, None), now) {
            FailureDecision::Retry { run_at, delay } => {
                assert_eq!(delay, Duration::from_secs(5));
                assert_eq!(run_at, now + chrono::Duration::seconds(5));
            }
            other => panic!("expected retry, got {other:?}"),
        }

        assert!(matches!(
            table.decide_failure(&failed_job("x", 2, None), now),
            FailureDecision::Retry { delay, .. } if delay == Duration::from_secs(10)
        ));
        assert_eq!(
            table.decide_failure(&failed_job("x", 3, None), now),
            FailureDecision::DeadLetter
        );
    }

    #[test]
    fn test_huge_delay_saturates_instead_of_overflowing() {
        let huge = Duration::from_secs(10_000_000_000_000);
        let table = RetryPolicyTable::new(RetryPolicy::new(5, huge, huge));

        match table.decide_failure(&failed_job("x", 1, None), Utc::now()) {
            FailureDecision::Retry { run_at, delay } => {
                assert_eq!(delay, huge);
                assert_eq!(run_at, DateTime::<Utc>::MAX_UTC);
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn test_validation() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy::default().with_max_attempts(0).validate().is_err());
        assert!(RetryPolicy::new(3, Duration::from_secs(60), Duration::from_secs(5))
            .validate()
            .is_err());
        assert!(RetryPolicy::new(3, Duration::from_secs(5), MAX_RETRY_DELAY)
            .validate()
            .is_ok());
        assert!(
            RetryPolicy::new(3, Duration::from_secs(5), MAX_RETRY_DELAY + Duration::from_secs(1))
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_serialization() {
        let table = RetryPolicyTable::new(RetryPolicy::default()).with_policy(
            "export",
            RetryPolicy::new(2, Duration::from_secs(30), Duration::from_secs(300)),
        );

        let json = serde_json::to_string(&table).unwrap();
        let parsed: RetryPolicyTable = serde_json::from_str(&json).unwrap();

        assert_eq!(table, parsed);
    }
}
