//! In-memory implementation of JobStore for testing

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::store::*;
use crate::model::{DeadLetterJob, Job, JobStatus, Lease, NewJob};
use crate::scheduler::{ClaimDecision, ClaimPlanner, TENANT_THROTTLED};

#[derive(Default)]
struct State {
    jobs: HashMap<Uuid, Job>,
    dead_letters: Vec<DeadLetterJob>,
}

impl State {
    /// Running row still held by exactly this lease
    fn leased_mut(&mut self, lease: &Lease) -> Result<&mut Job, StoreError> {
        let job = self
            .jobs
            .get_mut(&lease.job_id)
            .ok_or(StoreError::JobNotFound(lease.job_id))?;

        let holds = job.status == JobStatus::Running
            && job.locked_by.as_deref() == Some(lease.worker_id.as_str())
            && job.locked_at == Some(lease.locked_at);
        if !holds {
            return Err(StoreError::lease_lost(lease));
        }
        Ok(job)
    }

    fn move_to_dead_letter(
        &mut self,
        id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<DeadLetterJob, StoreError> {
        let job = self.jobs.remove(&id).ok_or(StoreError::JobNotFound(id))?;
        let dead = DeadLetterJob::from_job(&job, error, now);
        self.dead_letters.push(dead.clone());
        Ok(dead)
    }
}

/// In-memory implementation of JobStore
///
/// This is primarily for testing. A single mutex serializes every operation,
/// which gives the same claim exclusivity as row locks in PostgreSQL.
///
/// # Example
///
/// ```
/// use fairqueue::InMemoryJobStore;
///
/// let store = InMemoryJobStore::new();
/// assert_eq!(store.job_count(), 0);
/// ```
#[derive(Default)]
pub struct InMemoryJobStore {
    state: Mutex<State>,
}

impl InMemoryJobStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of job rows (any status)
    pub fn job_count(&self) -> usize {
        self.state.lock().jobs.len()
    }

    /// Number of dead-letter records
    pub fn dead_letter_count(&self) -> usize {
        self.state.lock().dead_letters.len()
    }

    /// Snapshot of every job row, oldest first
    pub fn jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.state.lock().jobs.values().cloned().collect();
        jobs.sort_by_key(|job| (job.created_at, job.id));
        jobs
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.jobs.clear();
        state.dead_letters.clear();
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, new: NewJob, now: DateTime<Utc>) -> Result<Job, StoreError> {
        let job = Job {
            id: Uuid::now_v7(),
            queue_name: new.queue_name,
            job_type: new.job_type,
            tenant_id: new.tenant_id,
            payload: new.payload,
            priority: new.priority,
            status: JobStatus::Queued,
            run_at: new.run_at,
            locked_at: None,
            locked_by: None,
            attempt_count: 0,
            max_attempts: new.max_attempts,
            last_error: None,
            last_attempt_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        };

        self.state.lock().jobs.insert(job.id, job.clone());
        debug!(job_id = %job.id, queue = %job.queue_name, "inserted job");
        Ok(job)
    }

    async fn claim(
        &self,
        request: ClaimRequest,
        planner: &mut ClaimPlanner,
    ) -> Result<Vec<Job>, StoreError> {
        if planner.is_full() {
            return Ok(vec![]);
        }

        let now = request.now;
        let mut state = self.state.lock();

        let mut candidates: Vec<&Job> = state
            .jobs
            .values()
            .filter(|job| {
                job.queue_name == request.queue_name
                    && job.run_at <= now
                    && match job.status {
                        JobStatus::Queued => !job.has_valid_lease(now, request.lock_timeout),
                        JobStatus::Running => {
                            job.locked_at.is_some()
                                && !job.has_valid_lease(now, request.lock_timeout)
                        }
                        JobStatus::Succeeded => false,
                    }
            })
            .collect();
        candidates.sort_by_key(|job| (job.priority, job.run_at, job.created_at, job.id));
        let candidates: Vec<Job> = candidates
            .into_iter()
            .take(request.fetch_limit)
            .cloned()
            .collect();

        let mut claimed = Vec::new();
        for candidate in candidates {
            if planner.is_full() {
                break;
            }

            match planner.decide(&candidate, now) {
                ClaimDecision::Lease => {
                    if let Some(job) = state.jobs.get_mut(&candidate.id) {
                        job.status = JobStatus::Running;
                        job.locked_at = Some(now);
                        job.locked_by = Some(request.worker_id.clone());
                        job.last_attempt_at = Some(now);
                        job.attempt_count += 1;
                        job.updated_at = now;
                        claimed.push(job.clone());
                    }
                }
                ClaimDecision::SkipCapped => {}
                ClaimDecision::Throttle { run_at } => {
                    if let Some(job) = state.jobs.get_mut(&candidate.id) {
                        job.status = JobStatus::Queued;
                        job.locked_at = None;
                        job.locked_by = None;
                        job.run_at = run_at;
                        job.last_error = Some(TENANT_THROTTLED.to_string());
                        job.updated_at = now;
                    }
                }
                ClaimDecision::DeadLetter { error } => {
                    state.move_to_dead_letter(candidate.id, error, now)?;
                }
            }
        }

        if !claimed.is_empty() {
            debug!(
                worker_id = %request.worker_id,
                queue = %request.queue_name,
                count = claimed.len(),
                "claimed jobs"
            );
        }
        Ok(claimed)
    }

    async fn complete(&self, lease: &Lease, now: DateTime<Utc>) -> Result<Job, StoreError> {
        let mut state = self.state.lock();
        let job = state.leased_mut(lease)?;

        job.status = JobStatus::Succeeded;
        job.finished_at = Some(now);
        job.locked_at = None;
        job.locked_by = None;
        job.last_error = None;
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn reschedule(
        &self,
        lease: &Lease,
        run_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let mut state = self.state.lock();
        let job = state.leased_mut(lease)?;

        job.status = JobStatus::Queued;
        job.run_at = run_at;
        job.locked_at = None;
        job.locked_by = None;
        job.last_error = Some(error.to_string());
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn dead_letter(
        &self,
        lease: &Lease,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<DeadLetterJob, StoreError> {
        let mut state = self.state.lock();
        state.leased_mut(lease)?;
        state.move_to_dead_letter(lease.job_id, error, now)
    }

    async fn get_job(&self, id: Uuid) -> Result<Job, StoreError> {
        self.state
            .lock()
            .jobs
            .get(&id)
            .cloned()
            .ok_or(StoreError::JobNotFound(id))
    }

    async fn queue_depth(&self, queue_name: &str) -> Result<u64, StoreError> {
        let depth = self
            .state
            .lock()
            .jobs
            .values()
            .filter(|job| job.queue_name == queue_name && job.status == JobStatus::Queued)
            .count();
        Ok(depth as u64)
    }

    async fn list_dead_letters(
        &self,
        filter: DeadLetterFilter,
        pagination: Pagination,
    ) -> Result<Vec<DeadLetterJob>, StoreError> {
        let state = self.state.lock();
        let mut entries: Vec<&DeadLetterJob> = state
            .dead_letters
            .iter()
            .rev()
            .filter(|dead| filter.matches(dead))
            .collect();
        entries.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));

        Ok(entries
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .cloned()
            .collect())
    }

    async fn get_dead_letter(&self, id: Uuid) -> Result<DeadLetterJob, StoreError> {
        self.state
            .lock()
            .dead_letters
            .iter()
            .find(|dead| dead.id == id)
            .cloned()
            .ok_or(StoreError::DeadLetterNotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DEFAULT_PRIORITY;
    use crate::reliability::{RetryPolicyTable, TokenBucketLimiter};
    use std::sync::Arc;
    use std::time::Duration;

    fn new_job(queue: &str, priority: i32, run_at: DateTime<Utc>) -> NewJob {
        NewJob {
            queue_name: queue.into(),
            job_type: "x".into(),
            tenant_id: None,
            payload: serde_json::json!({"n": 1}),
            priority,
            run_at,
            max_attempts: None,
        }
    }

    fn request(queue: &str, worker: &str, now: DateTime<Utc>) -> ClaimRequest {
        ClaimRequest {
            queue_name: queue.into(),
            worker_id: worker.into(),
            now,
            lock_timeout: Duration::from_secs(60),
            fetch_limit: 50,
        }
    }

    fn planner(limit: usize) -> ClaimPlanner {
        ClaimPlanner::new(
            "standard",
            limit,
            None,
            Arc::new(TokenBucketLimiter::new()),
            Arc::new(RetryPolicyTable::default()),
        )
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let job = store
            .insert(new_job("standard", DEFAULT_PRIORITY, now), now)
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempt_count, 0);

        let fetched = store.get_job(job.id).await.unwrap();
        assert_eq!(fetched, job);
        assert_eq!(store.queue_depth("standard").await.unwrap(), 1);
        assert_eq!(store.queue_depth("bulk").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_claim_sets_lease() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let job = store
            .insert(new_job("standard", DEFAULT_PRIORITY, now), now)
            .await
            .unwrap();

        let claimed = store
            .claim(request("standard", "w1", now), &mut planner(1))
            .await
            .unwrap();

        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, job.id);
        assert_eq!(claimed[0].status, JobStatus::Running);
        assert_eq!(claimed[0].locked_by.as_deref(), Some("w1"));
        assert_eq!(claimed[0].locked_at, Some(now));
        assert_eq!(claimed[0].attempt_count, 1);
        assert_eq!(store.queue_depth("standard").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_claim_skips_future_and_leased_rows() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        store
            .insert(
                new_job("standard", DEFAULT_PRIORITY, now + chrono::Duration::seconds(10)),
                now,
            )
            .await
            .unwrap();
        store
            .insert(new_job("standard", DEFAULT_PRIORITY, now), now)
            .await
            .unwrap();

        let first = store
            .claim(request("standard", "w1", now), &mut planner(10))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        let second = store
            .claim(request("standard", "w2", now), &mut planner(10))
            .await
            .unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_outcome_requires_matching_lease() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        store
            .insert(new_job("standard", DEFAULT_PRIORITY, now), now)
            .await
            .unwrap();
        let claimed = store
            .claim(request("standard", "w1", now), &mut planner(1))
            .await
            .unwrap();
        let lease = claimed[0].lease().unwrap();

        let stale = Lease {
            worker_id: "w2".into(),
            ..lease.clone()
        };
        assert!(matches!(
            store.complete(&stale, now).await,
            Err(StoreError::LeaseLost { .. })
        ));

        let done = store.complete(&lease, now).await.unwrap();
        assert_eq!(done.status, JobStatus::Succeeded);
        assert_eq!(done.finished_at, Some(now));
        assert!(done.lease().is_none());

        // Terminal: the lease is gone
        assert!(matches!(
            store.reschedule(&lease, now, "late", now).await,
            Err(StoreError::LeaseLost { .. })
        ));
    }

    #[tokio::test]
    async fn test_dead_letter_moves_row() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        store
            .insert(new_job("standard", DEFAULT_PRIORITY, now), now)
            .await
            .unwrap();
        let claimed = store
            .claim(request("standard", "w1", now), &mut planner(1))
            .await
            .unwrap();
        let lease = claimed[0].lease().unwrap();

        let dead = store.dead_letter(&lease, "boom", now).await.unwrap();
        assert_eq!(dead.original_job_id, lease.job_id);
        assert_eq!(dead.attempt_count, 1);

        assert!(matches!(
            store.get_job(lease.job_id).await,
            Err(StoreError::JobNotFound(_))
        ));
        assert_eq!(store.get_dead_letter(dead.id).await.unwrap(), dead);
        assert!(matches!(
            store.dead_letter(&lease, "again", now).await,
            Err(StoreError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_dead_letters_filters_and_pages() {
        let store = InMemoryJobStore::new();
        let start = Utc::now();

        for (i, queue) in ["standard", "bulk", "standard"].into_iter().enumerate() {
            let now = start + chrono::Duration::seconds(i as i64);
            store.insert(new_job(queue, DEFAULT_PRIORITY, now), now).await.unwrap();
            let mut planner = ClaimPlanner::new(
                queue,
                1,
                None,
                Arc::new(TokenBucketLimiter::new()),
                Arc::new(RetryPolicyTable::default()),
            );
            let claimed = store
                .claim(request(queue, "w1", now), &mut planner)
                .await
                .unwrap();
            store
                .dead_letter(&claimed[0].lease().unwrap(), &format!("err-{i}"), now)
                .await
                .unwrap();
        }

        let all = store
            .list_dead_letters(DeadLetterFilter::default(), Pagination::default())
            .await
            .unwrap();
        let errors: Vec<_> = all.iter().filter_map(|d| d.last_error.as_deref()).collect();
        assert_eq!(errors, vec!["err-2", "err-1", "err-0"]);

        let standard = store
            .list_dead_letters(
                DeadLetterFilter {
                    queue_name: Some("standard".into()),
                    ..Default::default()
                },
                Pagination {
                    offset: 1,
                    limit: 10,
                },
            )
            .await
            .unwrap();
        assert_eq!(standard.len(), 1);
        assert_eq!(standard[0].last_error.as_deref(), Some("err-0"));
    }
}
