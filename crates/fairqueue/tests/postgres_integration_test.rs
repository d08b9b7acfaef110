//! Integration tests for PostgresJobStore
//!
//! Run with: cargo test -p fairqueue --test postgres_integration_test -- --test-threads=1
//!
//! Requirements:
//! - PostgreSQL reachable through DATABASE_URL (tests are skipped when unset)
//! - Migrations are applied by the tests themselves

use std::sync::Arc;
use std::time::Duration;

use chrono::{SubsecRound, Utc};
use serde_json::json;
use uuid::Uuid;

use fairqueue::prelude::*;
use fairqueue::scheduler::{LEASE_EXPIRED, TENANT_THROTTLED};

/// Test database URL, if one is configured
fn get_database_url() -> Option<String> {
    std::env::var("DATABASE_URL").ok()
}

/// Connect and migrate, or `None` when no database is configured
async fn create_test_store() -> Option<Arc<PostgresJobStore>> {
    let Some(database_url) = get_database_url() else {
        eprintln!("DATABASE_URL not set, skipping PostgreSQL test");
        return None;
    };
    let store = PostgresJobStore::connect(&database_url)
        .await
        .expect("Failed to connect to PostgreSQL");
    store.migrate().await.expect("Failed to run migrations");
    Some(Arc::new(store))
}

/// Queue name private to one test run
fn unique_queue() -> String {
    format!("test-{}", Uuid::now_v7().simple())
}

struct Fixture {
    store: Arc<PostgresJobStore>,
    clock: Arc<ManualClock>,
    scheduler: Scheduler,
    queue: String,
}

impl Fixture {
    async fn new(configure: impl FnOnce(SchedulerConfig, &str) -> SchedulerConfig) -> Option<Self> {
        let store = create_test_store().await?;
        let queue = unique_queue();
        let config = configure(
            SchedulerConfig::default()
                .with_queues([queue.clone()])
                .with_default_queue(queue.clone()),
            &queue,
        );

        // PostgreSQL keeps microseconds
        let clock = Arc::new(ManualClock::new(Utc::now().trunc_subsecs(6)));
        let scheduler = Scheduler::new(store.clone(), config)
            .expect("valid config")
            .with_clock(clock.clone());

        Some(Self {
            store,
            clock,
            scheduler,
            queue,
        })
    }

    async fn enqueue(&self, request: EnqueueRequest) -> Job {
        self.scheduler
            .enqueue(request.with_queue(self.queue.clone()))
            .await
            .expect("Failed to enqueue")
    }

    async fn claim(&self, limit: usize, worker_id: &str) -> Vec<Job> {
        self.scheduler
            .claim(&self.queue, limit, worker_id)
            .await
            .expect("Failed to claim")
    }

    /// Delete every row this test created
    async fn cleanup(&self) {
        sqlx::query("DELETE FROM fq_dead_letter_jobs WHERE queue_name = $1")
            .bind(&self.queue)
            .execute(self.store.pool())
            .await
            .ok();
        sqlx::query("DELETE FROM fq_jobs WHERE queue_name = $1")
            .bind(&self.queue)
            .execute(self.store.pool())
            .await
            .ok();
    }
}

// ============================================
// Enqueue and Claim
// ============================================

#[tokio::test]
async fn test_enqueue_and_get_job() {
    let Some(fx) = Fixture::new(|c, _| c).await else {
        return;
    };

    let job = fx
        .enqueue(
            EnqueueRequest::new("x", json!({"order_id": "123"}))
                .with_tenant("acme")
                .with_priority(7)
                .with_max_attempts(4),
        )
        .await;

    let stored = fx.scheduler.get_job(job.id).await.expect("Failed to get job");
    assert_eq!(stored, job);
    assert_eq!(stored.status, JobStatus::Queued);
    assert_eq!(stored.payload, json!({"order_id": "123"}));
    assert_eq!(stored.tenant_id.as_deref(), Some("acme"));
    assert_eq!(stored.priority, 7);
    assert_eq!(stored.max_attempts, Some(4));
    assert_eq!(stored.attempt_count, 0);
    assert_eq!(stored.run_at, fx.clock.now());
    assert_eq!(fx.scheduler.queue_depth(&fx.queue).await.unwrap(), 1);

    assert!(matches!(
        fx.scheduler.get_job(Uuid::now_v7()).await,
        Err(StoreError::JobNotFound(_))
    ));

    fx.cleanup().await;
}

#[tokio::test]
async fn test_claim_sets_lease_and_orders_by_priority() {
    let Some(fx) = Fixture::new(|c, _| c).await else {
        return;
    };

    let normal = fx.enqueue(EnqueueRequest::new("x", json!({}))).await;
    fx.clock.advance(Duration::from_millis(5));
    let urgent = fx
        .enqueue(EnqueueRequest::new("x", json!({})).with_priority(10))
        .await;

    let claimed = fx.claim(2, "w1").await;
    assert_eq!(claimed.len(), 2);
    assert_eq!(claimed[0].id, urgent.id);
    assert_eq!(claimed[1].id, normal.id);

    for job in &claimed {
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.attempt_count, 1);
        assert_eq!(job.locked_by.as_deref(), Some("w1"));
        assert_eq!(job.locked_at, Some(fx.clock.now()));
        assert_eq!(job.last_attempt_at, Some(fx.clock.now()));
    }
    assert_eq!(fx.scheduler.queue_depth(&fx.queue).await.unwrap(), 0);
    assert!(fx.claim(2, "w2").await.is_empty());

    fx.cleanup().await;
}

#[tokio::test]
async fn test_future_job_waits_for_run_at() {
    let Some(fx) = Fixture::new(|c, _| c).await else {
        return;
    };

    let run_at = fx.clock.now() + chrono::Duration::seconds(30);
    fx.enqueue(EnqueueRequest::new("x", json!({})).with_run_at(run_at))
        .await;

    assert!(fx.claim(1, "w1").await.is_empty());
    fx.clock.advance(Duration::from_secs(30));
    assert_eq!(fx.claim(1, "w1").await.len(), 1);

    fx.cleanup().await;
}

#[tokio::test]
async fn test_concurrent_claims_are_exclusive() {
    let Some(fx) = Fixture::new(|c, _| c).await else {
        return;
    };

    for i in 0..30 {
        fx.enqueue(EnqueueRequest::new("x", json!({ "i": i }))).await;
    }

    let fx = Arc::new(fx);
    let mut handles = Vec::new();
    for w in 0..6 {
        let fx = Arc::clone(&fx);
        handles.push(tokio::spawn(async move {
            let worker_id = format!("w{w}");
            let mut ids = Vec::new();
            loop {
                let claimed = fx.claim(4, &worker_id).await;
                if claimed.is_empty() {
                    break;
                }
                ids.extend(claimed.into_iter().map(|j| j.id));
            }
            ids
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        ids.extend(handle.await.expect("claim task panicked"));
    }
    let total = ids.len();
    ids.sort();
    ids.dedup();
    assert_eq!(total, 30);
    assert_eq!(ids.len(), 30);

    fx.cleanup().await;
}

// ============================================
// Leases and Fencing
// ============================================

#[tokio::test]
async fn test_expired_lease_reclaimed_and_old_owner_fenced() {
    let Some(fx) = Fixture::new(|c, _| c.with_lock_timeout(Duration::from_secs(60))).await else {
        return;
    };

    fx.enqueue(EnqueueRequest::new("x", json!({}))).await;
    let first = fx.claim(1, "A").await.remove(0);

    fx.clock.advance(Duration::from_secs(60));
    assert!(fx.claim(1, "B").await.is_empty());

    fx.clock.advance(Duration::from_secs(1));
    let second = fx.claim(1, "B").await.remove(0);
    assert_eq!(second.id, first.id);
    assert_eq!(second.locked_by.as_deref(), Some("B"));
    assert_eq!(second.attempt_count, 2);

    assert!(matches!(
        fx.scheduler.complete(&first).await,
        Err(StoreError::LeaseLost { .. })
    ));

    let done = fx.scheduler.complete(&second).await.expect("owner completes");
    assert_eq!(done.status, JobStatus::Succeeded);
    assert_eq!(done.finished_at, Some(fx.clock.now()));
    assert!(done.lease().is_none());

    fx.cleanup().await;
}

#[tokio::test]
async fn test_expired_lease_with_no_attempts_left_is_dead_lettered() {
    let Some(fx) = Fixture::new(|c, _| {
        c.with_lock_timeout(Duration::from_secs(60))
            .with_retry_policies(RetryPolicyTable::new(RetryPolicy::no_retry()))
    })
    .await
    else {
        return;
    };

    let job = fx.enqueue(EnqueueRequest::new("x", json!({}))).await;
    fx.claim(1, "A").await;

    fx.clock.advance(Duration::from_secs(61));
    assert!(fx.claim(1, "B").await.is_empty());

    let dead = fx
        .scheduler
        .dead_letters(
            DeadLetterFilter {
                queue_name: Some(fx.queue.clone()),
                ..Default::default()
            },
            Pagination::default(),
        )
        .await
        .unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].original_job_id, job.id);
    assert_eq!(dead[0].last_error.as_deref(), Some(LEASE_EXPIRED));

    fx.cleanup().await;
}

// ============================================
// Retries and Dead Letters
// ============================================

#[tokio::test]
async fn test_retry_backoff_then_dead_letter() {
    let Some(fx) = Fixture::new(|c, _| {
        c.with_retry_policies(RetryPolicyTable::default().with_policy(
            "x",
            RetryPolicy::new(3, Duration::from_secs(5), Duration::from_secs(60)),
        ))
    })
    .await
    else {
        return;
    };

    let job = fx
        .enqueue(EnqueueRequest::new("x", json!({"n": 1})).with_tenant("acme"))
        .await;

    let mut delays = Vec::new();
    let mut dead = None;
    for attempt in 1..=3 {
        let claimed = fx.claim(1, "w1").await.remove(0);
        match fx
            .scheduler
            .fail(&claimed, &format!("fail-{attempt}"))
            .await
            .unwrap()
        {
            FailureOutcome::Rescheduled { job, delay } => {
                assert_eq!(job.status, JobStatus::Queued);
                assert_eq!(job.last_error.as_deref(), Some(format!("fail-{attempt}").as_str()));
                delays.push(delay);
                fx.clock.advance(delay);
            }
            FailureOutcome::DeadLettered(record) => dead = Some(record),
        }
    }

    assert_eq!(delays, vec![Duration::from_secs(5), Duration::from_secs(10)]);

    let dead = dead.expect("third failure dead-letters");
    assert_eq!(dead.original_job_id, job.id);
    assert_eq!(dead.attempt_count, 3);
    assert_eq!(dead.tenant_id.as_deref(), Some("acme"));
    assert_eq!(dead.payload, json!({"n": 1}));
    assert_eq!(dead.last_error.as_deref(), Some("fail-3"));

    assert!(matches!(
        fx.scheduler.get_job(job.id).await,
        Err(StoreError::JobNotFound(_))
    ));
    let fetched = fx.scheduler.get_dead_letter(dead.id).await.unwrap();
    assert_eq!(fetched.original_job_id, job.id);

    assert!(matches!(
        fx.scheduler.get_dead_letter(Uuid::now_v7()).await,
        Err(StoreError::DeadLetterNotFound(_))
    ));

    fx.cleanup().await;
}

// ============================================
// Tenant Admission
// ============================================

#[tokio::test]
async fn test_tenant_throttle_defers_jobs() {
    let Some(fx) = Fixture::new(|c, queue| {
        c.with_tenant_limits(queue, TenantLimits::new(60, 5, 10))
    })
    .await
    else {
        return;
    };

    let mut ids = Vec::new();
    for _ in 0..10 {
        ids.push(
            fx.enqueue(EnqueueRequest::new("x", json!({})).with_tenant("acme"))
                .await
                .id,
        );
    }

    let claimed = fx.claim(10, "w1").await;
    assert_eq!(claimed.len(), 5);

    let now = fx.clock.now();
    let mut throttled = 0;
    for id in ids {
        let job = fx.scheduler.get_job(id).await.unwrap();
        if job.status == JobStatus::Queued {
            throttled += 1;
            assert_eq!(job.last_error.as_deref(), Some(TENANT_THROTTLED));
            assert_eq!(job.attempt_count, 0);
            assert!(job.run_at >= now + chrono::Duration::seconds(1));
            assert!(job.lease().is_none());
        }
    }
    assert_eq!(throttled, 5);

    fx.cleanup().await;
}
