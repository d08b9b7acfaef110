//! PostgreSQL implementation of JobStore
//!
//! Production persistence using PostgreSQL with:
//! - Claim-and-lease in one transaction using `FOR UPDATE SKIP LOCKED`
//! - Outcome writes conditioned on the lease (status, locked_by, locked_at)
//! - Timestamps bound from the scheduler's clock, never `NOW()`

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use super::store::*;
use crate::model::{lease_cutoff, DeadLetterJob, Job, JobStatus, Lease, NewJob};
use crate::scheduler::{ClaimDecision, ClaimPlanner, TENANT_THROTTLED};

/// PostgreSQL implementation of JobStore
///
/// # Example
///
/// ```ignore
/// use fairqueue::PostgresJobStore;
///
/// let store = PostgresJobStore::connect("postgres://localhost/fairqueue").await?;
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect with a default-sized pool
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(db_error("connect"))?;
        Ok(Self::new(pool))
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Migration failed: {}", e);
                StoreError::Database(format!("migration failed: {e}"))
            })?;
        Ok(())
    }

    /// Distinguish a vanished row from a lease held by someone else
    async fn lease_miss(&self, lease: &Lease) -> StoreError {
        let exists = sqlx::query("SELECT 1 FROM fq_jobs WHERE id = $1")
            .bind(lease.job_id)
            .fetch_optional(&self.pool)
            .await;

        match exists {
            Ok(Some(_)) => {
                warn!(job_id = %lease.job_id, worker_id = %lease.worker_id, "lease lost");
                StoreError::lease_lost(lease)
            }
            Ok(None) => StoreError::JobNotFound(lease.job_id),
            Err(e) => db_error("check job existence")(e),
        }
    }
}

fn db_error(operation: &'static str) -> impl Fn(sqlx::Error) -> StoreError {
    move |e| {
        error!("Failed to {}: {}", operation, e);
        StoreError::Database(e.to_string())
    }
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column)
        .map_err(|e| StoreError::Serialization(format!("column {column}: {e}")))
}

fn parse_job_status(s: &str) -> Result<JobStatus, StoreError> {
    s.parse().map_err(StoreError::Serialization)
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let status: String = get(row, "status")?;
    Ok(Job {
        id: get(row, "id")?,
        queue_name: get(row, "queue_name")?,
        job_type: get(row, "job_type")?,
        tenant_id: get(row, "tenant_id")?,
        payload: get(row, "payload")?,
        priority: get(row, "priority")?,
        status: parse_job_status(&status)?,
        run_at: get(row, "run_at")?,
        locked_at: get(row, "locked_at")?,
        locked_by: get(row, "locked_by")?,
        attempt_count: get::<i32>(row, "attempt_count")? as u32,
        max_attempts: get::<Option<i32>>(row, "max_attempts")?.map(|m| m as u32),
        last_error: get(row, "last_error")?,
        last_attempt_at: get(row, "last_attempt_at")?,
        finished_at: get(row, "finished_at")?,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

fn dead_letter_from_row(row: &PgRow) -> Result<DeadLetterJob, StoreError> {
    Ok(DeadLetterJob {
        id: get(row, "id")?,
        original_job_id: get(row, "original_job_id")?,
        queue_name: get(row, "queue_name")?,
        job_type: get(row, "job_type")?,
        tenant_id: get(row, "tenant_id")?,
        payload: get(row, "payload")?,
        attempt_count: get::<i32>(row, "attempt_count")? as u32,
        last_error: get(row, "last_error")?,
        last_attempt_at: get(row, "last_attempt_at")?,
        failed_at: get(row, "failed_at")?,
        created_at: get(row, "created_at")?,
    })
}

/// Copy a job into the dead-letter table and delete it, inside `tx`
async fn move_to_dead_letter(
    tx: &mut Transaction<'_, Postgres>,
    job: &Job,
    error: &str,
    now: DateTime<Utc>,
) -> Result<DeadLetterJob, StoreError> {
    let dead = DeadLetterJob::from_job(job, error, now);

    sqlx::query(
        r#"
        INSERT INTO fq_dead_letter_jobs (
            id, original_job_id, queue_name, job_type, tenant_id, payload,
            attempt_count, last_error, last_attempt_at, failed_at, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(dead.id)
    .bind(dead.original_job_id)
    .bind(&dead.queue_name)
    .bind(&dead.job_type)
    .bind(&dead.tenant_id)
    .bind(&dead.payload)
    .bind(dead.attempt_count as i32)
    .bind(&dead.last_error)
    .bind(dead.last_attempt_at)
    .bind(dead.failed_at)
    .bind(dead.created_at)
    .execute(&mut **tx)
    .await
    .map_err(db_error("insert dead letter"))?;

    sqlx::query("DELETE FROM fq_jobs WHERE id = $1")
        .bind(job.id)
        .execute(&mut **tx)
        .await
        .map_err(db_error("delete dead-lettered job"))?;

    debug!(job_id = %job.id, dead_letter_id = %dead.id, error, "moved job to dead letter");
    Ok(dead)
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(queue = %job.queue_name, job_type = %job.job_type))]
    async fn insert(&self, job: NewJob, now: DateTime<Utc>) -> Result<Job, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO fq_jobs (
                id, queue_name, job_type, tenant_id, payload, priority, status,
                run_at, attempt_count, max_attempts, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'queued', $7, 0, $8, $9, $9)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(&job.queue_name)
        .bind(&job.job_type)
        .bind(&job.tenant_id)
        .bind(&job.payload)
        .bind(job.priority)
        .bind(job.run_at)
        .bind(job.max_attempts.map(|m| m as i32))
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("insert job"))?;

        let job = job_from_row(&row)?;
        debug!(job_id = %job.id, "inserted job");
        Ok(job)
    }

    #[instrument(skip(self, request, planner), fields(queue = %request.queue_name, worker_id = %request.worker_id))]
    async fn claim(
        &self,
        request: ClaimRequest,
        planner: &mut ClaimPlanner,
    ) -> Result<Vec<Job>, StoreError> {
        if planner.is_full() {
            return Ok(vec![]);
        }

        let now = request.now;
        let cutoff = lease_cutoff(now, request.lock_timeout);
        let mut tx = self.pool.begin().await.map_err(db_error("begin claim"))?;

        // Candidates stay row-locked until commit; concurrent claimers skip them
        let rows = sqlx::query(
            r#"
            SELECT *
            FROM fq_jobs
            WHERE queue_name = $1
              AND run_at <= $2
              AND (
                    (status = 'queued' AND (locked_at IS NULL OR locked_at < $3))
                 OR (status = 'running' AND locked_at < $3)
              )
            ORDER BY priority, run_at, created_at, id
            LIMIT $4
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(&request.queue_name)
        .bind(now)
        .bind(cutoff)
        .bind(request.fetch_limit as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_error("select claim candidates"))?;

        let mut claimed = Vec::new();
        for row in rows {
            if planner.is_full() {
                break;
            }
            let candidate = job_from_row(&row)?;

            match planner.decide(&candidate, now) {
                ClaimDecision::Lease => {
                    let row = sqlx::query(
                        r#"
                        UPDATE fq_jobs
                        SET status = 'running',
                            locked_at = $2,
                            locked_by = $3,
                            last_attempt_at = $2,
                            attempt_count = attempt_count + 1,
                            updated_at = $2
                        WHERE id = $1
                        RETURNING *
                        "#,
                    )
                    .bind(candidate.id)
                    .bind(now)
                    .bind(&request.worker_id)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(db_error("lease job"))?;
                    claimed.push(job_from_row(&row)?);
                }
                ClaimDecision::SkipCapped => {}
                ClaimDecision::Throttle { run_at } => {
                    sqlx::query(
                        r#"
                        UPDATE fq_jobs
                        SET status = 'queued',
                            locked_at = NULL,
                            locked_by = NULL,
                            run_at = $2,
                            last_error = $3,
                            updated_at = $4
                        WHERE id = $1
                        "#,
                    )
                    .bind(candidate.id)
                    .bind(run_at)
                    .bind(TENANT_THROTTLED)
                    .bind(now)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_error("defer throttled job"))?;
                }
                ClaimDecision::DeadLetter { error } => {
                    move_to_dead_letter(&mut tx, &candidate, error, now).await?;
                }
            }
        }

        tx.commit().await.map_err(db_error("commit claim"))?;

        if !claimed.is_empty() {
            debug!(count = claimed.len(), "claimed jobs");
        }
        Ok(claimed)
    }

    #[instrument(skip(self, lease), fields(job_id = %lease.job_id))]
    async fn complete(&self, lease: &Lease, now: DateTime<Utc>) -> Result<Job, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE fq_jobs
            SET status = 'succeeded',
                finished_at = $4,
                locked_at = NULL,
                locked_by = NULL,
                last_error = NULL,
                updated_at = $4
            WHERE id = $1 AND status = 'running' AND locked_by = $2 AND locked_at = $3
            RETURNING *
            "#,
        )
        .bind(lease.job_id)
        .bind(&lease.worker_id)
        .bind(lease.locked_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("complete job"))?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(self.lease_miss(lease).await),
        }
    }

    #[instrument(skip(self, lease, error), fields(job_id = %lease.job_id))]
    async fn reschedule(
        &self,
        lease: &Lease,
        run_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE fq_jobs
            SET status = 'queued',
                run_at = $4,
                locked_at = NULL,
                locked_by = NULL,
                last_error = $5,
                updated_at = $6
            WHERE id = $1 AND status = 'running' AND locked_by = $2 AND locked_at = $3
            RETURNING *
            "#,
        )
        .bind(lease.job_id)
        .bind(&lease.worker_id)
        .bind(lease.locked_at)
        .bind(run_at)
        .bind(error)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("reschedule job"))?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(self.lease_miss(lease).await),
        }
    }

    #[instrument(skip(self, lease, error), fields(job_id = %lease.job_id))]
    async fn dead_letter(
        &self,
        lease: &Lease,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<DeadLetterJob, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error("begin dead letter"))?;

        let row = sqlx::query(
            r#"
            SELECT *
            FROM fq_jobs
            WHERE id = $1 AND status = 'running' AND locked_by = $2 AND locked_at = $3
            FOR UPDATE
            "#,
        )
        .bind(lease.job_id)
        .bind(&lease.worker_id)
        .bind(lease.locked_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("lock job for dead letter"))?;

        let Some(row) = row else {
            drop(tx);
            return Err(self.lease_miss(lease).await);
        };

        let job = job_from_row(&row)?;
        let dead = move_to_dead_letter(&mut tx, &job, error, now).await?;
        tx.commit().await.map_err(db_error("commit dead letter"))?;
        Ok(dead)
    }

    #[instrument(skip(self))]
    async fn get_job(&self, id: Uuid) -> Result<Job, StoreError> {
        let row = sqlx::query("SELECT * FROM fq_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("get job"))?
            .ok_or(StoreError::JobNotFound(id))?;
        job_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn queue_depth(&self, queue_name: &str) -> Result<u64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS depth FROM fq_jobs WHERE queue_name = $1 AND status = 'queued'",
        )
        .bind(queue_name)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("count queued jobs"))?;

        Ok(get::<i64>(&row, "depth")?.max(0) as u64)
    }

    #[instrument(skip(self))]
    async fn list_dead_letters(
        &self,
        filter: DeadLetterFilter,
        pagination: Pagination,
    ) -> Result<Vec<DeadLetterJob>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT *
            FROM fq_dead_letter_jobs
            WHERE ($1::text IS NULL OR queue_name = $1)
              AND ($2::text IS NULL OR tenant_id = $2)
              AND ($3::text IS NULL OR job_type = $3)
            ORDER BY failed_at DESC, id DESC
            OFFSET $4
            LIMIT $5
            "#,
        )
        .bind(&filter.queue_name)
        .bind(&filter.tenant_id)
        .bind(&filter.job_type)
        .bind(pagination.offset as i64)
        .bind(pagination.limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list dead letters"))?;

        rows.iter().map(dead_letter_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn get_dead_letter(&self, id: Uuid) -> Result<DeadLetterJob, StoreError> {
        let row = sqlx::query("SELECT * FROM fq_dead_letter_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("get dead letter"))?
            .ok_or(StoreError::DeadLetterNotFound(id))?;
        dead_letter_from_row(&row)
    }
}
