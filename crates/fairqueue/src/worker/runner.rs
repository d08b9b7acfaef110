//! Worker loop
//!
//! One [`Worker`] polls its queues, claims jobs through the scheduler, runs
//! them one at a time and applies the outcome. Several worker processes can
//! share a store; the claim transaction keeps them off each other's jobs.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use super::registry::{HandlerError, HandlerRegistry, HandlerResult};
use crate::config::WorkerConfig;
use crate::metrics::MetricEvent;
use crate::model::Job;
use crate::persistence::StoreError;
use crate::scheduler::Scheduler;

/// Worker errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Worker configured for a queue the scheduler does not know
    #[error("unknown queue: {0}")]
    UnknownQueue(String),
}

/// Single-threaded job worker
///
/// # Example
///
/// ```ignore
/// use fairqueue::prelude::*;
///
/// let registry = Arc::new(HandlerRegistry::new().with_handler("x", |job: Job| async move {
///     Ok(())
/// }));
/// let worker = Worker::new(scheduler, registry, WorkerConfig::from_env())?;
///
/// let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
/// worker.run(shutdown_rx).await;
/// ```
pub struct Worker {
    scheduler: Arc<Scheduler>,
    registry: Arc<HandlerRegistry>,
    worker_id: String,
    queues: Vec<String>,
}

impl Worker {
    /// Create a worker; an empty queue list means every configured queue
    pub fn new(
        scheduler: Arc<Scheduler>,
        registry: Arc<HandlerRegistry>,
        config: WorkerConfig,
    ) -> Result<Self, WorkerError> {
        let queues = if config.queues.is_empty() {
            scheduler.config().queues.clone()
        } else {
            config.queues
        };

        if let Some(unknown) = queues
            .iter()
            .find(|q| !scheduler.config().is_known_queue(q))
        {
            return Err(WorkerError::UnknownQueue(unknown.clone()));
        }

        Ok(Self {
            scheduler,
            registry,
            worker_id: config.worker_id,
            queues,
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn queues(&self) -> &[String] {
        &self.queues
    }

    /// Run until `shutdown` flips to true (or its sender is dropped)
    ///
    /// Shutdown is observed between passes and while idle, never in the
    /// middle of a job.
    #[instrument(skip(self, shutdown), fields(worker_id = %self.worker_id))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            queues = ?self.queues,
            job_types = ?self.registry.job_types(),
            "Starting worker"
        );

        let poll_interval = self.scheduler.config().poll_interval;
        loop {
            if *shutdown.borrow() {
                break;
            }

            let claimed = self.run_once().await;
            if claimed > 0 {
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        debug!("shutdown sender dropped");
                        break;
                    }
                }
            }
        }

        info!("Worker stopped");
    }

    /// One pass over every queue; returns the number of jobs claimed
    pub async fn run_once(&self) -> usize {
        let limit = self.scheduler.config().claim_batch_limit;
        let mut total = 0;

        for queue in &self.queues {
            match self.scheduler.queue_depth(queue).await {
                Ok(depth) => self.scheduler.metrics().record(MetricEvent::QueueDepth {
                    queue: queue.clone(),
                    depth,
                }),
                Err(e) => error!(%queue, "Failed to read queue depth: {}", e),
            }

            let jobs = match self.scheduler.claim(queue, limit, &self.worker_id).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    error!(%queue, "Claim failed: {}", e);
                    continue;
                }
            };

            total += jobs.len();
            for job in jobs {
                self.execute(job).await;
            }
        }

        total
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, job_type = %job.job_type, attempt = job.attempt_count))]
    async fn execute(&self, job: Job) {
        let metrics = self.scheduler.metrics();
        metrics.record(MetricEvent::ClaimWait {
            queue: job.queue_name.clone(),
            job_type: job.job_type.clone(),
            wait: job.wait_time(self.scheduler.now()),
        });

        let started = Instant::now();
        let result = self.invoke(&job).await;
        let runtime = started.elapsed();

        match result {
            Ok(()) => match self.scheduler.complete(&job).await {
                Ok(_) => {
                    debug!(runtime_ms = runtime.as_millis() as u64, "job succeeded");
                    metrics.record(MetricEvent::JobSucceeded {
                        queue: job.queue_name.clone(),
                        job_type: job.job_type.clone(),
                        runtime,
                    });
                }
                Err(e) => log_outcome_error(&job, &e),
            },
            Err(err) => {
                let message = err.to_string();
                warn!(error = %message, "job failed");
                match self.scheduler.fail(&job, &message).await {
                    Ok(outcome) => metrics.record(MetricEvent::JobFailed {
                        queue: job.queue_name.clone(),
                        job_type: job.job_type.clone(),
                        dead_lettered: outcome.is_dead_lettered(),
                    }),
                    Err(e) => log_outcome_error(&job, &e),
                }
            }
        }
    }

    async fn invoke(&self, job: &Job) -> HandlerResult {
        let Some(handler) = self.registry.get(&job.job_type) else {
            warn!("no handler registered");
            return Err(HandlerError::NoHandler);
        };

        let call = async { handler.handle(job.clone()).await };
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(HandlerError::Panicked(panic_message(panic.as_ref()))),
        }
    }
}

fn log_outcome_error(job: &Job, e: &StoreError) {
    match e {
        StoreError::LeaseLost { .. } | StoreError::JobNotFound(_) => {
            warn!(job_id = %job.id, "Lease lost before outcome was recorded: {}", e);
        }
        _ => error!(job_id = %job.id, "Failed to record job outcome: {}", e),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
