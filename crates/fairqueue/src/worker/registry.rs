//! Handler registry
//!
//! Maps `job_type` to the code that runs it. Built once at process start and
//! shared read-only with the worker.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::model::Job;

/// Error returned by a job handler
///
/// The message becomes the job's `last_error`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Handler reported a failure
    #[error("{0}")]
    Failed(String),

    /// Handler panicked
    #[error("panic: {0}")]
    Panicked(String),

    /// No handler registered for the job type
    #[error("no_handler_registered")]
    NoHandler,
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Failed(format!("invalid payload: {e}"))
    }
}

/// Result type for handlers
pub type HandlerResult = Result<(), HandlerError>;

/// Executable logic for one job type
///
/// Implemented for any `Fn(Job) -> impl Future<Output = HandlerResult>`.
pub trait JobHandler: Send + Sync + 'static {
    fn handle(&self, job: Job) -> BoxFuture<'static, HandlerResult>;
}

impl<F, Fut> JobHandler for F
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn handle(&self, job: Job) -> BoxFuture<'static, HandlerResult> {
        Box::pin(self(job))
    }
}

/// Registry of job handlers keyed by job type
///
/// # Example
///
/// ```
/// use fairqueue::{HandlerError, HandlerRegistry, Job};
///
/// let registry = HandlerRegistry::new()
///     .with_handler("send_email", |job: Job| async move {
///         let _to = job.payload["to"].as_str().ok_or(HandlerError::failed("missing to"))?;
///         Ok(())
///     });
///
/// assert!(registry.contains("send_email"));
/// ```
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the job type
    pub fn register<F, Fut>(&mut self, job_type: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.insert(job_type, Arc::new(handler))
    }

    /// Builder form of [`register`](Self::register)
    pub fn with_handler<F, Fut>(mut self, job_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(job_type, handler);
        self
    }

    /// Register a handler object
    pub fn insert(&mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) -> &mut Self {
        self.handlers.insert(job_type.into(), handler);
        self
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Registered job types, sorted
    pub fn job_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
