//! Scheduler and worker configuration
//!
//! Configuration is read from an optional YAML file (`FAIRQUEUE_CONFIG`) and
//! then overridden by individual environment variables.
//!
//! ```yaml
//! lock_timeout_secs: 300
//! poll_interval_ms: 1000
//! claim_batch_limit: 10
//! over_fetch_multiplier: 5
//! queues: [critical, standard, bulk]
//! default_queue: standard
//! job_type_queues:
//!   notification_delivery: critical
//!   data_export: bulk
//! queue_limits:
//!   standard:
//!     tenant: { rpm: 120, burst: 10, max_in_flight: 4 }
//! retry:
//!   default: { max_attempts: 5, base_delay_secs: 10, max_delay_secs: 600 }
//!   job_types:
//!     data_export: { max_attempts: 3, base_delay_secs: 60, max_delay_secs: 3600 }
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::reliability::RetryPolicyTable;
use crate::serde_duration::{millis, secs};

/// Default claim over-fetch multiplier
///
/// Candidates fetched per claim = `limit * over_fetch_multiplier`, so rows
/// skipped by the fairness cap or throttled do not need a second query.
pub const DEFAULT_OVER_FETCH_MULTIPLIER: usize = 5;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid YAML for this schema
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Environment override could not be parsed
    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv { var: String, value: String },

    /// Semantically invalid configuration
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Per-tenant admission limits for one queue
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TenantLimits {
    /// Sustained claims per minute
    pub rpm: u32,

    /// Token bucket capacity
    pub burst: u32,

    /// Fairness cap: jobs one tenant may be granted per claim batch
    pub max_in_flight: u32,
}

impl TenantLimits {
    pub fn new(rpm: u32, burst: u32, max_in_flight: u32) -> Self {
        Self {
            rpm,
            burst,
            max_in_flight,
        }
    }

    pub fn refill_per_sec(&self) -> f64 {
        self.rpm as f64 / 60.0
    }
}

/// Limits applied to one queue
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueueLimits {
    #[serde(default)]
    pub tenant: Option<TenantLimits>,
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Leases older than this may be reclaimed by another worker
    #[serde(rename = "lock_timeout_secs", with = "secs")]
    pub lock_timeout: Duration,

    /// Sleep between passes that found no work
    #[serde(rename = "poll_interval_ms", with = "millis")]
    pub poll_interval: Duration,

    /// Maximum jobs claimed per queue per pass
    pub claim_batch_limit: usize,

    /// Candidate over-fetch factor for claims
    pub over_fetch_multiplier: usize,

    /// Known queue names
    pub queues: Vec<String>,

    /// Queue used when neither an explicit queue nor a mapping applies
    pub default_queue: String,

    /// job_type -> queue routing
    pub job_type_queues: HashMap<String, String>,

    /// Per-queue admission limits
    pub queue_limits: HashMap<String, QueueLimits>,

    /// Retry policies
    pub retry: RetryPolicyTable,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(1),
            claim_batch_limit: 10,
            over_fetch_multiplier: DEFAULT_OVER_FETCH_MULTIPLIER,
            queues: vec![
                "critical".to_string(),
                "standard".to_string(),
                "bulk".to_string(),
            ],
            default_queue: "standard".to_string(),
            job_type_queues: HashMap::new(),
            queue_limits: HashMap::new(),
            retry: RetryPolicyTable::default(),
        }
    }
}

impl SchedulerConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse configuration from YAML text
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `FAIRQUEUE_CONFIG`: YAML file to start from (defaults otherwise)
    /// - `FAIRQUEUE_LOCK_TIMEOUT_SECS`: Lease timeout in seconds
    /// - `FAIRQUEUE_POLL_INTERVAL_MS`: Idle poll interval in milliseconds
    /// - `FAIRQUEUE_BATCH_LIMIT`: Jobs claimed per queue per pass
    /// - `FAIRQUEUE_QUEUES`: Comma-separated queue names
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("FAIRQUEUE_CONFIG") {
            Ok(path) if !path.is_empty() => {
                let content =
                    std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                        path: path.clone(),
                        source,
                    })?;
                serde_yaml::from_str(&content)?
            }
            _ => Self::default(),
        };

        if let Some(secs) = env_parse::<u64>("FAIRQUEUE_LOCK_TIMEOUT_SECS")? {
            config.lock_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = env_parse::<u64>("FAIRQUEUE_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(limit) = env_parse::<usize>("FAIRQUEUE_BATCH_LIMIT")? {
            config.claim_batch_limit = limit;
        }
        if let Ok(queues) = std::env::var("FAIRQUEUE_QUEUES") {
            config.queues = split_list(&queues);
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the lease timeout
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Set the idle poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the per-pass claim limit
    pub fn with_claim_batch_limit(mut self, limit: usize) -> Self {
        self.claim_batch_limit = limit.max(1);
        self
    }

    /// Set the candidate over-fetch multiplier
    pub fn with_over_fetch_multiplier(mut self, multiplier: usize) -> Self {
        self.over_fetch_multiplier = multiplier.max(1);
        self
    }

    /// Replace the known queue names
    pub fn with_queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queues = queues.into_iter().map(Into::into).collect();
        self
    }

    /// Set the fallback queue
    pub fn with_default_queue(mut self, queue: impl Into<String>) -> Self {
        self.default_queue = queue.into();
        self
    }

    /// Route a job type to a queue
    pub fn with_job_type_queue(
        mut self,
        job_type: impl Into<String>,
        queue: impl Into<String>,
    ) -> Self {
        self.job_type_queues.insert(job_type.into(), queue.into());
        self
    }

    /// Set tenant limits for a queue
    pub fn with_tenant_limits(mut self, queue: impl Into<String>, limits: TenantLimits) -> Self {
        self.queue_limits.entry(queue.into()).or_default().tenant = Some(limits);
        self
    }

    /// Replace the retry policy table
    pub fn with_retry_policies(mut self, retry: RetryPolicyTable) -> Self {
        self.retry = retry;
        self
    }

    pub fn is_known_queue(&self, queue: &str) -> bool {
        self.queues.iter().any(|q| q == queue)
    }

    pub fn tenant_limits(&self, queue: &str) -> Option<TenantLimits> {
        self.queue_limits.get(queue).and_then(|l| l.tenant)
    }

    /// Candidate rows fetched for a claim of `limit` jobs
    pub fn fetch_limit(&self, limit: usize) -> usize {
        limit.saturating_mul(self.over_fetch_multiplier.max(1))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.claim_batch_limit == 0 {
            return Err(ConfigError::Invalid(
                "claim_batch_limit must be at least 1".into(),
            ));
        }
        if self.over_fetch_multiplier == 0 {
            return Err(ConfigError::Invalid(
                "over_fetch_multiplier must be at least 1".into(),
            ));
        }
        if self.queues.is_empty() {
            return Err(ConfigError::Invalid("at least one queue is required".into()));
        }
        if !self.is_known_queue(&self.default_queue) {
            return Err(ConfigError::Invalid(format!(
                "default queue {} is not a configured queue",
                self.default_queue
            )));
        }
        for (job_type, queue) in &self.job_type_queues {
            if !self.is_known_queue(queue) {
                return Err(ConfigError::Invalid(format!(
                    "job type {job_type} routes to unknown queue {queue}"
                )));
            }
        }
        for (queue, limits) in &self.queue_limits {
            if let Some(tenant) = limits.tenant {
                if tenant.rpm == 0 || tenant.burst == 0 || tenant.max_in_flight == 0 {
                    return Err(ConfigError::Invalid(format!(
                        "tenant limits for queue {queue} must be non-zero"
                    )));
                }
            }
        }
        self.retry.validate().map_err(ConfigError::Invalid)?;
        Ok(())
    }
}

/// Worker process configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// Unique worker ID, written into `locked_by`
    pub worker_id: String,

    /// Queues to poll; empty means every configured queue
    pub queues: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            queues: vec![],
        }
    }
}

impl WorkerConfig {
    /// Create configuration from environment variables
    ///
    /// - `WORKER_ID`: Worker identifier (default: `worker-<uuid>`)
    /// - `FAIRQUEUE_WORKER_QUEUES`: Comma-separated queues to poll
    pub fn from_env() -> Self {
        let worker_id =
            std::env::var("WORKER_ID").unwrap_or_else(|_| format!("worker-{}", Uuid::now_v7()));

        let queues = std::env::var("FAIRQUEUE_WORKER_QUEUES")
            .map(|v| split_list(&v))
            .unwrap_or_default();

        Self { worker_id, queues }
    }

    /// Set the worker ID
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    /// Restrict the worker to the given queues
    pub fn with_queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queues = queues.into_iter().map(Into::into).collect();
        self
    }
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                var: var.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
