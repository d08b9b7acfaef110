//! Reliability patterns for the job queue
//!
//! This module provides:
//! - [`RetryPolicy`] / [`RetryPolicyTable`] - Per-job-type exponential backoff
//! - [`TokenBucketLimiter`] - Keyed token buckets for tenant admission control

mod rate_limit;
mod retry;

pub use rate_limit::{RateDecision, RateLimiter, TokenBucketLimiter};
pub use retry::{FailureDecision, RetryPolicy, RetryPolicyTable, MAX_RETRY_DELAY};
