//! Token-bucket rate limiting for tenant admission control

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// Calls between sweeps of refilled buckets
const SHRINK_INTERVAL: u64 = 1024;

/// Outcome of a rate-limit check
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateDecision {
    pub allowed: bool,

    /// How long until a token is available (zero when allowed)
    pub retry_after: Duration,
}

impl RateDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            retry_after: Duration::ZERO,
        }
    }

    pub fn deny(retry_after: Duration) -> Self {
        Self {
            allowed: false,
            retry_after,
        }
    }
}

/// Keyed rate limiter
///
/// Implementations must be thread-safe; one limiter is shared by every claim
/// a worker process makes.
pub trait RateLimiter: Send + Sync + 'static {
    /// Take one token from the bucket identified by `key`.
    fn allow(
        &self,
        key: &str,
        capacity: f64,
        refill_per_sec: f64,
        now: DateTime<Utc>,
    ) -> RateDecision;
}

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: DateTime<Utc>,
    capacity: f64,
    refill_per_sec: f64,
}

impl TokenBucket {
    fn tokens_at(&self, now: DateTime<Utc>) -> f64 {
        let elapsed = (now - self.last_refill)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        (self.tokens + elapsed * self.refill_per_sec).min(self.capacity)
    }
}

/// In-process token bucket limiter
///
/// Buckets start full, refill continuously at `refill_per_sec`, never exceed
/// `capacity`, and each allowed call consumes one token. Buckets that have
/// refilled to capacity are dropped periodically; a dropped bucket comes back
/// full, so eviction never changes a decision.
///
/// # Example
///
/// ```
/// use fairqueue::reliability::{RateLimiter, TokenBucketLimiter};
/// use chrono::Utc;
///
/// let limiter = TokenBucketLimiter::new();
/// let now = Utc::now();
///
/// assert!(limiter.allow("standard:acme", 2.0, 1.0, now).allowed);
/// assert!(limiter.allow("standard:acme", 2.0, 1.0, now).allowed);
/// assert!(!limiter.allow("standard:acme", 2.0, 1.0, now).allowed);
/// ```
#[derive(Debug, Default)]
pub struct TokenBucketLimiter {
    buckets: DashMap<String, TokenBucket>,
    call_count: AtomicU64,
}

impl TokenBucketLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked buckets
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Drop a bucket so the next call starts full
    pub fn reset(&self, key: &str) {
        self.buckets.remove(key);
    }

    /// Drop every bucket that is back at capacity by `now`
    pub fn retain_recent(&self, now: DateTime<Utc>) {
        self.buckets
            .retain(|_, bucket| bucket.tokens_at(now) < bucket.capacity);
    }
}

impl RateLimiter for TokenBucketLimiter {
    fn allow(
        &self,
        key: &str,
        capacity: f64,
        refill_per_sec: f64,
        now: DateTime<Utc>,
    ) -> RateDecision {
        let count = self.call_count.fetch_add(1, Ordering::Relaxed);
        if count % SHRINK_INTERVAL == 0 && count > 0 {
            self.retain_recent(now);
        }

        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket {
                tokens: capacity,
                last_refill: now,
                capacity,
                refill_per_sec,
            });

        bucket.capacity = capacity;
        bucket.refill_per_sec = refill_per_sec;
        if now > bucket.last_refill {
            bucket.tokens = bucket.tokens_at(now);
            bucket.last_refill = now;
        }

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return RateDecision::allow();
        }

        let retry_after = if refill_per_sec > 0.0 {
            Duration::from_secs_f64((1.0 - bucket.tokens) / refill_per_sec)
        } else {
            Duration::from_secs(60)
        };
        RateDecision::deny(retry_after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_deny() {
        let limiter = TokenBucketLimiter::new();
        let now = Utc::now();

        for _ in 0..5 {
            assert!(limiter.allow("q:t", 5.0, 1.0, now).allowed);
        }

        let denied = limiter.allow("q:t", 5.0, 1.0, now);
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Duration::from_secs(1));
    }

    #[test]
    fn test_refill_over_time() {
        let limiter = TokenBucketLimiter::new();
        let now = Utc::now();

        assert!(limiter.allow("q:t", 1.0, 0.5, now).allowed);
        assert!(!limiter.allow("q:t", 1.0, 0.5, now).allowed);

        // Half a token after one second at 0.5/s
        let later = now + chrono::Duration::seconds(1);
        let denied = limiter.allow("q:t", 1.0, 0.5, later);
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Duration::from_secs(1));

        let much_later = now + chrono::Duration::seconds(2);
        assert!(limiter.allow("q:t", 1.0, 0.5, much_later).allowed);
    }

    #[test]
    fn test_refill_capped_at_capacity() {
        let limiter = TokenBucketLimiter::new();
        let now = Utc::now();

        assert!(limiter.allow("q:t", 2.0, 1.0, now).allowed);

        let later = now + chrono::Duration::hours(1);
        assert!(limiter.allow("q:t", 2.0, 1.0, later).allowed);
        assert!(limiter.allow("q:t", 2.0, 1.0, later).allowed);
        assert!(!limiter.allow("q:t", 2.0, 1.0, later).allowed);
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = TokenBucketLimiter::new();
        let now = Utc::now();

        assert!(limiter.allow("q:a", 1.0, 1.0, now).allowed);
        assert!(!limiter.allow("q:a", 1.0, 1.0, now).allowed);
        assert!(limiter.allow("q:b", 1.0, 1.0, now).allowed);
        assert_eq!(limiter.len(), 2);

        limiter.reset("q:a");
        assert!(limiter.allow("q:a", 1.0, 1.0, now).allowed);
    }

    #[test]
    fn test_retain_recent_drops_only_refilled_buckets() {
        let limiter = TokenBucketLimiter::new();
        let now = Utc::now();

        assert!(limiter.allow("q:idle", 1.0, 1.0, now).allowed);
        assert!(limiter.allow("q:slow", 1.0, 0.1, now).allowed);
        assert_eq!(limiter.len(), 2);

        let later = now + chrono::Duration::seconds(2);
        limiter.retain_recent(later);
        assert_eq!(limiter.len(), 1);

        // The evicted bucket comes back full, the kept one is still empty
        assert!(limiter.allow("q:idle", 1.0, 1.0, later).allowed);
        assert!(!limiter.allow("q:slow", 1.0, 0.1, later).allowed);
    }

    #[test]
    fn test_periodic_sweep_bounds_idle_keys() {
        let limiter = TokenBucketLimiter::new();
        let now = Utc::now();

        for i in 0..SHRINK_INTERVAL {
            assert!(limiter.allow(&format!("q:{i}"), 1.0, 1.0, now).allowed);
        }
        assert_eq!(limiter.len(), SHRINK_INTERVAL as usize);

        let later = now + chrono::Duration::seconds(5);
        assert!(limiter.allow("q:fresh", 1.0, 1.0, later).allowed);
        assert_eq!(limiter.len(), 1);
    }

    #[test]
    fn test_clock_going_backwards_does_not_refill() {
        let limiter = TokenBucketLimiter::new();
        let now = Utc::now();

        assert!(limiter.allow("q:t", 1.0, 1.0, now).allowed);
        let earlier = now - chrono::Duration::seconds(10);
        assert!(!limiter.allow("q:t", 1.0, 1.0, earlier).allowed);
    }
}
