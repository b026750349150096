//! Rate limiting policy for requeued work items.
//!
//! A failed item is re-added after a delay chosen by a [`RateLimiter`]. The
//! default policy combines two limiters and takes the larger delay:
//!
//! - per-item exponential backoff (5ms doubling up to 1000s), so a single
//!   broken Secret backs off without affecting others
//! - a global token bucket (10 qps, burst 100), so a burst of failures across
//!   many Secrets cannot hammer the GitLab API
//!
//! # Example
//!
//! ```ignore
//! use deploy_key_operator::retry::{default_controller_rate_limiter, RetryConfig};
//!
//! let limiter = default_controller_rate_limiter::<String>(&RetryConfig::default());
//! let delay = limiter.when(&"flux/flux-git-deploy".to_string());
//! ```

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Configuration for retrying failed work items.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Delay before the first retry of an item
    pub base_delay: Duration,
    /// Maximum per-item delay
    pub max_delay: Duration,
    /// Sustained retries per second across all items
    pub qps: f64,
    /// Retries allowed in a burst before `qps` applies
    pub burst: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            qps: 10.0,
            burst: 100,
        }
    }
}

/// Decides how long an item waits before it is re-added to the queue.
pub trait RateLimiter<K>: Send + Sync {
    /// Delay for the next retry of `item`; records the attempt
    fn when(&self, item: &K) -> Duration;

    /// Stop tracking `item`, resetting its backoff
    fn forget(&self, item: &K);

    /// Number of times `item` has been rate limited since it was last forgotten
    fn num_requeues(&self, item: &K) -> u32;
}

/// Exponential backoff tracked independently for each item.
pub struct ItemExponentialLimiter<K> {
    base_delay: Duration,
    max_delay: Duration,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K> ItemExponentialLimiter<K> {
    /// Create a limiter delaying `base_delay * 2^failures`, capped at `max_delay`
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl<K> RateLimiter<K> for ItemExponentialLimiter<K>
where
    K: Hash + Eq + Clone + Send + Sync,
{
    fn when(&self, item: &K) -> Duration {
        let mut failures = self.failures.lock();
        let count = failures.entry(item.clone()).or_insert(0);
        let exponent = *count;
        *count = count.saturating_add(1);

        2u32.checked_pow(exponent)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    fn forget(&self, item: &K) {
        self.failures.lock().remove(item);
    }

    fn num_requeues(&self, item: &K) -> u32 {
        self.failures.lock().get(item).copied().unwrap_or(0)
    }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Global token bucket shared by all items.
///
/// Every call takes one token; when the bucket is empty the returned delay is
/// the time until a token becomes available.
pub struct BucketLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketLimiter {
    /// Create a bucket refilling at `qps` tokens per second holding at most `burst`
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst);
        Self {
            qps,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }
}

impl<K> RateLimiter<K> for BucketLimiter {
    fn when(&self, _item: &K) -> Duration {
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.last = now;
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.tokens -= 1.0;

        if bucket.tokens >= 0.0 || self.qps <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.qps)
        }
    }

    fn forget(&self, _item: &K) {}

    fn num_requeues(&self, _item: &K) -> u32 {
        0
    }
}

/// Combines limiters, waiting for the slowest of them.
pub struct MaxOfLimiter<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOfLimiter<K> {
    /// Create a limiter returning the maximum delay of `limiters`
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self {
        Self { limiters }
    }
}

impl<K> RateLimiter<K> for MaxOfLimiter<K> {
    fn when(&self, item: &K) -> Duration {
        // every limiter must record the attempt, so no short-circuiting
        self.limiters
            .iter()
            .map(|l| l.when(item))
            .fold(Duration::ZERO, Duration::max)
    }

    fn forget(&self, item: &K) {
        for limiter in &self.limiters {
            limiter.forget(item);
        }
    }

    fn num_requeues(&self, item: &K) -> u32 {
        self.limiters
            .iter()
            .map(|l| l.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}

/// Build the standard controller policy from `config`.
pub fn default_controller_rate_limiter<K>(config: &RetryConfig) -> MaxOfLimiter<K>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
{
    MaxOfLimiter::new(vec![
        Box::new(ItemExponentialLimiter::new(
            config.base_delay,
            config.max_delay,
        )),
        Box::new(BucketLimiter::new(config.qps, config.burst)),
    ])
}
