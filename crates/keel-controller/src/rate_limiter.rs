//! Requeue rate limiting for the work queue
//!
//! A failing key is retried with per-key exponential backoff, and all
//! requeues together are additionally smoothed by a token bucket. The delay
//! used is the larger of the two.
//!
//! # Example
//!
//! ```ignore
//! use keel_controller::rate_limiter::default_controller_rate_limiter;
//!
//! let limiter = default_controller_rate_limiter::<ObjectKey>(&ControllerConfig::default());
//! let delay = limiter.when(&key); // 5ms, then 10ms, 20ms, ... capped at 1000s
//! ```

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use keel_common::ControllerConfig;

/// Decides how long a key waits before it is requeued
pub trait RateLimiter<K>: Send + Sync {
    /// Delay before `item` may be processed again; records one more failure
    fn when(&self, item: &K) -> Duration;
    /// Stop tracking `item` (it succeeded or was dropped)
    fn forget(&self, item: &K);
    /// Number of failures recorded for `item`
    fn num_requeues(&self, item: &K) -> u32;
}

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`
pub struct ItemExponentialFailureRateLimiter<K> {
    base_delay: Duration,
    max_delay: Duration,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K> ItemExponentialFailureRateLimiter<K> {
    /// Create a limiter with the given bounds
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone + Send + Sync> RateLimiter<K> for ItemExponentialFailureRateLimiter<K> {
    fn when(&self, item: &K) -> Duration {
        let mut failures = self.failures.lock();
        let exp = failures.entry(item.clone()).or_insert(0);
        let attempt = *exp;
        *exp = exp.saturating_add(1);

        // powi saturates to infinity instead of overflowing; min() caps it
        let secs = (self.base_delay.as_secs_f64() * 2f64.powi(attempt.min(i32::MAX as u32) as i32))
            .min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    fn forget(&self, item: &K) {
        self.failures.lock().remove(item);
    }

    fn num_requeues(&self, item: &K) -> u32 {
        self.failures.lock().get(item).copied().unwrap_or(0)
    }
}

/// Overall token bucket shared by every key
///
/// Each call reserves one token; when the bucket is empty the returned delay
/// is the time until the reserved token will have been refilled.
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

impl BucketRateLimiter {
    /// Create a bucket refilling at `qps` tokens per second holding at most `burst`
    pub fn new(qps: f64, burst: u32) -> Self {
        Self {
            qps,
            burst: f64::from(burst),
            bucket: Mutex::new(Bucket {
                tokens: f64::from(burst),
                last: Instant::now(),
            }),
        }
    }
}

impl<K> RateLimiter<K> for BucketRateLimiter {
    fn when(&self, _item: &K) -> Duration {
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.last = now;

        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
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

/// Uses the longest delay of several limiters
pub struct MaxOfRateLimiter<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOfRateLimiter<K> {
    /// Combine limiters
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self {
        Self { limiters }
    }
}

impl<K> RateLimiter<K> for MaxOfRateLimiter<K> {
    fn when(&self, item: &K) -> Duration {
        self.limiters
            .iter()
            .map(|l| l.when(item))
            .max()
            .unwrap_or(Duration::ZERO)
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

/// Per-key exponential backoff combined with the overall bucket, from config
pub fn default_controller_rate_limiter<K>(config: &ControllerConfig) -> MaxOfRateLimiter<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::new(
            config.base_delay,
            config.max_delay,
        )),
        Box::new(BucketRateLimiter::new(config.qps, config.burst)),
    ])
}
