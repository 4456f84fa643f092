//! Request rate limiting
//!
//! A token bucket per API key: capacity `token_limit`, refilled continuously
//! at `tokens_per_period / replenishment_period_seconds`. Applied in the API
//! layer before the pipeline runs; refusals surface as 429 without touching
//! any provider.

use dashmap::DashMap;
use std::time::Instant;

use crate::config::RateLimitConfig;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    capacity: f64,
    refill_per_second: f64,
    buckets: DashMap<String, Bucket>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let period = config.replenishment_period_seconds.max(1) as f64;
        Self {
            capacity: config.token_limit.max(1) as f64,
            refill_per_second: config.tokens_per_period as f64 / period,
            buckets: DashMap::new(),
        }
    }

    /// Take one token for `key`. False means the caller is over its rate.
    pub fn try_acquire(&self, key: &str) -> bool {
        self.try_acquire_n(key, 1.0)
    }

    /// Weighted acquisition (batch requests take one token per item).
    pub fn try_acquire_n(&self, key: &str, cost: f64) -> bool {
        let now = Instant::now();
        let mut bucket = self.buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_second).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limiter(capacity: u32, per_second: u32) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            token_limit: capacity,
            tokens_per_period: per_second,
            replenishment_period_seconds: 1,
            queue_limit: 0,
        })
    }

    #[test]
    fn burst_up_to_capacity_then_reject() {
        let limiter = limiter(3, 1);
        assert!(limiter.try_acquire("key"));
        assert!(limiter.try_acquire("key"));
        assert!(limiter.try_acquire("key"));
        assert!(!limiter.try_acquire("key"));
    }

    #[test]
    fn keys_are_isolated() {
        let limiter = limiter(1, 1);
        assert!(limiter.try_acquire("a"));
        assert!(!limiter.try_acquire("a"));
        assert!(limiter.try_acquire("b"));
    }

    #[tokio::test]
    async fn tokens_replenish_over_time() {
        let limiter = limiter(1, 50); // 50 tokens/second
        assert!(limiter.try_acquire("key"));
        assert!(!limiter.try_acquire("key"));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(limiter.try_acquire("key"));
    }

    #[test]
    fn weighted_acquisition_charges_batches() {
        let limiter = limiter(10, 1);
        assert!(limiter.try_acquire_n("key", 8.0));
        assert!(!limiter.try_acquire_n("key", 5.0));
        assert!(limiter.try_acquire_n("key", 2.0));
    }
}
