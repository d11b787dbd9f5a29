//! Token-bucket rate limiting for the ingest validator, keyed by client
//! IP at a configured rate.

use hookrelay_core::RouterError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub requests_per_minute: u32,
    pub burst: u32,
}

struct TokenBucket {
    tokens: AtomicU32,
    capacity: u32,
    refill_rate_per_minute: u32,
    last_refill: RwLock<Instant>,
}

impl TokenBucket {
    fn new(limit: RateLimit) -> Self {
        Self {
            tokens: AtomicU32::new(limit.burst),
            capacity: limit.burst,
            refill_rate_per_minute: limit.requests_per_minute,
            last_refill: RwLock::new(Instant::now()),
        }
    }

    async fn refill(&self) {
        let mut last_refill = self.last_refill.write().await;
        let now = Instant::now();
        let elapsed = now.duration_since(*last_refill);

        if elapsed >= Duration::from_secs(1) {
            let tokens_to_add =
                ((elapsed.as_secs_f64() / 60.0) * self.refill_rate_per_minute as f64) as u32;
            if tokens_to_add > 0 {
                loop {
                    let current = self.tokens.load(Ordering::Acquire);
                    let new_value = (current + tokens_to_add).min(self.capacity);
                    if self
                        .tokens
                        .compare_exchange(current, new_value, Ordering::Release, Ordering::Acquire)
                        .is_ok()
                    {
                        break;
                    }
                }
                *last_refill = now;
            }
        }
    }

    fn try_consume(&self) -> bool {
        loop {
            let current = self.tokens.load(Ordering::Acquire);
            if current == 0 {
                return false;
            }
            if self
                .tokens
                .compare_exchange(current, current - 1, Ordering::Release, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }
}

/// Keyed token-bucket rate limiter, one bucket per client IP.
pub struct IpRateLimiter {
    buckets: RwLock<HashMap<String, Arc<TokenBucket>>>,
    default_limit: RateLimit,
}

impl IpRateLimiter {
    pub fn new(default_limit: RateLimit) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            default_limit,
        }
    }

    /// Consumes one token for `client_ip`, refilling first.
    pub async fn check(&self, client_ip: &str) -> Result<(), RouterError> {
        let bucket = self.get_or_create_bucket(client_ip).await;
        bucket.refill().await;
        if bucket.try_consume() {
            Ok(())
        } else {
            Err(RouterError::RateLimited)
        }
    }

    async fn get_or_create_bucket(&self, client_ip: &str) -> Arc<TokenBucket> {
        {
            let buckets = self.buckets.read().await;
            if let Some(bucket) = buckets.get(client_ip) {
                return bucket.clone();
            }
        }
        let bucket = Arc::new(TokenBucket::new(self.default_limit));
        let mut buckets = self.buckets.write().await;
        buckets.entry(client_ip.to_string()).or_insert(bucket).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn requests_within_burst_succeed() {
        let limiter = IpRateLimiter::new(RateLimit { requests_per_minute: 60, burst: 2 });
        assert!(limiter.check("1.2.3.4").await.is_ok());
        assert!(limiter.check("1.2.3.4").await.is_ok());
    }

    #[tokio::test]
    async fn requests_beyond_burst_are_rate_limited() {
        let limiter = IpRateLimiter::new(RateLimit { requests_per_minute: 60, burst: 1 });
        assert!(limiter.check("1.2.3.4").await.is_ok());
        let err = limiter.check("1.2.3.4").await.unwrap_err();
        assert!(matches!(err, RouterError::RateLimited));
    }

    #[tokio::test]
    async fn distinct_ips_have_independent_buckets() {
        let limiter = IpRateLimiter::new(RateLimit { requests_per_minute: 60, burst: 1 });
        assert!(limiter.check("1.2.3.4").await.is_ok());
        assert!(limiter.check("5.6.7.8").await.is_ok());
    }
}
