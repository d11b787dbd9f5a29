//! Retry policy and backoff.
//!
//! A `RetryStrategy` trait backs `ExponentialBackoff`/`LinearBackoff`
//! with a shared jitter primitive, driven by an attempt budget plus a
//! retryable-status-code set and symmetric ±10% jitter.

use hookrelay_core::RetryConfig;
use std::time::Duration;

/// A pure function of attempt number; no internal state, so it is
/// trivially `Send + Sync` and safe to share across the worker pool and
/// the retry scheduler loop.
pub trait RetryStrategy: Send + Sync {
    fn delay(&self, attempt: u32) -> Duration;
}

/// `initial × attempt`, clamped to `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct LinearBackoff {
    pub initial: Duration,
    pub max_delay: Duration,
}

impl RetryStrategy for LinearBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let delay = self.initial.saturating_mul(attempt.max(1));
        std::cmp::min(delay, self.max_delay)
    }
}

/// `initial × 2^(attempt-1)`, clamped to `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub max_delay: Duration,
}

impl RetryStrategy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let multiplier = 2_u64.saturating_pow(exponent);
        let delay = self.initial.saturating_mul(multiplier as u32);
        std::cmp::min(delay, self.max_delay)
    }
}

/// The retry policy derived from a `RetryConfig`: when to retry
/// (`admits_retry`) and how long to wait (`backoff`, with jitter).
pub struct RetryPolicy {
    strategy: Box<dyn RetryStrategy>,
    max_attempts: u32,
    retryable_status_codes: Vec<u16>,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        let initial = Duration::from_millis(config.initial_delay_ms);
        let max_delay = Duration::from_millis(config.max_delay_ms);
        let strategy: Box<dyn RetryStrategy> = match config.backoff_strategy.as_str() {
            "linear" => Box::new(LinearBackoff { initial, max_delay }),
            _ => Box::new(ExponentialBackoff { initial, max_delay }),
        };
        Self {
            strategy,
            max_attempts: config.max_attempts,
            retryable_status_codes: config.retryable_status_codes.clone(),
        }
    }

    /// Retry iff `attempt < max_attempts` and `status_code` is null or in
    /// the retryable set. `status_code` is `None` for connection-level
    /// failures (timeout, refused).
    pub fn admits_retry(&self, status_code: Option<u16>, attempt: u32) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }
        match status_code {
            None => true,
            Some(code) => self.retryable_status_codes.contains(&code),
        }
    }

    /// Delay before `attempt`, jittered by a uniform offset in ±10% of
    /// the computed backoff.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.strategy.delay(attempt);
        let jitter_range = base.as_millis() as f64 * 0.10;
        let offset_ms = rand_symmetric() * jitter_range;
        let jittered = base.as_millis() as f64 + offset_ms;
        Duration::from_millis(jittered.max(0.0) as u64)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Nanosecond-clock PRNG, sufficient for jitter where cryptographic
/// unpredictability is not required. Returns a value in [-1.0, 1.0].
fn rand_symmetric() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos as f64 / u32::MAX as f64) * 2.0 - 1.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(strategy: &str) -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            backoff_strategy: strategy.to_string(),
            initial_delay_ms: 100,
            max_delay_ms: 1000,
            retryable_status_codes: vec![408, 429, 500, 502, 503, 504, 0],
        }
    }

    #[test]
    fn exponential_backoff_doubles_per_attempt() {
        let strategy = ExponentialBackoff {
            initial: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
        };
        assert_eq!(strategy.delay(1), Duration::from_millis(100));
        assert_eq!(strategy.delay(2), Duration::from_millis(200));
        assert_eq!(strategy.delay(3), Duration::from_millis(400));
    }

    #[test]
    fn linear_backoff_scales_with_attempt() {
        let strategy = LinearBackoff {
            initial: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
        };
        assert_eq!(strategy.delay(1), Duration::from_millis(100));
        assert_eq!(strategy.delay(2), Duration::from_millis(200));
    }

    #[test]
    fn backoff_is_clamped_to_max_delay() {
        let strategy = ExponentialBackoff {
            initial: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
        };
        assert_eq!(strategy.delay(10), Duration::from_millis(300));
    }

    #[test]
    fn policy_admits_retry_within_attempt_budget_and_retryable_status() {
        let policy = RetryPolicy::from_config(&config("exponential"));
        assert!(policy.admits_retry(Some(503), 1));
        assert!(policy.admits_retry(None, 1));
        assert!(!policy.admits_retry(Some(404), 1));
        assert!(!policy.admits_retry(Some(503), 3));
    }

    #[test]
    fn jittered_backoff_stays_within_ten_percent_of_base() {
        let policy = RetryPolicy::from_config(&config("exponential"));
        let base_ms = 100.0;
        for attempt in 1..=2 {
            let jittered = policy.backoff(attempt).as_millis() as f64;
            let base = base_ms * 2f64.powi(attempt as i32 - 1);
            assert!(jittered >= base * 0.9 - 1.0 && jittered <= base * 1.1 + 1.0);
        }
    }
}
