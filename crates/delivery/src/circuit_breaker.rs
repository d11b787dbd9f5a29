//! Circuit breaker guarding a single subscriber's transport.
//!
//! - Closed: normal operation, requests go through
//! - Open: too many consecutive failures, requests are rejected
//! - Half-Open: testing recovery, limited requests allowed
//!
//! Tracked per subscriber transport; errors surface as the crate-wide
//! `RouterError`.

use hookrelay_core::RouterError;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

pub struct CircuitBreaker {
    state: Arc<RwLock<CircuitState>>,
    config: CircuitBreakerConfig,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
            half_open_max_calls: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub enum CircuitState {
    Closed { failure_count: u32 },
    Open { opened_at: Instant },
    HalfOpen { success_count: u32, failure_count: u32, active_calls: u32 },
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::with_config(CircuitBreakerConfig::default())
    }

    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            state: Arc::new(RwLock::new(CircuitState::Closed { failure_count: 0 })),
            config,
        }
    }

    /// Executes `f` under circuit-breaker protection. Returns
    /// `RouterError::TransientDelivery` if the circuit is open.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T, RouterError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RouterError>>,
    {
        {
            let state = self.state.read().await;
            match *state {
                CircuitState::Open { opened_at } => {
                    if opened_at.elapsed() > self.config.timeout {
                        drop(state);
                        self.transition_to_half_open().await;
                    } else {
                        return Err(RouterError::internal("circuit breaker open for this subscriber"));
                    }
                }
                CircuitState::HalfOpen { active_calls, .. } => {
                    if active_calls >= self.config.half_open_max_calls {
                        return Err(RouterError::internal("circuit breaker half-open call limit reached"));
                    }
                }
                CircuitState::Closed { .. } => {}
            }
        }

        self.increment_active_calls().await;
        let result = f().await;
        self.decrement_active_calls().await;

        match result {
            Ok(value) => {
                self.on_success().await;
                Ok(value)
            }
            Err(e) => {
                self.on_failure().await;
                Err(e)
            }
        }
    }

    async fn on_success(&self) {
        let mut state = self.state.write().await;
        match *state {
            CircuitState::Closed { .. } => {
                *state = CircuitState::Closed { failure_count: 0 };
            }
            CircuitState::HalfOpen { success_count, .. } => {
                let new_success_count = success_count + 1;
                if new_success_count >= self.config.success_threshold {
                    *state = CircuitState::Closed { failure_count: 0 };
                    tracing::info!("circuit breaker closed after successful recovery");
                } else {
                    *state = CircuitState::HalfOpen {
                        success_count: new_success_count,
                        failure_count: 0,
                        active_calls: 0,
                    };
                }
            }
            CircuitState::Open { .. } => {
                *state = CircuitState::HalfOpen {
                    success_count: 1,
                    failure_count: 0,
                    active_calls: 0,
                };
            }
        }
    }

    async fn on_failure(&self) {
        let mut state = self.state.write().await;
        match *state {
            CircuitState::Closed { failure_count } => {
                let new_failure_count = failure_count + 1;
                if new_failure_count >= self.config.failure_threshold {
                    *state = CircuitState::Open { opened_at: Instant::now() };
                    tracing::warn!("circuit breaker opened after {} consecutive failures", new_failure_count);
                } else {
                    *state = CircuitState::Closed { failure_count: new_failure_count };
                }
            }
            CircuitState::HalfOpen { .. } => {
                *state = CircuitState::Open { opened_at: Instant::now() };
                tracing::warn!("circuit breaker re-opened due to failure during recovery");
            }
            CircuitState::Open { .. } => {}
        }
    }

    async fn transition_to_half_open(&self) {
        let mut state = self.state.write().await;
        *state = CircuitState::HalfOpen { success_count: 0, failure_count: 0, active_calls: 0 };
        tracing::info!("circuit breaker transitioned to half-open, testing recovery");
    }

    async fn increment_active_calls(&self) {
        let mut state = self.state.write().await;
        if let CircuitState::HalfOpen { success_count, failure_count, active_calls } = *state {
            *state = CircuitState::HalfOpen { success_count, failure_count, active_calls: active_calls + 1 };
        }
    }

    async fn decrement_active_calls(&self) {
        let mut state = self.state.write().await;
        if let CircuitState::HalfOpen { success_count, failure_count, active_calls } = *state {
            *state = CircuitState::HalfOpen {
                success_count,
                failure_count,
                active_calls: active_calls.saturating_sub(1),
            };
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.state.read().await.clone()
    }

    pub async fn is_open(&self) -> bool {
        matches!(*self.state.read().await, CircuitState::Open { .. })
    }

    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        *state = CircuitState::Closed { failure_count: 0 };
        tracing::info!("circuit breaker manually reset");
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure() -> RouterError {
        RouterError::transient(1, 1, "test")
    }

    #[tokio::test]
    async fn circuit_opens_after_consecutive_failures() {
        let config = CircuitBreakerConfig { failure_threshold: 3, ..Default::default() };
        let cb = CircuitBreaker::with_config(config);

        for _ in 0..3 {
            let _ = cb.call(|| async { Err::<(), _>(failure()) }).await;
        }

        assert!(cb.is_open().await);
    }

    #[tokio::test]
    async fn open_circuit_rejects_calls_before_timeout() {
        let config = CircuitBreakerConfig { failure_threshold: 1, timeout: Duration::from_secs(60), ..Default::default() };
        let cb = CircuitBreaker::with_config(config);
        let _ = cb.call(|| async { Err::<(), _>(failure()) }).await;

        let result = cb.call(|| async { Ok::<_, RouterError>(()) }).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn circuit_closes_after_successes_in_half_open() {
        let config = CircuitBreakerConfig {
            failure_threshold: 2,
            success_threshold: 2,
            timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let cb = CircuitBreaker::with_config(config);

        for _ in 0..2 {
            let _ = cb.call(|| async { Err::<(), _>(failure()) }).await;
        }
        assert!(cb.is_open().await);

        tokio::time::sleep(Duration::from_millis(80)).await;

        for _ in 0..2 {
            let _ = cb.call(|| async { Ok::<_, RouterError>(()) }).await;
        }

        assert!(!cb.is_open().await);
    }

    #[tokio::test]
    async fn reset_closes_the_circuit() {
        let config = CircuitBreakerConfig { failure_threshold: 1, ..Default::default() };
        let cb = CircuitBreaker::with_config(config);
        let _ = cb.call(|| async { Err::<(), _>(failure()) }).await;
        assert!(cb.is_open().await);

        cb.reset().await;
        assert!(!cb.is_open().await);
    }
}
