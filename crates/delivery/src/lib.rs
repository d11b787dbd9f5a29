//! # hookrelay-delivery
//!
//! Queue abstraction, transport adapters, circuit breaker, rate
//! limiter, ingest validator, delivery engine, and retry scheduler for
//! the webhook router.

pub mod circuit_breaker;
pub mod engine;
pub mod queue;
pub mod rate_limiter;
pub mod receiver;
pub mod retry;
pub mod scheduler;
pub mod transport;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use engine::{DeliveryEngine, FanoutOutcome};
pub use queue::{FanoutJob, InMemoryQueue, QueueMessage, QueueStats, RouterQueue};
pub use rate_limiter::{IpRateLimiter, RateLimit};
pub use receiver::{AcceptedIngest, IngestValidator};
pub use retry::{ExponentialBackoff, LinearBackoff, RetryPolicy, RetryStrategy};
pub use scheduler::RetryScheduler;
pub use transport::{DeliveryOutcome, DeliveryRequest, HttpWebhookConfig, Transport};

#[cfg(feature = "http-transport")]
pub use transport::{GenericEnvelopeConfig, GenericEnvelopeTransport, HttpWebhookTransport};

#[cfg(feature = "amqp-transport")]
pub use transport::{AmqpBrokerConfig, AmqpBrokerTransport};
