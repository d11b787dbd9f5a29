//! # hookrelay-core
//!
//! Foundational types shared across the router: the domain model
//! (`Subscriber`, `TransportBinding`, `Event`, `DeliveryAttempt`,
//! `RetryTask`), the `RouterError` taxonomy, and the structured
//! `RouterConfig` loaded from TOML at process start.

pub mod config;
pub mod error;
pub mod types;

pub use config::{
    DeliveryConfig, IngestConfig, MonitoringConfig, ProcessingConfig, QueueConfig, RetryConfig,
    RouterConfig, SecurityConfig, ServerConfig, StoreConfig,
};
pub use error::{RouterError, RouterResult};
pub use types::{
    DeliveryAttempt, Event, EventStats, EventStatus, RetryTask, Subscriber, TransportBinding,
    TransportKind,
};
