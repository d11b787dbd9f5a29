//! # hookrelay-store
//!
//! Event and subscriber persistence for the hookrelay webhook router:
//! - `EventStore`, the async repository trait
//! - `InMemoryEventStore`, a full in-process implementation
//! - `PostgresEventStore`, a `sqlx`-backed implementation (feature `postgres`)
//! - `SubscriberCache`, a version-gated read-through cache over subscribers

pub mod memory;
pub mod repository;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryEventStore;
pub use repository::{EventStore, NewAttempt, NewEvent, StoreEventOutcome, SubscriberCache};

#[cfg(feature = "postgres")]
pub use postgres::PostgresEventStore;
