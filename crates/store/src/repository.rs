//! The event store / repository abstraction.
//!
//! One `async_trait` trait, a complete in-memory implementation, and a
//! real Postgres-backed implementation behind a feature flag.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hookrelay_core::{DeliveryAttempt, Event, EventStats, EventStatus, RetryTask, RouterResult, Subscriber, TransportBinding};

/// A new event as produced by the ingest validator, not yet assigned an id.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub upstream_delivery_id: String,
    pub event_type: String,
    pub payload_hash: String,
    pub payload_size: usize,
    pub payload_data: String,
    pub headers_data: String,
    pub received_at: DateTime<Utc>,
}

/// A new delivery attempt row to append.
#[derive(Debug, Clone)]
pub struct NewAttempt {
    pub event_id: i64,
    pub subscriber_id: i64,
    pub attempt_number: u32,
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
    pub attempted_at: DateTime<Utc>,
    pub duration_ms: Option<u64>,
}

/// Outcome of `storeEvent`: either a freshly assigned id, or a signal that
/// the upstream delivery id had already been seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEventOutcome {
    Created(i64),
    AlreadyExists(i64),
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Atomically inserts a new event with status=pending. Rejects
    /// duplicate upstream delivery identifiers by returning
    /// `AlreadyExists` rather than an error.
    async fn store_event(&self, event: NewEvent) -> RouterResult<StoreEventOutcome>;

    /// Idempotent. May set `processed_at` to now on terminal transitions.
    async fn set_event_status(&self, event_id: i64, status: EventStatus) -> RouterResult<()>;

    async fn get_event(&self, event_id: i64) -> RouterResult<Option<Event>>;

    async fn event_stats(&self) -> RouterResult<EventStats>;

    /// Appends an attempt row. Attempt numbers must be dense starting at 1
    /// per (event, subscriber).
    async fn record_attempt(&self, attempt: NewAttempt) -> RouterResult<i64>;

    /// Updates `next_retry_at` of the attempt numbered `attempt_number` for
    /// (event, subscriber) to a non-null timestamp.
    async fn schedule_retry(
        &self,
        event_id: i64,
        subscriber_id: i64,
        attempt_number: u32,
        when: DateTime<Utc>,
    ) -> RouterResult<()>;

    /// Sets `next_retry_at` to null for (event, subscriber, attempt_number).
    async fn clear_retry(&self, event_id: i64, subscriber_id: i64, attempt_number: u32) -> RouterResult<()>;

    /// Atomically claims up to `limit` due retry tasks (`next_retry_at <=
    /// now`), clearing their `next_retry_at` as part of the same
    /// operation so a concurrent poller cannot return the same row.
    /// Claim happens before the attempt runs, not after.
    async fn claim_pending_retries(&self, limit: usize) -> RouterResult<Vec<RetryTask>>;

    async fn get_subscriber(&self, id: i64) -> RouterResult<Option<Subscriber>>;

    async fn list_subscribers(&self) -> RouterResult<Vec<Subscriber>>;

    async fn get_transport_for(&self, subscriber_id: i64) -> RouterResult<Option<TransportBinding>>;

    /// Monotonically increasing version, bumped whenever a subscriber or
    /// transport binding is mutated through the management surface.
    async fn subscribers_version(&self) -> RouterResult<u64>;

    /// Attempt rows recorded so far for a given event, used by the
    /// delivery engine to aggregate per-subscriber outcomes.
    async fn attempts_for_event(&self, event_id: i64) -> RouterResult<Vec<DeliveryAttempt>>;
}

/// Read-side helper shared by delivery engine and retry scheduler: a
/// process-local snapshot of subscribers, refreshed only when the
/// store's version counter advances.
pub struct SubscriberCache {
    inner: tokio::sync::RwLock<CacheState>,
}

struct CacheState {
    version: u64,
    subscribers: Vec<Subscriber>,
}

impl SubscriberCache {
    pub fn new() -> Self {
        Self {
            inner: tokio::sync::RwLock::new(CacheState {
                version: 0,
                subscribers: Vec::new(),
            }),
        }
    }

    /// Returns subscribers matching `event_type`, refreshing the snapshot
    /// first if the store's version counter has advanced.
    pub async fn matching(&self, store: &dyn EventStore, event_type: &str) -> RouterResult<Vec<Subscriber>> {
        let current_version = store.subscribers_version().await?;
        {
            let state = self.inner.read().await;
            if state.version == current_version {
                return Ok(state.subscribers.iter().filter(|s| s.matches(event_type)).cloned().collect());
            }
        }
        let fresh = store.list_subscribers().await?;
        let mut state = self.inner.write().await;
        state.version = current_version;
        state.subscribers = fresh.clone();
        Ok(fresh.into_iter().filter(|s| s.matches(event_type)).collect())
    }
}

impl Default for SubscriberCache {
    fn default() -> Self {
        Self::new()
    }
}
