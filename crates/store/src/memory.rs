//! In-memory `EventStore` implementation.
//!
//! `Arc<RwLock<HashMap<...>>>` collections with straightforward guarded
//! CRUD, built to satisfy every store invariant: unique
//! `upstream_delivery_id`, dense attempt numbers, at most one non-null
//! `next_retry_at` per (event, subscriber), and an atomic claim of due
//! retries.

use crate::repository::{EventStore, NewAttempt, NewEvent, StoreEventOutcome};
use async_trait::async_trait;
use chrono::Utc;
use hookrelay_core::{
    DeliveryAttempt, Event, EventStats, EventStatus, RetryTask, RouterError, RouterResult,
    Subscriber, TransportBinding, TransportKind,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct State {
    events: HashMap<i64, Event>,
    upstream_ids: HashMap<String, i64>,
    attempts: HashMap<(i64, i64), Vec<DeliveryAttempt>>,
    subscribers: HashMap<i64, Subscriber>,
    transports: HashMap<i64, TransportBinding>,
}

pub struct InMemoryEventStore {
    state: Arc<RwLock<State>>,
    next_event_id: AtomicI64,
    next_attempt_id: AtomicI64,
    subscribers_version: AtomicU64,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(State::default())),
            next_event_id: AtomicI64::new(1),
            next_attempt_id: AtomicI64::new(1),
            subscribers_version: AtomicU64::new(1),
        }
    }

    /// Seeds a subscriber + transport pair. Intended for tests and for
    /// wiring small deployments without a management REST surface.
    pub async fn seed_subscriber(&self, subscriber: Subscriber, kind: TransportKind, config: impl Into<String>) {
        let mut state = self.state.write().await;
        let transport_id = subscriber.id;
        state.transports.insert(
            transport_id,
            TransportBinding {
                id: transport_id,
                subscriber_id: subscriber.id,
                kind,
                config: config.into(),
            },
        );
        state.subscribers.insert(subscriber.id, subscriber);
        drop(state);
        self.subscribers_version.fetch_add(1, Ordering::SeqCst);
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn store_event(&self, new_event: NewEvent) -> RouterResult<StoreEventOutcome> {
        let mut state = self.state.write().await;
        if let Some(&existing_id) = state.upstream_ids.get(&new_event.upstream_delivery_id) {
            return Ok(StoreEventOutcome::AlreadyExists(existing_id));
        }

        let id = self.next_event_id.fetch_add(1, Ordering::SeqCst);
        let event = Event {
            id,
            upstream_delivery_id: new_event.upstream_delivery_id.clone(),
            event_type: new_event.event_type,
            payload_hash: new_event.payload_hash,
            payload_size: new_event.payload_size,
            payload_data: new_event.payload_data,
            headers_data: new_event.headers_data,
            received_at: new_event.received_at,
            processed_at: None,
            status: EventStatus::Pending,
        };
        state.upstream_ids.insert(new_event.upstream_delivery_id, id);
        state.events.insert(id, event);
        Ok(StoreEventOutcome::Created(id))
    }

    async fn set_event_status(&self, event_id: i64, status: EventStatus) -> RouterResult<()> {
        let mut state = self.state.write().await;
        let event = state
            .events
            .get_mut(&event_id)
            .ok_or_else(|| RouterError::not_found("event", "id", event_id.to_string()))?;
        event.status = status;
        if status.is_terminal() {
            event.processed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn get_event(&self, event_id: i64) -> RouterResult<Option<Event>> {
        Ok(self.state.read().await.events.get(&event_id).cloned())
    }

    async fn event_stats(&self) -> RouterResult<EventStats> {
        let state = self.state.read().await;
        let mut stats = EventStats::default();
        for event in state.events.values() {
            stats.total += 1;
            match event.status {
                EventStatus::Pending | EventStatus::Processing => stats.pending += 1,
                EventStatus::Failed | EventStatus::DeadLetter => stats.failed += 1,
                EventStatus::Completed => stats.completed += 1,
            }
        }
        Ok(stats)
    }

    async fn record_attempt(&self, attempt: NewAttempt) -> RouterResult<i64> {
        let mut state = self.state.write().await;
        let key = (attempt.event_id, attempt.subscriber_id);
        let rows = state.attempts.entry(key).or_default();

        let expected_next = rows.len() as u32 + 1;
        if attempt.attempt_number != expected_next {
            return Err(RouterError::internal(format!(
                "non-dense attempt number: expected {expected_next}, got {}",
                attempt.attempt_number
            )));
        }

        let id = self.next_attempt_id.fetch_add(1, Ordering::SeqCst);
        rows.push(DeliveryAttempt {
            id,
            event_id: attempt.event_id,
            subscriber_id: attempt.subscriber_id,
            attempt_number: attempt.attempt_number,
            status_code: attempt.status_code,
            error_message: attempt.error_message,
            attempted_at: attempt.attempted_at,
            duration_ms: attempt.duration_ms,
            next_retry_at: None,
        });
        Ok(id)
    }

    async fn schedule_retry(
        &self,
        event_id: i64,
        subscriber_id: i64,
        attempt_number: u32,
        when: chrono::DateTime<Utc>,
    ) -> RouterResult<()> {
        let mut state = self.state.write().await;
        let rows = state
            .attempts
            .get_mut(&(event_id, subscriber_id))
            .ok_or_else(|| RouterError::internal("no attempts recorded for (event, subscriber)"))?;
        let row = rows
            .iter_mut()
            .find(|a| a.attempt_number == attempt_number)
            .ok_or_else(|| RouterError::internal("attempt_number not found"))?;
        row.next_retry_at = Some(when);
        Ok(())
    }

    async fn clear_retry(&self, event_id: i64, subscriber_id: i64, attempt_number: u32) -> RouterResult<()> {
        let mut state = self.state.write().await;
        if let Some(rows) = state.attempts.get_mut(&(event_id, subscriber_id)) {
            if let Some(row) = rows.iter_mut().find(|a| a.attempt_number == attempt_number) {
                row.next_retry_at = None;
            }
        }
        Ok(())
    }

    async fn claim_pending_retries(&self, limit: usize) -> RouterResult<Vec<RetryTask>> {
        let now = Utc::now();
        let mut state = self.state.write().await;

        let mut due: Vec<(i64, i64, u32)> = Vec::new();
        for ((event_id, subscriber_id), rows) in state.attempts.iter() {
            for row in rows {
                if let Some(next_retry_at) = row.next_retry_at {
                    if next_retry_at <= now {
                        due.push((*event_id, *subscriber_id, row.attempt_number));
                    }
                }
            }
        }
        due.sort_by_key(|(_, _, attempt_number)| *attempt_number);
        due.truncate(limit);

        let mut tasks = Vec::with_capacity(due.len());
        for (event_id, subscriber_id, attempt_number) in due {
            // Claim: clear next_retry_at as part of the same write-locked
            // pass so a concurrent caller cannot observe the row as due.
            if let Some(rows) = state.attempts.get_mut(&(event_id, subscriber_id)) {
                if let Some(row) = rows.iter_mut().find(|a| a.attempt_number == attempt_number) {
                    row.next_retry_at = None;
                }
            }
            if let Some(event) = state.events.get(&event_id) {
                tasks.push(RetryTask {
                    event_id,
                    subscriber_id,
                    next_attempt_number: attempt_number + 1,
                    payload_data: event.payload_data.clone(),
                    headers_data: event.headers_data.clone(),
                    event_type: event.event_type.clone(),
                });
            }
        }
        Ok(tasks)
    }

    async fn get_subscriber(&self, id: i64) -> RouterResult<Option<Subscriber>> {
        Ok(self.state.read().await.subscribers.get(&id).cloned())
    }

    async fn list_subscribers(&self) -> RouterResult<Vec<Subscriber>> {
        Ok(self.state.read().await.subscribers.values().cloned().collect())
    }

    async fn get_transport_for(&self, subscriber_id: i64) -> RouterResult<Option<TransportBinding>> {
        Ok(self
            .state
            .read()
            .await
            .transports
            .values()
            .find(|t| t.subscriber_id == subscriber_id)
            .cloned())
    }

    async fn subscribers_version(&self) -> RouterResult<u64> {
        Ok(self.subscribers_version.load(Ordering::SeqCst))
    }

    async fn attempts_for_event(&self, event_id: i64) -> RouterResult<Vec<DeliveryAttempt>> {
        let state = self.state.read().await;
        Ok(state
            .attempts
            .iter()
            .filter(|((e, _), _)| *e == event_id)
            .flat_map(|(_, rows)| rows.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::collections::HashSet;

    fn new_event(delivery_id: &str) -> NewEvent {
        NewEvent {
            upstream_delivery_id: delivery_id.to_string(),
            event_type: "push".to_string(),
            payload_hash: "hash".to_string(),
            payload_size: 4,
            payload_data: "body".to_string(),
            headers_data: "{}".to_string(),
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn duplicate_upstream_delivery_id_is_rejected() {
        let store = InMemoryEventStore::new();
        let first = store.store_event(new_event("D1")).await.unwrap();
        let second = store.store_event(new_event("D1")).await.unwrap();

        let StoreEventOutcome::Created(id1) = first else { panic!("expected Created") };
        let StoreEventOutcome::AlreadyExists(id2) = second else { panic!("expected AlreadyExists") };
        assert_eq!(id1, id2);
        assert_eq!(store.event_stats().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn attempt_numbers_are_dense() {
        let store = InMemoryEventStore::new();
        let StoreEventOutcome::Created(event_id) = store.store_event(new_event("D2")).await.unwrap() else {
            panic!()
        };

        store
            .record_attempt(NewAttempt {
                event_id,
                subscriber_id: 1,
                attempt_number: 1,
                status_code: Some(503),
                error_message: None,
                attempted_at: Utc::now(),
                duration_ms: Some(5),
            })
            .await
            .unwrap();

        let err = store
            .record_attempt(NewAttempt {
                event_id,
                subscriber_id: 1,
                attempt_number: 3,
                status_code: Some(200),
                error_message: None,
                attempted_at: Utc::now(),
                duration_ms: Some(5),
            })
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn claim_pending_retries_clears_next_retry_at_and_does_not_double_claim() {
        let store = InMemoryEventStore::new();
        let StoreEventOutcome::Created(event_id) = store.store_event(new_event("D3")).await.unwrap() else {
            panic!()
        };
        store
            .record_attempt(NewAttempt {
                event_id,
                subscriber_id: 1,
                attempt_number: 1,
                status_code: Some(503),
                error_message: None,
                attempted_at: Utc::now(),
                duration_ms: Some(5),
            })
            .await
            .unwrap();
        store
            .schedule_retry(event_id, 1, 1, Utc::now() - Duration::seconds(1))
            .await
            .unwrap();

        let first_claim = store.claim_pending_retries(10).await.unwrap();
        assert_eq!(first_claim.len(), 1);
        let second_claim = store.claim_pending_retries(10).await.unwrap();
        assert!(second_claim.is_empty());
    }

    #[tokio::test]
    async fn subscriber_version_bumps_on_seed() {
        let store = InMemoryEventStore::new();
        let v0 = store.subscribers_version().await.unwrap();
        store
            .seed_subscriber(
                Subscriber {
                    id: 1,
                    name: "s".into(),
                    events: HashSet::from(["push".to_string()]),
                },
                TransportKind::HttpWebhook,
                "{}",
            )
            .await;
        let v1 = store.subscribers_version().await.unwrap();
        assert!(v1 > v0);
    }
}
