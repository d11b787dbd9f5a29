//! Delivery engine: fan-out to matching subscribers and the retry-aware
//! attempt loop.
//!
//! One struct holds the store, queue, retry strategy, and a per-endpoint
//! circuit breaker map. Completion is a property of the whole subscriber
//! set, not of a single attempt: an event only transitions to a terminal
//! status once every subscriber it fanned out to has reached one.

use crate::circuit_breaker::CircuitBreaker;
use crate::retry::RetryPolicy;
use crate::transport::{DeliveryOutcome, DeliveryRequest, Transport};
use chrono::Utc;
use hookrelay_core::{DeliveryConfig, Event, EventStatus, RetryTask, RouterError, RouterResult, TransportKind};
use hookrelay_crypto::HeaderCipher;
use hookrelay_store::{EventStore, NewAttempt, SubscriberCache};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;

/// Aggregated per-subscriber counts; the shape of the ingest response
/// body.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct FanoutOutcome {
    pub subscribers: usize,
    pub successful: usize,
    pub failed: usize,
    pub retries: usize,
}

enum AttemptOutcome {
    Succeeded,
    Retrying,
    Failed,
}

pub struct DeliveryEngine {
    store: Arc<dyn EventStore>,
    subscriber_cache: SubscriberCache,
    transports: HashMap<TransportKind, Arc<dyn Transport>>,
    circuit_breakers: RwLock<HashMap<i64, Arc<CircuitBreaker>>>,
    header_cipher: HeaderCipher,
    retry_policy: RetryPolicy,
    delivery_timeouts: DeliveryConfig,
    dead_letter_threshold: u32,
}

impl DeliveryEngine {
    pub fn new(
        store: Arc<dyn EventStore>,
        transports: HashMap<TransportKind, Arc<dyn Transport>>,
        header_cipher: HeaderCipher,
        retry_policy: RetryPolicy,
        delivery_timeouts: DeliveryConfig,
        dead_letter_threshold: u32,
    ) -> Self {
        Self {
            store,
            subscriber_cache: SubscriberCache::new(),
            transports,
            circuit_breakers: RwLock::new(HashMap::new()),
            header_cipher,
            retry_policy,
            delivery_timeouts,
            dead_letter_threshold,
        }
    }

    fn timeout_for(&self, kind: TransportKind) -> Duration {
        self.delivery_timeouts
            .timeouts_ms
            .get(kind.as_str())
            .copied()
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(10))
    }

    async fn circuit_breaker_for(&self, subscriber_id: i64) -> Arc<CircuitBreaker> {
        {
            let breakers = self.circuit_breakers.read().await;
            if let Some(cb) = breakers.get(&subscriber_id) {
                return cb.clone();
            }
        }
        let mut breakers = self.circuit_breakers.write().await;
        breakers.entry(subscriber_id).or_insert_with(|| Arc::new(CircuitBreaker::new())).clone()
    }

    /// Fans an event out to every matching subscriber and records each attempt.
    pub async fn process_event(&self, event: &Event) -> RouterResult<FanoutOutcome> {
        self.store.set_event_status(event.id, EventStatus::Processing).await?;

        let matching = self.subscriber_cache.matching(self.store.as_ref(), &event.event_type).await?;
        if matching.is_empty() {
            self.store.set_event_status(event.id, EventStatus::Completed).await?;
            return Ok(FanoutOutcome::default());
        }

        let headers = self.decrypt_headers(event).await?;
        let mut outcome = FanoutOutcome { subscribers: matching.len(), ..Default::default() };

        for subscriber in &matching {
            let binding = self.store.get_transport_for(subscriber.id).await?;
            match self.attempt_and_record(event, subscriber.id, 1, &headers, binding.as_ref()).await? {
                AttemptOutcome::Succeeded => outcome.successful += 1,
                AttemptOutcome::Retrying => {
                    outcome.failed += 1;
                    outcome.retries += 1;
                }
                AttemptOutcome::Failed => outcome.failed += 1,
            }
        }

        self.finalize_event_status(event.id).await?;
        Ok(outcome)
    }

    /// Re-attempts delivery for a single due retry task, invoked by the
    /// retry scheduler loop. The retry schedule on the source attempt row
    /// was already cleared atomically by `claim_pending_retries`.
    pub async fn process_retry(&self, task: &RetryTask) -> RouterResult<()> {
        let event = self
            .store
            .get_event(task.event_id)
            .await?
            .ok_or_else(|| RouterError::not_found("event", "id", task.event_id.to_string()))?;

        if event.status.is_terminal() {
            return Ok(());
        }

        let bundle = serde_json::from_str(&task.headers_data)?;
        let headers = match self.header_cipher.decrypt(&bundle) {
            Ok(h) => h,
            Err(e) => {
                self.store
                    .record_attempt(NewAttempt {
                        event_id: task.event_id,
                        subscriber_id: task.subscriber_id,
                        attempt_number: task.next_attempt_number,
                        status_code: None,
                        error_message: Some(format!("decryption failed: {e}")),
                        attempted_at: Utc::now(),
                        duration_ms: None,
                    })
                    .await?;
                self.store.set_event_status(task.event_id, EventStatus::Failed).await?;
                return Ok(());
            }
        };

        let binding = self.store.get_transport_for(task.subscriber_id).await?;
        self.attempt_and_record(&event, task.subscriber_id, task.next_attempt_number, &headers, binding.as_ref())
            .await?;

        self.finalize_event_status(task.event_id).await?;
        Ok(())
    }

    async fn decrypt_headers(&self, event: &Event) -> RouterResult<HashMap<String, String>> {
        let bundle = serde_json::from_str(&event.headers_data)?;
        self.header_cipher
            .decrypt(&bundle)
            .map_err(|e| RouterError::Decryption { event_id: event.id, reason: e.to_string() })
    }

    /// Delivers to one subscriber, records the attempt, and schedules a
    /// retry when admissible.
    async fn attempt_and_record(
        &self,
        event: &Event,
        subscriber_id: i64,
        attempt_number: u32,
        headers: &HashMap<String, String>,
        binding: Option<&hookrelay_core::TransportBinding>,
    ) -> RouterResult<AttemptOutcome> {
        let outcome = match binding {
            None => DeliveryOutcome {
                success: false,
                status_code: None,
                error: Some("subscriber has no transport configured".into()),
                duration_ms: 0,
            },
            Some(binding) => match self.transports.get(&binding.kind) {
                None => DeliveryOutcome {
                    success: false,
                    status_code: None,
                    error: Some(format!("no adapter shipped for transport kind {}", binding.kind)),
                    duration_ms: 0,
                },
                Some(transport) => match transport.validate_config(&binding.config) {
                    Err(reason) => DeliveryOutcome {
                        success: false,
                        status_code: None,
                        error: Some(format!("invalid transport config: {reason}")),
                        duration_ms: 0,
                    },
                    Ok(()) => {
                        self.deliver_through_circuit_breaker(transport.as_ref(), event, subscriber_id, headers, &binding.config, binding.kind)
                            .await
                    }
                },
            },
        };

        self.store
            .record_attempt(NewAttempt {
                event_id: event.id,
                subscriber_id,
                attempt_number,
                status_code: outcome.status_code,
                error_message: outcome.error.clone(),
                attempted_at: Utc::now(),
                duration_ms: Some(outcome.duration_ms),
            })
            .await?;

        if outcome.success {
            return Ok(AttemptOutcome::Succeeded);
        }

        if self.retry_policy.admits_retry(outcome.status_code, attempt_number) {
            let delay = self.retry_policy.backoff(attempt_number);
            let when = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
            self.store.schedule_retry(event.id, subscriber_id, attempt_number, when).await?;
            Ok(AttemptOutcome::Retrying)
        } else {
            Ok(AttemptOutcome::Failed)
        }
    }

    async fn deliver_through_circuit_breaker(
        &self,
        transport: &dyn Transport,
        event: &Event,
        subscriber_id: i64,
        headers: &HashMap<String, String>,
        config: &str,
        kind: TransportKind,
    ) -> DeliveryOutcome {
        let cb = self.circuit_breaker_for(subscriber_id).await;
        let captured: Mutex<Option<DeliveryOutcome>> = Mutex::new(None);

        let request = DeliveryRequest {
            delivery_id: &event.upstream_delivery_id,
            event_type: &event.event_type,
            body: event.payload_data.as_bytes(),
            original_headers: headers,
            timeout: self.timeout_for(kind),
        };

        let result = cb
            .call(|| async {
                let outcome = transport.deliver(&request, config).await;
                let success = outcome.success;
                *captured.lock().unwrap() = Some(outcome);
                if success {
                    Ok(())
                } else {
                    Err(RouterError::transient(event.id, subscriber_id, "delivery failed"))
                }
            })
            .await;

        let delivered = captured.into_inner().unwrap();
        match delivered {
            Some(outcome) => outcome,
            None => {
                // Circuit breaker rejected the call before invoking the
                // transport (open, or half-open call budget exhausted).
                let _ = result;
                DeliveryOutcome {
                    success: false,
                    status_code: None,
                    error: Some("circuit breaker open for this subscriber".into()),
                    duration_ms: 0,
                }
            }
        }
    }

    /// Recomputes event status from the union of latest per-subscriber
    /// attempts: completion reflects all subscribers, not just one. Leaves
    /// status untouched while any subscriber still has a retry scheduled.
    async fn finalize_event_status(&self, event_id: i64) -> RouterResult<()> {
        let attempts = self.store.attempts_for_event(event_id).await?;

        let mut latest: HashMap<i64, &hookrelay_core::DeliveryAttempt> = HashMap::new();
        for attempt in &attempts {
            latest
                .entry(attempt.subscriber_id)
                .and_modify(|current| {
                    if attempt.attempt_number > current.attempt_number {
                        *current = attempt;
                    }
                })
                .or_insert(attempt);
        }

        if latest.values().any(|a| a.next_retry_at.is_some()) {
            return Ok(());
        }

        let is_success = |a: &hookrelay_core::DeliveryAttempt| matches!(a.status_code, Some(code) if (200..300).contains(&code));
        let all_succeeded = latest.values().all(|a| is_success(a));

        if all_succeeded {
            self.store.set_event_status(event_id, EventStatus::Completed).await?;
            return Ok(());
        }

        let any_exhausted = latest
            .values()
            .any(|a| !is_success(a) && a.attempt_number >= self.dead_letter_threshold);

        if any_exhausted {
            self.store.set_event_status(event_id, EventStatus::DeadLetter).await?;
        } else {
            self.store.set_event_status(event_id, EventStatus::Failed).await?;
        }
        Ok(())
    }
}
