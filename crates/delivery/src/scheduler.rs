//! Retry scheduler: polls the store for due retries and drives them
//! back through the delivery engine.
//!
//! A loop spawned with `tokio::spawn`, woken on an interval, stoppable
//! via a cancellation signal.

use crate::engine::DeliveryEngine;
use hookrelay_core::RouterResult;
use hookrelay_store::EventStore;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct RetryScheduler {
    store: Arc<dyn EventStore>,
    engine: Arc<DeliveryEngine>,
    batch_size: usize,
    interval: Duration,
}

impl RetryScheduler {
    pub fn new(store: Arc<dyn EventStore>, engine: Arc<DeliveryEngine>, batch_size: usize, interval: Duration) -> Self {
        Self { store, engine, batch_size, interval }
    }

    /// Runs until `shutdown` is cancelled, awaiting the in-flight batch
    /// before returning.
    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("retry scheduler shutting down");
                    return;
                }
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.run_once().await {
                        tracing::warn!(error = %e, "retry scheduler batch failed");
                    }
                }
            }
        }
    }

    /// Claims and processes up to `batch_size` due retries. A crash
    /// mid-batch leaves the remaining tasks scheduled (next_retry_at
    /// still ≤ now) for the next tick or another instance to pick up.
    pub async fn run_once(&self) -> RouterResult<()> {
        let tasks = self.store.claim_pending_retries(self.batch_size).await?;
        for task in &tasks {
            if let Err(e) = self.engine.process_retry(task).await {
                tracing::warn!(
                    event_id = task.event_id,
                    subscriber_id = task.subscriber_id,
                    error = %e,
                    "processRetry failed"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::transport::{DeliveryOutcome, DeliveryRequest, Transport};
    use async_trait::async_trait;
    use chrono::Utc;
    use hookrelay_core::{DeliveryConfig, RetryConfig, Subscriber, TransportKind};
    use hookrelay_crypto::HeaderCipher;
    use hookrelay_store::{InMemoryEventStore, NewEvent};
    use std::collections::{HashMap, HashSet};

    struct AlwaysSucceeds;

    #[async_trait]
    impl Transport for AlwaysSucceeds {
        async fn deliver(&self, _request: &DeliveryRequest<'_>, _config: &str) -> DeliveryOutcome {
            DeliveryOutcome { success: true, status_code: Some(200), error: None, duration_ms: 1 }
        }
        fn validate_config(&self, _config: &str) -> Result<(), String> {
            Ok(())
        }
        fn kind(&self) -> TransportKind {
            TransportKind::HttpWebhook
        }
        async fn close(&self) {}
    }

    #[tokio::test]
    async fn run_once_processes_due_retries() {
        let store = Arc::new(InMemoryEventStore::new());
        store
            .seed_subscriber(
                Subscriber { id: 1, name: "s".into(), events: HashSet::from(["push".to_string()]) },
                TransportKind::HttpWebhook,
                r#"{"url":"https://sink.test/wh","secret":"s"}"#,
            )
            .await;
        let cipher = HeaderCipher::new("master-secret");
        let bundle = cipher.encrypt(&HashMap::new()).unwrap();
        let outcome = store
            .store_event(NewEvent {
                upstream_delivery_id: "D1".into(),
                event_type: "push".into(),
                payload_hash: hookrelay_crypto::hash_payload(b"{}"),
                payload_size: 2,
                payload_data: "{}".into(),
                headers_data: serde_json::to_string(&bundle).unwrap(),
                received_at: Utc::now(),
            })
            .await
            .unwrap();
        let event_id = match outcome {
            hookrelay_store::StoreEventOutcome::Created(id) => id,
            hookrelay_store::StoreEventOutcome::AlreadyExists(id) => id,
        };
        store
            .record_attempt(hookrelay_store::NewAttempt {
                event_id,
                subscriber_id: 1,
                attempt_number: 1,
                status_code: Some(503),
                error_message: Some("http 503".into()),
                attempted_at: Utc::now(),
                duration_ms: Some(5),
            })
            .await
            .unwrap();
        store.schedule_retry(event_id, 1, 1, Utc::now() - chrono::Duration::seconds(1)).await.unwrap();

        let mut transports: HashMap<TransportKind, Arc<dyn Transport>> = HashMap::new();
        transports.insert(TransportKind::HttpWebhook, Arc::new(AlwaysSucceeds));
        let retry_policy = RetryPolicy::from_config(&RetryConfig::default());
        let engine = Arc::new(DeliveryEngine::new(
            store.clone(),
            transports,
            HeaderCipher::new("master-secret"),
            retry_policy,
            DeliveryConfig::default(),
            5,
        ));

        let scheduler = RetryScheduler::new(store.clone(), engine, 10, Duration::from_secs(1));
        scheduler.run_once().await.unwrap();

        let event = store.get_event(event_id).await.unwrap().unwrap();
        assert_eq!(event.status, hookrelay_core::EventStatus::Completed);
    }
}
