//! Transport adapters: polymorphic over a single capability set,
//! `{deliver, validateConfig, kind, close}`, selected by configuration
//! tag.
//!
//! `HttpWebhookTransport` signs and POSTs a webhook body directly.
//! `GenericEnvelopeTransport` and `AmqpBrokerTransport` stand in for the
//! pubsub/cloud-queue/cloud-event-bus/log-stream-broker/amqp variants,
//! publishing a canonical envelope rather than linking a real vendor SDK
//! (documented in DESIGN.md).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hookrelay_core::TransportKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Result of a single delivery attempt against a transport.
#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    pub success: bool,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Everything a transport needs to perform one delivery. Headers arrive
/// already decrypted; the delivery engine owns decryption.
pub struct DeliveryRequest<'a> {
    pub delivery_id: &'a str,
    pub event_type: &'a str,
    pub body: &'a [u8],
    pub original_headers: &'a HashMap<String, String>,
    pub timeout: Duration,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(&self, request: &DeliveryRequest<'_>, config: &str) -> DeliveryOutcome;

    fn validate_config(&self, config: &str) -> Result<(), String>;

    fn kind(&self) -> TransportKind;

    async fn close(&self);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpWebhookConfig {
    pub url: String,
    pub secret: String,
    #[serde(default)]
    pub allow_insecure: bool,
}

/// Signs and POSTs a body directly to a subscriber's HTTP endpoint.
#[cfg(feature = "http-transport")]
pub struct HttpWebhookTransport {
    client: reqwest::Client,
}

#[cfg(feature = "http-transport")]
impl HttpWebhookTransport {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

#[cfg(feature = "http-transport")]
impl Default for HttpWebhookTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "http-transport")]
#[async_trait]
impl Transport for HttpWebhookTransport {
    async fn deliver(&self, request: &DeliveryRequest<'_>, config: &str) -> DeliveryOutcome {
        let start = Instant::now();

        let config: HttpWebhookConfig = match serde_json::from_str(config) {
            Ok(c) => c,
            Err(e) => {
                return DeliveryOutcome {
                    success: false,
                    status_code: None,
                    error: Some(format!("invalid http-webhook config: {e}")),
                    duration_ms: start.elapsed().as_millis() as u64,
                }
            }
        };

        if !config.allow_insecure && !config.url.starts_with("https://") {
            return DeliveryOutcome {
                success: false,
                status_code: None,
                error: Some("target url must be https unless allow_insecure is set".into()),
                duration_ms: start.elapsed().as_millis() as u64,
            };
        }

        let signature = hookrelay_crypto::sign_hmac_sha256(&config.secret, request.body);

        let mut req = self
            .client
            .post(&config.url)
            .timeout(request.timeout)
            .header("content-type", "application/json")
            .header("content-length", request.body.len().to_string())
            .header(crate::receiver::SIGNATURE_HEADER, signature);

        for (name, value) in request.original_headers {
            let lower = name.to_ascii_lowercase();
            if lower == crate::receiver::SIGNATURE_HEADER || lower == "content-type" || lower == "content-length" {
                continue;
            }
            req = req.header(name, value);
        }

        let response = req.body(request.body.to_vec()).send().await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match response {
            Ok(resp) => {
                let status = resp.status().as_u16();
                if (200..300).contains(&status) {
                    DeliveryOutcome { success: true, status_code: Some(status), error: None, duration_ms }
                } else {
                    DeliveryOutcome {
                        success: false,
                        status_code: Some(status),
                        error: Some(format!("http {status}")),
                        duration_ms,
                    }
                }
            }
            Err(e) => DeliveryOutcome {
                success: false,
                status_code: None,
                error: Some(e.to_string()),
                duration_ms,
            },
        }
    }

    fn validate_config(&self, config: &str) -> Result<(), String> {
        let config: HttpWebhookConfig = serde_json::from_str(config).map_err(|e| e.to_string())?;
        if config.url.is_empty() {
            return Err("url must not be empty".into());
        }
        if !config.allow_insecure && !config.url.starts_with("https://") {
            return Err("url must be https unless allow_insecure is set".into());
        }
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::HttpWebhook
    }

    async fn close(&self) {}
}

/// Canonical envelope published to the non-HTTP transport variants,
/// `{event, payload, headers, deliveryId, timestamp}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    pub payload: serde_json::Value,
    pub headers: HashMap<String, String>,
    pub delivery_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenericEnvelopeConfig {
    /// Opaque publish target (topic/channel/queue name); resolved to an
    /// HTTP facade endpoint for the adapter, standing in for a vendor
    /// SDK's publish call.
    pub target: String,
}

/// Stand-in for pubsub/cloud-queue/cloud-event-bus/log-stream-broker:
/// publishes the canonical envelope as JSON to an HTTP facade at
/// `target`. Success = 2xx, treated as the broker's publish
/// acknowledgment.
#[cfg(feature = "http-transport")]
pub struct GenericEnvelopeTransport {
    client: reqwest::Client,
    kind: TransportKind,
}

#[cfg(feature = "http-transport")]
impl GenericEnvelopeTransport {
    pub fn new(kind: TransportKind) -> Self {
        Self { client: reqwest::Client::new(), kind }
    }
}

#[cfg(feature = "http-transport")]
#[async_trait]
impl Transport for GenericEnvelopeTransport {
    async fn deliver(&self, request: &DeliveryRequest<'_>, config: &str) -> DeliveryOutcome {
        let start = Instant::now();

        let config: GenericEnvelopeConfig = match serde_json::from_str(config) {
            Ok(c) => c,
            Err(e) => {
                return DeliveryOutcome {
                    success: false,
                    status_code: None,
                    error: Some(format!("invalid envelope config: {e}")),
                    duration_ms: start.elapsed().as_millis() as u64,
                }
            }
        };

        let payload: serde_json::Value = serde_json::from_slice(request.body).unwrap_or(serde_json::Value::Null);
        let envelope = Envelope {
            event: request.event_type.to_string(),
            payload,
            headers: request.original_headers.clone(),
            delivery_id: request.delivery_id.to_string(),
            timestamp: Utc::now(),
        };

        let response = self
            .client
            .post(&config.target)
            .timeout(request.timeout)
            .json(&envelope)
            .send()
            .await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match response {
            Ok(resp) => {
                let status = resp.status().as_u16();
                if (200..300).contains(&status) {
                    DeliveryOutcome { success: true, status_code: Some(status), error: None, duration_ms }
                } else {
                    DeliveryOutcome {
                        success: false,
                        status_code: Some(status),
                        error: Some(format!("http {status}")),
                        duration_ms,
                    }
                }
            }
            Err(e) => DeliveryOutcome { success: false, status_code: None, error: Some(e.to_string()), duration_ms },
        }
    }

    fn validate_config(&self, config: &str) -> Result<(), String> {
        let config: GenericEnvelopeConfig = serde_json::from_str(config).map_err(|e| e.to_string())?;
        if config.target.is_empty() {
            return Err("target must not be empty".into());
        }
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn close(&self) {}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmqpBrokerConfig {
    pub uri: String,
    pub exchange: String,
    pub routing_key: String,
}

/// amqp-broker transport: publishes the canonical envelope to an
/// exchange/routing-key, caching one connection per unique uri.
#[cfg(feature = "amqp-transport")]
pub struct AmqpBrokerTransport {
    connections: tokio::sync::Mutex<HashMap<String, std::sync::Arc<lapin::Connection>>>,
}

#[cfg(feature = "amqp-transport")]
impl AmqpBrokerTransport {
    pub fn new() -> Self {
        Self { connections: tokio::sync::Mutex::new(HashMap::new()) }
    }

    async fn connection_for(&self, uri: &str) -> Result<std::sync::Arc<lapin::Connection>, lapin::Error> {
        let mut connections = self.connections.lock().await;
        if let Some(conn) = connections.get(uri) {
            return Ok(conn.clone());
        }
        let conn = lapin::Connection::connect(uri, lapin::ConnectionProperties::default()).await?;
        let conn = std::sync::Arc::new(conn);
        connections.insert(uri.to_string(), conn.clone());
        Ok(conn)
    }
}

#[cfg(feature = "amqp-transport")]
impl Default for AmqpBrokerTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "amqp-transport")]
#[async_trait]
impl Transport for AmqpBrokerTransport {
    async fn deliver(&self, request: &DeliveryRequest<'_>, config: &str) -> DeliveryOutcome {
        let start = Instant::now();

        let config: AmqpBrokerConfig = match serde_json::from_str(config) {
            Ok(c) => c,
            Err(e) => {
                return DeliveryOutcome {
                    success: false,
                    status_code: None,
                    error: Some(format!("invalid amqp-broker config: {e}")),
                    duration_ms: start.elapsed().as_millis() as u64,
                }
            }
        };

        let payload: serde_json::Value = serde_json::from_slice(request.body).unwrap_or(serde_json::Value::Null);
        let envelope = Envelope {
            event: request.event_type.to_string(),
            payload,
            headers: request.original_headers.clone(),
            delivery_id: request.delivery_id.to_string(),
            timestamp: Utc::now(),
        };
        let body = match serde_json::to_vec(&envelope) {
            Ok(b) => b,
            Err(e) => {
                return DeliveryOutcome {
                    success: false,
                    status_code: None,
                    error: Some(e.to_string()),
                    duration_ms: start.elapsed().as_millis() as u64,
                }
            }
        };

        let result: Result<(), lapin::Error> = async {
            let conn = self.connection_for(&config.uri).await?;
            let channel = conn.create_channel().await?;
            let confirm = channel
                .basic_publish(
                    &config.exchange,
                    &config.routing_key,
                    lapin::options::BasicPublishOptions::default(),
                    &body,
                    lapin::BasicProperties::default().with_content_type("application/json".into()),
                )
                .await?;
            confirm.await?;
            Ok(())
        }
        .await;

        let duration_ms = start.elapsed().as_millis() as u64;
        match result {
            Ok(()) => DeliveryOutcome { success: true, status_code: None, error: None, duration_ms },
            Err(e) => DeliveryOutcome { success: false, status_code: None, error: Some(e.to_string()), duration_ms },
        }
    }

    fn validate_config(&self, config: &str) -> Result<(), String> {
        let config: AmqpBrokerConfig = serde_json::from_str(config).map_err(|e| e.to_string())?;
        if config.uri.is_empty() || config.exchange.is_empty() {
            return Err("uri and exchange must not be empty".into());
        }
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::AmqpBroker
    }

    async fn close(&self) {
        let mut connections = self.connections.lock().await;
        for (_, conn) in connections.drain() {
            let _ = conn.close(200, "shutdown").await;
        }
    }
}

#[cfg(all(test, feature = "http-transport"))]
mod tests {
    use super::*;

    #[test]
    fn http_webhook_config_rejects_insecure_url_by_default() {
        let transport = HttpWebhookTransport::new();
        let config = r#"{"url":"http://example.com","secret":"s"}"#;
        assert!(transport.validate_config(config).is_err());
    }

    #[test]
    fn http_webhook_config_allows_insecure_when_configured() {
        let transport = HttpWebhookTransport::new();
        let config = r#"{"url":"http://example.com","secret":"s","allow_insecure":true}"#;
        assert!(transport.validate_config(config).is_ok());
    }

    #[test]
    fn generic_envelope_config_requires_a_target() {
        let transport = GenericEnvelopeTransport::new(TransportKind::Pubsub);
        assert!(transport.validate_config(r#"{"target":""}"#).is_err());
        assert!(transport.validate_config(r#"{"target":"https://sink.example/topic"}"#).is_ok());
    }
}
