//! Ingest validator: accepts incoming HTTP POSTs carrying a signed
//! payload and normalizes them into a storable event.
//!
//! A struct wrapping a secret plus a `validate`-style entry point, run
//! as an ordered, short-circuiting check list with a header-allowlist
//! capture for whatever ends up stored alongside the event.

use crate::rate_limiter::IpRateLimiter;
use hookrelay_core::{RouterError, RouterResult, SecurityConfig};
use ipnet::IpNet;
use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;

/// Header names the upstream platform is expected to send.
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
pub const EVENT_TYPE_HEADER: &str = "x-github-event";
pub const DELIVERY_ID_HEADER: &str = "x-github-delivery";
pub const CONTENT_TYPE_HEADER: &str = "content-type";
pub const USER_AGENT_HEADER: &str = "user-agent";

/// The header allowlist captured into `Event.headers_data`.
const CAPTURED_HEADERS: &[&str] = &[
    SIGNATURE_HEADER,
    EVENT_TYPE_HEADER,
    DELIVERY_ID_HEADER,
    CONTENT_TYPE_HEADER,
    USER_AGENT_HEADER,
];

/// Parses each configured entry as a CIDR block (`"10.0.0.0/8"`) or a
/// plain address (`"1.2.3.4"`, treated as a single-host /32 or /128
/// network). Entries that parse as neither are dropped.
fn parse_allowlist(entries: &[String]) -> Vec<IpNet> {
    entries
        .iter()
        .filter_map(|entry| IpNet::from_str(entry).or_else(|_| IpAddr::from_str(entry).map(IpNet::from)).ok())
        .collect()
}

/// A request that has passed every admission check, ready to be handed
/// to the event store.
#[derive(Debug, Clone)]
pub struct AcceptedIngest {
    pub event_type: String,
    pub upstream_delivery_id: String,
    pub captured_headers: HashMap<String, String>,
}

pub struct IngestValidator {
    webhook_secret: String,
    ip_allowlist: Vec<IpNet>,
    rate_limiter: Option<IpRateLimiter>,
    payload_size_limit_bytes: usize,
}

impl IngestValidator {
    pub fn new(webhook_secret: impl Into<String>, security: &SecurityConfig) -> Self {
        let rate_limiter = security.rate_limiting_enabled.then(|| {
            IpRateLimiter::new(crate::rate_limiter::RateLimit {
                requests_per_minute: security.requests_per_minute,
                burst: security.requests_per_minute,
            })
        });
        Self {
            webhook_secret: webhook_secret.into(),
            ip_allowlist: parse_allowlist(&security.ip_allowlist),
            rate_limiter,
            payload_size_limit_bytes: security.payload_size_limit_mb as usize * 1024 * 1024,
        }
    }

    /// Runs the ordered, short-circuiting check list and, on success,
    /// returns the normalized fields needed to store the event. `headers`
    /// keys must already be lower-cased.
    pub async fn validate(
        &self,
        client_ip: &str,
        headers: &HashMap<String, String>,
        body: &[u8],
    ) -> RouterResult<AcceptedIngest> {
        // (a) IP allowlist, if configured.
        if !self.ip_allowlist.is_empty() {
            let parsed_ip = IpAddr::from_str(client_ip)
                .map_err(|_| RouterError::IpNotAllowed { ip: client_ip.to_string() })?;
            if !self.ip_allowlist.iter().any(|net| net.contains(&parsed_ip)) {
                return Err(RouterError::IpNotAllowed { ip: client_ip.to_string() });
            }
        }

        // (b) token-bucket rate limit per client IP.
        if let Some(limiter) = &self.rate_limiter {
            limiter.check(client_ip).await?;
        }

        // (c) content-length.
        if body.len() > self.payload_size_limit_bytes {
            return Err(RouterError::PayloadTooLarge {
                size: body.len(),
                limit: self.payload_size_limit_bytes,
            });
        }

        // (d) presence of signature, event-type, delivery-id headers.
        let signature = headers
            .get(SIGNATURE_HEADER)
            .ok_or_else(|| RouterError::BadRequest { reason: format!("missing {SIGNATURE_HEADER} header") })?;
        let event_type = headers
            .get(EVENT_TYPE_HEADER)
            .ok_or_else(|| RouterError::BadRequest { reason: format!("missing {EVENT_TYPE_HEADER} header") })?;
        let delivery_id = headers
            .get(DELIVERY_ID_HEADER)
            .ok_or_else(|| RouterError::BadRequest { reason: format!("missing {DELIVERY_ID_HEADER} header") })?;

        // (e) constant-time HMAC verification.
        hookrelay_crypto::verify_hmac_sha256(&self.webhook_secret, body, signature)
            .map_err(|_| RouterError::Unauthorized { reason: "signature mismatch".into() })?;

        // Body must be well-formed JSON.
        if serde_json::from_slice::<serde_json::Value>(body).is_err() {
            return Err(RouterError::BadRequest { reason: "body is not valid JSON".into() });
        }

        let captured_headers = headers
            .iter()
            .filter(|(name, _)| CAPTURED_HEADERS.contains(&name.as_str()))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        Ok(AcceptedIngest {
            event_type: event_type.clone(),
            upstream_delivery_id: delivery_id.clone(),
            captured_headers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn security() -> SecurityConfig {
        SecurityConfig {
            rate_limiting_enabled: true,
            requests_per_minute: 600,
            payload_size_limit_mb: 5,
            ip_allowlist: Vec::new(),
        }
    }

    fn signed_headers(secret: &str, body: &[u8]) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert(SIGNATURE_HEADER.to_string(), hookrelay_crypto::sign_hmac_sha256(secret, body));
        headers.insert(EVENT_TYPE_HEADER.to_string(), "push".to_string());
        headers.insert(DELIVERY_ID_HEADER.to_string(), "D1".to_string());
        headers.insert(CONTENT_TYPE_HEADER.to_string(), "application/json".to_string());
        headers.insert(USER_AGENT_HEADER.to_string(), "GitHub-Hookshot/abc".to_string());
        headers
    }

    #[tokio::test]
    async fn accepts_a_correctly_signed_request() {
        let validator = IngestValidator::new("core-secret", &security());
        let body = br#"{"ref":"refs/heads/main"}"#;
        let headers = signed_headers("core-secret", body);
        let accepted = validator.validate("1.2.3.4", &headers, body).await.unwrap();
        assert_eq!(accepted.event_type, "push");
        assert_eq!(accepted.upstream_delivery_id, "D1");
        assert_eq!(accepted.captured_headers.len(), 5);
    }

    #[tokio::test]
    async fn rejects_wrong_signature() {
        let validator = IngestValidator::new("core-secret", &security());
        let body = br#"{"ref":"refs/heads/main"}"#;
        let headers = signed_headers("wrong-secret", body);
        let err = validator.validate("1.2.3.4", &headers, body).await.unwrap_err();
        assert!(matches!(err, RouterError::Unauthorized { .. }));
    }

    #[tokio::test]
    async fn rejects_missing_headers() {
        let validator = IngestValidator::new("core-secret", &security());
        let body = br#"{}"#;
        let mut headers = signed_headers("core-secret", body);
        headers.remove(DELIVERY_ID_HEADER);
        let err = validator.validate("1.2.3.4", &headers, body).await.unwrap_err();
        assert!(matches!(err, RouterError::BadRequest { .. }));
    }

    #[tokio::test]
    async fn rejects_oversized_payload() {
        let mut security = security();
        security.payload_size_limit_mb = 0;
        let validator = IngestValidator::new("core-secret", &security);
        let body = br#"{"a":1}"#;
        let headers = signed_headers("core-secret", body);
        let err = validator.validate("1.2.3.4", &headers, body).await.unwrap_err();
        assert!(matches!(err, RouterError::PayloadTooLarge { .. }));
    }

    #[tokio::test]
    async fn rejects_ip_outside_allowlist() {
        let mut security = security();
        security.ip_allowlist = vec!["9.9.9.9".to_string()];
        let validator = IngestValidator::new("core-secret", &security);
        let body = br#"{}"#;
        let headers = signed_headers("core-secret", body);
        let err = validator.validate("1.2.3.4", &headers, body).await.unwrap_err();
        assert!(matches!(err, RouterError::IpNotAllowed { .. }));
    }

    #[tokio::test]
    async fn accepts_ip_inside_cidr_block() {
        let mut security = security();
        security.ip_allowlist = vec!["1.2.3.0/24".to_string()];
        let validator = IngestValidator::new("core-secret", &security);
        let body = br#"{}"#;
        let headers = signed_headers("core-secret", body);
        assert!(validator.validate("1.2.3.4", &headers, body).await.is_ok());
    }

    #[tokio::test]
    async fn rejects_ip_outside_cidr_block() {
        let mut security = security();
        security.ip_allowlist = vec!["1.2.3.0/24".to_string()];
        let validator = IngestValidator::new("core-secret", &security);
        let body = br#"{}"#;
        let headers = signed_headers("core-secret", body);
        let err = validator.validate("1.2.4.4", &headers, body).await.unwrap_err();
        assert!(matches!(err, RouterError::IpNotAllowed { .. }));
    }

    #[tokio::test]
    async fn rejects_malformed_json_body() {
        let validator = IngestValidator::new("core-secret", &security());
        let body = b"not json";
        let headers = signed_headers("core-secret", body);
        let err = validator.validate("1.2.3.4", &headers, body).await.unwrap_err();
        assert!(matches!(err, RouterError::BadRequest { .. }));
    }
}
