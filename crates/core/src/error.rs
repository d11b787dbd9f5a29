//! Error taxonomy for hookrelay.
//!
//! `RouterError` groups variants by the six error kinds of the
//! specification: admission, duplicate event, transient delivery,
//! permanent delivery, infrastructure, and decryption errors.

use thiserror::Error;

/// The main error type for router operations.
#[derive(Debug, Error)]
pub enum RouterError {
    // ==================== Admission errors ====================
    /// Signature missing, malformed, or not produced with the configured secret.
    #[error("unauthorized: {reason}")]
    Unauthorized { reason: String },

    /// Required headers missing or the body could not be parsed.
    #[error("bad request: {reason}")]
    BadRequest { reason: String },

    /// Request body exceeded the configured size limit.
    #[error("payload too large: {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    /// Client exceeded the configured request rate.
    #[error("rate limited")]
    RateLimited,

    /// Client IP is not present in the configured allowlist.
    #[error("ip not allowed: {ip}")]
    IpNotAllowed { ip: String },

    // ==================== Duplicate event ====================
    /// `storeEvent` rejected an already-seen upstream delivery id.
    #[error("event already exists: upstream_delivery_id={upstream_delivery_id}")]
    DuplicateEvent { upstream_delivery_id: String },

    // ==================== Transient delivery errors ====================
    /// Network timeout, 5xx, 408, 429 or connection refused; eligible for retry.
    #[error("transient delivery error for event {event_id} subscriber {subscriber_id}: {reason}")]
    TransientDelivery {
        event_id: i64,
        subscriber_id: i64,
        reason: String,
    },

    // ==================== Permanent delivery errors ====================
    /// 4xx other than 408/429, invalid subscriber config, or missing transport.
    #[error("permanent delivery error for event {event_id} subscriber {subscriber_id}: {reason}")]
    PermanentDelivery {
        event_id: i64,
        subscriber_id: i64,
        reason: String,
    },

    // ==================== Infrastructure errors ====================
    /// The store is unreachable.
    #[error("store unreachable: {message}")]
    StoreUnavailable { message: String },

    /// The queue is unreachable.
    #[error("queue unreachable: {message}")]
    QueueUnavailable { message: String },

    // ==================== Decryption errors ====================
    /// Headers blob was corrupt or keyed with the wrong secret.
    #[error("decryption failed for event {event_id}: {reason}")]
    Decryption { event_id: i64, reason: String },

    // ==================== Not found / config / internal ====================
    #[error("not found: {entity} with {key}={value}")]
    NotFound {
        entity: String,
        key: String,
        value: String,
    },

    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },

    #[error("serialization error: {message}")]
    Serialization { message: String },
}

impl RouterError {
    pub fn transient(event_id: i64, subscriber_id: i64, reason: impl Into<String>) -> Self {
        Self::TransientDelivery {
            event_id,
            subscriber_id,
            reason: reason.into(),
        }
    }

    pub fn permanent(event_id: i64, subscriber_id: i64, reason: impl Into<String>) -> Self {
        Self::PermanentDelivery {
            event_id,
            subscriber_id,
            reason: reason.into(),
        }
    }

    pub fn not_found(entity: impl Into<String>, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Whether this error is recoverable by retry policy (kind 3 vs 4).
    pub fn is_retryable_delivery(&self) -> bool {
        matches!(self, Self::TransientDelivery { .. })
    }

    /// HTTP status appropriate for admission-level errors.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Unauthorized { .. } => 401,
            Self::BadRequest { .. } => 400,
            Self::PayloadTooLarge { .. } => 413,
            Self::RateLimited => 429,
            Self::IpNotAllowed { .. } => 403,
            Self::DuplicateEvent { .. } => 200,
            Self::NotFound { .. } => 404,
            _ => 500,
        }
    }
}

pub type RouterResult<T> = Result<T, RouterError>;

impl From<serde_json::Error> for RouterError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_admission_contract() {
        assert_eq!(RouterError::Unauthorized { reason: "x".into() }.status_code(), 401);
        assert_eq!(RouterError::PayloadTooLarge { size: 10, limit: 5 }.status_code(), 413);
        assert_eq!(RouterError::RateLimited.status_code(), 429);
        assert_eq!(RouterError::IpNotAllowed { ip: "1.2.3.4".into() }.status_code(), 403);
        assert_eq!(
            RouterError::BadRequest { reason: "missing header".into() }.status_code(),
            400
        );
    }

    #[test]
    fn duplicate_event_is_treated_as_success() {
        let err = RouterError::DuplicateEvent {
            upstream_delivery_id: "D1".into(),
        };
        assert_eq!(err.status_code(), 200);
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(RouterError::transient(1, 1, "timeout").is_retryable_delivery());
        assert!(!RouterError::permanent(1, 1, "404 from sink").is_retryable_delivery());
    }
}
