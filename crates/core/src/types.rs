//! Domain model: `Subscriber`, `TransportBinding`, `Event`, `DeliveryAttempt`,
//! and the derived `RetryTask` view.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Transport kind tag for a `TransportBinding`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    HttpWebhook,
    Pubsub,
    LogStreamBroker,
    CloudQueue,
    CloudEventBus,
    AmqpBroker,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HttpWebhook => "http-webhook",
            Self::Pubsub => "pubsub",
            Self::LogStreamBroker => "log-stream-broker",
            Self::CloudQueue => "cloud-queue",
            Self::CloudEventBus => "cloud-event-bus",
            Self::AmqpBroker => "amqp-broker",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A downstream subscriber. Owns exactly one `TransportBinding` (1:1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: i64,
    pub name: String,
    /// Non-empty set of event-type strings this subscriber is interested in.
    pub events: HashSet<String>,
}

impl Subscriber {
    /// Whether this subscriber's event-type set contains the given event type.
    pub fn matches(&self, event_type: &str) -> bool {
        self.events.contains(event_type)
    }
}

/// Transport configuration owned 1:1 by a subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportBinding {
    pub id: i64,
    pub subscriber_id: i64,
    pub kind: TransportKind,
    /// Opaque, kind-specific configuration, stored as a serialized JSON string.
    /// May contain credentials; callers must treat it as sensitive.
    pub config: String,
}

/// Processing status of an `Event`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    DeadLetter,
}

impl EventStatus {
    /// Whether `self -> next` is an allowed transition.
    pub fn can_transition_to(&self, next: EventStatus) -> bool {
        use EventStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, DeadLetter)
                | (Failed, DeadLetter)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Completed | EventStatus::DeadLetter)
    }
}

/// A durably stored inbound event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub upstream_delivery_id: String,
    pub event_type: String,
    /// Hex-encoded SHA-256 of `payload_data`.
    pub payload_hash: String,
    pub payload_size: usize,
    pub payload_data: String,
    /// Serialized `{encrypted, iv, tag, salt}` bundle.
    pub headers_data: String,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub status: EventStatus,
}

/// A single delivery attempt against one subscriber for one event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub id: i64,
    pub event_id: i64,
    pub subscriber_id: i64,
    /// Monotonic per (event, subscriber), starting at 1.
    pub attempt_number: u32,
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
    pub attempted_at: DateTime<Utc>,
    pub duration_ms: Option<u64>,
    /// Non-null exactly when this row is the scheduled next attempt.
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Derived (not persisted) view joining a due `DeliveryAttempt` with its `Event`.
#[derive(Debug, Clone)]
pub struct RetryTask {
    pub event_id: i64,
    pub subscriber_id: i64,
    pub next_attempt_number: u32,
    pub payload_data: String,
    pub headers_data: String,
    pub event_type: String,
}

/// Aggregate counts returned by `eventStats()`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EventStats {
    pub total: u64,
    pub pending: u64,
    pub failed: u64,
    pub completed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscriber(events: &[&str]) -> Subscriber {
        Subscriber {
            id: 1,
            name: "s".into(),
            events: events.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn exact_match() {
        assert!(subscriber(&["push"]).matches("push"));
        assert!(!subscriber(&["push"]).matches("pull_request"));
    }

    #[test]
    fn multiple_event_types_match_independently() {
        let s = subscriber(&["push", "pull_request"]);
        assert!(s.matches("push"));
        assert!(s.matches("pull_request"));
        assert!(!s.matches("issue_comment"));
    }

    #[test]
    fn status_transitions() {
        use EventStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(DeadLetter));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Processing));
        assert!(Completed.is_terminal());
        assert!(DeadLetter.is_terminal());
        assert!(!Failed.is_terminal());
    }
}
