//! Queue abstraction: the durable boundary between ingest and workers.
//!
//! The trait models a lease/visibility-timeout contract (send, receive,
//! delete, change-visibility) rather than a plain enqueue/dequeue/mark-
//! complete shape, so an at-least-once worker can crash mid-delivery
//! without losing a message.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hookrelay_core::{RouterError, RouterResult};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

/// The fan-out job carried by a queue message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanoutJob {
    pub event_id: i64,
    pub event_type: String,
    pub delivery_id: String,
}

/// A message as returned by `receive`.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub id: Uuid,
    pub data: FanoutJob,
    pub timestamp: DateTime<Utc>,
    pub attempts: u32,
    pub delay_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub approximate: usize,
    pub in_flight: usize,
    pub delayed: usize,
}

/// `{send, receive, delete, changeVisibility, stats, purge, kind}`,
/// implemented identically by in-process and networked queue backends.
#[async_trait]
pub trait RouterQueue: Send + Sync {
    async fn send(&self, job: FanoutJob, delay_ms: Option<u64>) -> RouterResult<Uuid>;

    /// Blocks up to `wait_time_ms` for up to `max_messages` ready
    /// messages, leasing each for the configured visibility timeout.
    async fn receive(&self, max_messages: usize, wait_time_ms: u64) -> RouterResult<Vec<QueueMessage>>;

    async fn delete(&self, message_id: Uuid) -> RouterResult<()>;

    /// Extends (or, with `ms=0`, immediately clears) a message's lease.
    async fn change_visibility(&self, message_id: Uuid, ms: u64) -> RouterResult<()>;

    async fn stats(&self) -> RouterResult<QueueStats>;

    async fn purge(&self) -> RouterResult<()>;

    async fn close(&self) -> RouterResult<()>;

    async fn is_connected(&self) -> bool;

    fn kind(&self) -> &'static str;
}

struct Entry {
    message: QueueMessage,
    leased_until: Option<DateTime<Utc>>,
}

struct State {
    entries: HashMap<Uuid, Entry>,
    closed: bool,
}

/// In-process queue adapter: messages held in a keyed table, lease
/// expiry honored by timestamp comparison, delayed messages hidden
/// until their visibility time.
pub struct InMemoryQueue {
    state: RwLock<State>,
    visibility_timeout: Duration,
}

impl InMemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: RwLock::new(State {
                entries: HashMap::new(),
                closed: false,
            }),
            visibility_timeout,
        }
    }

    pub fn shared(visibility_timeout: Duration) -> Arc<Self> {
        Arc::new(Self::new(visibility_timeout))
    }

    fn is_ready(entry: &Entry, now: DateTime<Utc>) -> bool {
        let past_delay = entry.message.delay_until.map(|t| t <= now).unwrap_or(true);
        let not_leased = entry.leased_until.map(|t| t <= now).unwrap_or(true);
        past_delay && not_leased
    }
}

#[async_trait]
impl RouterQueue for InMemoryQueue {
    async fn send(&self, job: FanoutJob, delay_ms: Option<u64>) -> RouterResult<Uuid> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let delay_until = delay_ms.map(|ms| now + chrono::Duration::milliseconds(ms as i64));
        let message = QueueMessage {
            id,
            data: job,
            timestamp: now,
            attempts: 0,
            delay_until,
        };
        let mut state = self.state.write().await;
        state.entries.insert(id, Entry { message, leased_until: None });
        Ok(id)
    }

    async fn receive(&self, max_messages: usize, wait_time_ms: u64) -> RouterResult<Vec<QueueMessage>> {
        let deadline = Utc::now() + chrono::Duration::milliseconds(wait_time_ms as i64);
        loop {
            {
                let mut state = self.state.write().await;
                let now = Utc::now();
                let mut leased = Vec::with_capacity(max_messages);
                let ready_ids: Vec<Uuid> = state
                    .entries
                    .iter()
                    .filter(|(_, e)| Self::is_ready(e, now))
                    .take(max_messages)
                    .map(|(id, _)| *id)
                    .collect();
                for id in ready_ids {
                    if let Some(entry) = state.entries.get_mut(&id) {
                        entry.message.attempts += 1;
                        entry.leased_until = Some(now + chrono::Duration::from_std(self.visibility_timeout).unwrap());
                        leased.push(entry.message.clone());
                    }
                }
                if !leased.is_empty() || Utc::now() >= deadline {
                    return Ok(leased);
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn delete(&self, message_id: Uuid) -> RouterResult<()> {
        let mut state = self.state.write().await;
        state.entries.remove(&message_id);
        Ok(())
    }

    async fn change_visibility(&self, message_id: Uuid, ms: u64) -> RouterResult<()> {
        let mut state = self.state.write().await;
        let entry = state
            .entries
            .get_mut(&message_id)
            .ok_or_else(|| RouterError::not_found("queue message", "id", message_id.to_string()))?;
        entry.leased_until = if ms == 0 {
            None
        } else {
            Some(Utc::now() + chrono::Duration::milliseconds(ms as i64))
        };
        Ok(())
    }

    async fn stats(&self) -> RouterResult<QueueStats> {
        let state = self.state.read().await;
        let now = Utc::now();
        let mut stats = QueueStats::default();
        for entry in state.entries.values() {
            if entry.message.delay_until.map(|t| t > now).unwrap_or(false) {
                stats.delayed += 1;
            } else if entry.leased_until.map(|t| t > now).unwrap_or(false) {
                stats.in_flight += 1;
            } else {
                stats.approximate += 1;
            }
        }
        Ok(stats)
    }

    async fn purge(&self) -> RouterResult<()> {
        let mut state = self.state.write().await;
        state.entries.clear();
        Ok(())
    }

    async fn close(&self) -> RouterResult<()> {
        let mut state = self.state.write().await;
        state.closed = true;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        !self.state.read().await.closed
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}
