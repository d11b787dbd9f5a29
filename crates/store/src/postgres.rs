//! Postgres-backed `EventStore` (feature `postgres`), backed by concrete
//! tables, columns and indexes rather than a generic key-value layout
//! (documented in DESIGN.md).

#![cfg(feature = "postgres")]

use crate::repository::{EventStore, NewAttempt, NewEvent, StoreEventOutcome};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hookrelay_core::{
    DeliveryAttempt, Event, EventStats, EventStatus, RetryTask, RouterError, RouterResult,
    Subscriber, TransportBinding, TransportKind,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::collections::HashSet;

/// Decodes a single column, converting the sqlx decode error into the
/// router's own error taxonomy rather than unwrapping.
fn col<'r, T>(row: &'r PgRow, name: &'static str) -> RouterResult<T>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(name)
        .map_err(|e| RouterError::internal(format!("decoding column {name}: {e}")))
}

pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the four logical tables and required indexes if they do
    /// not already exist. Intended for first-run bootstrap; production
    /// deployments are expected to manage schema via a dedicated
    /// migration tool.
    pub async fn migrate(&self) -> RouterResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS subscribers (
                id BIGSERIAL PRIMARY KEY,
                name TEXT NOT NULL,
                events JSONB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS transports (
                id BIGSERIAL PRIMARY KEY,
                subscriber_id BIGINT NOT NULL REFERENCES subscribers(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                config TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS events (
                id BIGSERIAL PRIMARY KEY,
                upstream_delivery_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                payload_hash TEXT NOT NULL,
                payload_size BIGINT NOT NULL,
                payload_data TEXT NOT NULL,
                headers_data TEXT NOT NULL,
                received_at TIMESTAMPTZ NOT NULL,
                processed_at TIMESTAMPTZ,
                status TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS events_upstream_delivery_id_uidx
                ON events (upstream_delivery_id);
            CREATE INDEX IF NOT EXISTS events_status_idx ON events (status);
            CREATE INDEX IF NOT EXISTS events_received_at_idx ON events (received_at DESC);
            CREATE TABLE IF NOT EXISTS delivery_attempts (
                id BIGSERIAL PRIMARY KEY,
                event_id BIGINT NOT NULL REFERENCES events(id),
                subscriber_id BIGINT NOT NULL REFERENCES subscribers(id),
                attempt_number INT NOT NULL,
                status_code INT,
                error_message TEXT,
                attempted_at TIMESTAMPTZ NOT NULL,
                duration_ms BIGINT,
                next_retry_at TIMESTAMPTZ
            );
            CREATE INDEX IF NOT EXISTS delivery_attempts_event_subscriber_idx
                ON delivery_attempts (event_id, subscriber_id);
            CREATE INDEX IF NOT EXISTS delivery_attempts_next_retry_at_idx
                ON delivery_attempts (next_retry_at) WHERE next_retry_at IS NOT NULL;
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| RouterError::StoreUnavailable { message: e.to_string() })?;
        Ok(())
    }

    fn status_str(status: EventStatus) -> &'static str {
        match status {
            EventStatus::Pending => "pending",
            EventStatus::Processing => "processing",
            EventStatus::Completed => "completed",
            EventStatus::Failed => "failed",
            EventStatus::DeadLetter => "dead-letter",
        }
    }

    fn status_from_str(s: &str) -> RouterResult<EventStatus> {
        Ok(match s {
            "pending" => EventStatus::Pending,
            "processing" => EventStatus::Processing,
            "completed" => EventStatus::Completed,
            "failed" => EventStatus::Failed,
            "dead-letter" => EventStatus::DeadLetter,
            other => return Err(RouterError::internal(format!("unknown event status: {other}"))),
        })
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn store_event(&self, event: NewEvent) -> RouterResult<StoreEventOutcome> {
        // The unique index on upstream_delivery_id is the source of
        // truth for duplicate detection.
        let row = sqlx::query(
            r#"
            INSERT INTO events
                (upstream_delivery_id, event_type, payload_hash, payload_size,
                 payload_data, headers_data, received_at, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending')
            ON CONFLICT (upstream_delivery_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&event.upstream_delivery_id)
        .bind(&event.event_type)
        .bind(&event.payload_hash)
        .bind(event.payload_size as i64)
        .bind(&event.payload_data)
        .bind(&event.headers_data)
        .bind(event.received_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RouterError::StoreUnavailable { message: e.to_string() })?;

        if let Some(row) = row {
            return Ok(StoreEventOutcome::Created(col::<i64>(&row, "id")?));
        }

        let existing: i64 = sqlx::query_scalar("SELECT id FROM events WHERE upstream_delivery_id = $1")
            .bind(&event.upstream_delivery_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| RouterError::StoreUnavailable { message: e.to_string() })?;
        Ok(StoreEventOutcome::AlreadyExists(existing))
    }

    async fn set_event_status(&self, event_id: i64, status: EventStatus) -> RouterResult<()> {
        sqlx::query(
            "UPDATE events SET status = $1, processed_at = CASE WHEN $2 THEN now() ELSE processed_at END WHERE id = $3",
        )
        .bind(Self::status_str(status))
        .bind(status.is_terminal())
        .bind(event_id)
        .execute(&self.pool)
        .await
        .map_err(|e| RouterError::StoreUnavailable { message: e.to_string() })?;
        Ok(())
    }

    async fn get_event(&self, event_id: i64) -> RouterResult<Option<Event>> {
        let row = sqlx::query(
            "SELECT id, upstream_delivery_id, event_type, payload_hash, payload_size, payload_data, headers_data, received_at, processed_at, status FROM events WHERE id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RouterError::StoreUnavailable { message: e.to_string() })?;

        let Some(row) = row else { return Ok(None) };
        let status = Self::status_from_str(col::<String>(&row, "status")?.as_str())?;
        Ok(Some(Event {
            id: col(&row, "id")?,
            upstream_delivery_id: col(&row, "upstream_delivery_id")?,
            event_type: col(&row, "event_type")?,
            payload_hash: col(&row, "payload_hash")?,
            payload_size: col::<i64>(&row, "payload_size")? as usize,
            payload_data: col(&row, "payload_data")?,
            headers_data: col(&row, "headers_data")?,
            received_at: col(&row, "received_at")?,
            processed_at: col(&row, "processed_at")?,
            status,
        }))
    }

    async fn event_stats(&self) -> RouterResult<EventStats> {
        let row = sqlx::query(
            r#"
            SELECT
                count(*) AS total,
                count(*) FILTER (WHERE status IN ('pending', 'processing')) AS pending,
                count(*) FILTER (WHERE status IN ('failed', 'dead-letter')) AS failed,
                count(*) FILTER (WHERE status = 'completed') AS completed
            FROM events
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| RouterError::StoreUnavailable { message: e.to_string() })?;

        Ok(EventStats {
            total: col::<i64>(&row, "total")? as u64,
            pending: col::<i64>(&row, "pending")? as u64,
            failed: col::<i64>(&row, "failed")? as u64,
            completed: col::<i64>(&row, "completed")? as u64,
        })
    }

    async fn record_attempt(&self, attempt: NewAttempt) -> RouterResult<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO delivery_attempts
                (event_id, subscriber_id, attempt_number, status_code, error_message, attempted_at, duration_ms)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(attempt.event_id)
        .bind(attempt.subscriber_id)
        .bind(attempt.attempt_number as i32)
        .bind(attempt.status_code.map(|c| c as i32))
        .bind(attempt.error_message)
        .bind(attempt.attempted_at)
        .bind(attempt.duration_ms.map(|d| d as i64))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| RouterError::StoreUnavailable { message: e.to_string() })?;
        Ok(id)
    }

    async fn schedule_retry(
        &self,
        event_id: i64,
        subscriber_id: i64,
        attempt_number: u32,
        when: DateTime<Utc>,
    ) -> RouterResult<()> {
        sqlx::query(
            "UPDATE delivery_attempts SET next_retry_at = $1 WHERE event_id = $2 AND subscriber_id = $3 AND attempt_number = $4",
        )
        .bind(when)
        .bind(event_id)
        .bind(subscriber_id)
        .bind(attempt_number as i32)
        .execute(&self.pool)
        .await
        .map_err(|e| RouterError::StoreUnavailable { message: e.to_string() })?;
        Ok(())
    }

    async fn clear_retry(&self, event_id: i64, subscriber_id: i64, attempt_number: u32) -> RouterResult<()> {
        sqlx::query(
            "UPDATE delivery_attempts SET next_retry_at = NULL WHERE event_id = $1 AND subscriber_id = $2 AND attempt_number = $3",
        )
        .bind(event_id)
        .bind(subscriber_id)
        .bind(attempt_number as i32)
        .execute(&self.pool)
        .await
        .map_err(|e| RouterError::StoreUnavailable { message: e.to_string() })?;
        Ok(())
    }

    async fn claim_pending_retries(&self, limit: usize) -> RouterResult<Vec<RetryTask>> {
        // Atomic claim: the UPDATE ... FROM ... RETURNING clears
        // next_retry_at for the selected rows in the same statement that
        // selects them, so a concurrent poller's identical query cannot
        // also return them.
        let rows = sqlx::query(
            r#"
            WITH due AS (
                SELECT id FROM delivery_attempts
                WHERE next_retry_at IS NOT NULL AND next_retry_at <= now()
                ORDER BY next_retry_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE delivery_attempts da
            SET next_retry_at = NULL
            FROM due
            WHERE da.id = due.id
            RETURNING da.event_id, da.subscriber_id, da.attempt_number
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RouterError::StoreUnavailable { message: e.to_string() })?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            let event_id: i64 = col(&row, "event_id")?;
            let subscriber_id: i64 = col(&row, "subscriber_id")?;
            let attempt_number: i32 = col(&row, "attempt_number")?;

            if let Some(event) = self.get_event(event_id).await? {
                tasks.push(RetryTask {
                    event_id,
                    subscriber_id,
                    next_attempt_number: attempt_number as u32 + 1,
                    payload_data: event.payload_data,
                    headers_data: event.headers_data,
                    event_type: event.event_type,
                });
            }
        }
        Ok(tasks)
    }

    async fn get_subscriber(&self, id: i64) -> RouterResult<Option<Subscriber>> {
        let row = sqlx::query("SELECT id, name, events FROM subscribers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RouterError::StoreUnavailable { message: e.to_string() })?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(subscriber_from_row(row)?))
    }

    async fn list_subscribers(&self) -> RouterResult<Vec<Subscriber>> {
        let rows = sqlx::query("SELECT id, name, events FROM subscribers")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RouterError::StoreUnavailable { message: e.to_string() })?;
        rows.into_iter().map(subscriber_from_row).collect()
    }

    async fn get_transport_for(&self, subscriber_id: i64) -> RouterResult<Option<TransportBinding>> {
        let row = sqlx::query("SELECT id, subscriber_id, name, config FROM transports WHERE subscriber_id = $1")
            .bind(subscriber_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RouterError::StoreUnavailable { message: e.to_string() })?;
        let Some(row) = row else { return Ok(None) };
        let kind_str: String = col(&row, "name")?;
        Ok(Some(TransportBinding {
            id: col(&row, "id")?,
            subscriber_id: col(&row, "subscriber_id")?,
            kind: transport_kind_from_str(&kind_str)?,
            config: col(&row, "config")?,
        }))
    }

    async fn subscribers_version(&self) -> RouterResult<u64> {
        // A store-backed version row suffices for single-process
        // deployments; multi-process invalidation would add a pub/sub
        // notification on top.
        let version: i64 = sqlx::query_scalar(
            "SELECT (SELECT count(*) FROM subscribers) + (SELECT count(*) FROM transports)",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| RouterError::StoreUnavailable { message: e.to_string() })?;
        Ok(version as u64)
    }

    async fn attempts_for_event(&self, event_id: i64) -> RouterResult<Vec<DeliveryAttempt>> {
        let rows = sqlx::query(
            "SELECT id, event_id, subscriber_id, attempt_number, status_code, error_message, attempted_at, duration_ms, next_retry_at FROM delivery_attempts WHERE event_id = $1",
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RouterError::StoreUnavailable { message: e.to_string() })?;

        rows.into_iter()
            .map(|row| {
                Ok(DeliveryAttempt {
                    id: col(&row, "id")?,
                    event_id: col(&row, "event_id")?,
                    subscriber_id: col(&row, "subscriber_id")?,
                    attempt_number: col::<i32>(&row, "attempt_number")? as u32,
                    status_code: col::<Option<i32>>(&row, "status_code")?.map(|c| c as u16),
                    error_message: col(&row, "error_message")?,
                    attempted_at: col(&row, "attempted_at")?,
                    duration_ms: col::<Option<i64>>(&row, "duration_ms")?.map(|d| d as u64),
                    next_retry_at: col(&row, "next_retry_at")?,
                })
            })
            .collect()
    }
}

fn subscriber_from_row(row: PgRow) -> RouterResult<Subscriber> {
    let events_json: serde_json::Value = col(&row, "events")?;
    let events: HashSet<String> = serde_json::from_value(events_json)?;
    Ok(Subscriber {
        id: col(&row, "id")?,
        name: col(&row, "name")?,
        events,
    })
}

fn transport_kind_from_str(s: &str) -> RouterResult<TransportKind> {
    Ok(match s {
        "http-webhook" => TransportKind::HttpWebhook,
        "pubsub" => TransportKind::Pubsub,
        "log-stream-broker" => TransportKind::LogStreamBroker,
        "cloud-queue" => TransportKind::CloudQueue,
        "cloud-event-bus" => TransportKind::CloudEventBus,
        "amqp-broker" => TransportKind::AmqpBroker,
        other => return Err(RouterError::internal(format!("unknown transport kind: {other}"))),
    })
}
