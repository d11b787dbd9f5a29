//! # hookrelay-server
//!
//! Wires the ingest validator, delivery engine, and retry scheduler
//! behind an HTTP surface: the webhook ingest endpoint plus liveness
//! and readiness checks.
//!
//! A struct holding shared state plus a `build_router` entry point that
//! assembles the real axum app serving that surface.

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use hookrelay_core::{RouterConfig, RouterError};
use hookrelay_crypto::HeaderCipher;
use hookrelay_delivery::{DeliveryEngine, IngestValidator, RouterQueue};
use hookrelay_store::{EventStore, NewEvent, StoreEventOutcome};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub store: Arc<dyn EventStore>,
    pub queue: Arc<dyn RouterQueue>,
    pub validator: IngestValidator,
    pub engine: Arc<DeliveryEngine>,
    pub header_cipher: HeaderCipher,
    pub config: RouterConfig,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/webhook/{platform}", post(handle_webhook))
        .route("/healthz/live", get(handle_live))
        .route("/healthz/ready", get(handle_ready))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct IngestResponse {
    message: String,
    subscribers: usize,
    successful: usize,
    failed: usize,
    retries: usize,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    message: String,
}

async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    Path(_platform): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> axum::response::Response {
    let client_ip = addr.ip().to_string();
    let mut header_map: HashMap<String, String> = HashMap::new();
    for (name, value) in headers.iter() {
        if let Ok(value) = value.to_str() {
            header_map.insert(name.as_str().to_ascii_lowercase(), value.to_string());
        }
    }

    let accepted = match state.validator.validate(&client_ip, &header_map, &body).await {
        Ok(accepted) => accepted,
        Err(err) => return error_response(&err),
    };

    let headers_bundle = match state.header_cipher.encrypt(&accepted.captured_headers) {
        Ok(bundle) => bundle,
        Err(e) => {
            return error_response(&RouterError::internal(format!("header encryption failed: {e}")));
        }
    };
    let headers_data = match serde_json::to_string(&headers_bundle) {
        Ok(s) => s,
        Err(e) => return error_response(&RouterError::from(e)),
    };

    let new_event = NewEvent {
        upstream_delivery_id: accepted.upstream_delivery_id.clone(),
        event_type: accepted.event_type.clone(),
        payload_hash: hookrelay_crypto::hash_payload(&body),
        payload_size: body.len(),
        payload_data: String::from_utf8_lossy(&body).into_owned(),
        headers_data,
        received_at: Utc::now(),
    };

    let outcome = match state.store.store_event(new_event).await {
        Ok(outcome) => outcome,
        Err(err) => return error_response(&err),
    };

    let event_id = match outcome {
        // Duplicate delivery: treated as success, no re-processing.
        StoreEventOutcome::AlreadyExists(_) => {
            return (
                StatusCode::OK,
                Json(IngestResponse {
                    message: "duplicate delivery, already processed".into(),
                    subscribers: 0,
                    successful: 0,
                    failed: 0,
                    retries: 0,
                }),
            )
                .into_response();
        }
        StoreEventOutcome::Created(id) => id,
    };

    let event = match state.store.get_event(event_id).await {
        Ok(Some(event)) => event,
        Ok(None) => return error_response(&RouterError::not_found("event", "id", event_id.to_string())),
        Err(err) => return error_response(&err),
    };

    let fanout = match state.engine.process_event(&event).await {
        Ok(fanout) => fanout,
        Err(err) => return error_response(&err),
    };

    let status = if fanout.subscribers == 0 {
        StatusCode::OK
    } else if fanout.retries > 0 {
        StatusCode::ACCEPTED
    } else if fanout.failed > 0 && fanout.successful == 0 {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };

    (
        status,
        Json(IngestResponse {
            message: "processed".into(),
            subscribers: fanout.subscribers,
            successful: fanout.successful,
            failed: fanout.failed,
            retries: fanout.retries,
        }),
    )
        .into_response()
}

fn error_response(err: &RouterError) -> axum::response::Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(ErrorResponse { message: err.to_string() })).into_response()
}

#[derive(Debug, Serialize)]
struct LiveResponse {
    status: &'static str,
}

async fn handle_live() -> impl IntoResponse {
    (StatusCode::OK, Json(LiveResponse { status: "up" }))
}

#[derive(Debug, Serialize)]
struct ReadyResponse {
    status: &'static str,
    checks: HashMap<String, bool>,
}

/// Readiness: store reachable, at least one active subscriber, queue
/// depth below threshold, 1-hour failure rate below threshold. The last
/// check is approximated with the lifetime failed/total ratio since the
/// core does not retain a rolling window of timestamps beyond
/// `DeliveryAttempt.attempted_at` (documented in DESIGN.md).
async fn handle_ready(State(state): State<Arc<AppState>>) -> axum::response::Response {
    let mut checks = HashMap::new();

    let stats = state.store.event_stats().await;
    checks.insert("store_reachable".to_string(), stats.is_ok());

    let subscribers = state.store.list_subscribers().await;
    let has_subscribers = subscribers.as_ref().map(|s| !s.is_empty()).unwrap_or(false);
    checks.insert("has_active_subscribers".to_string(), has_subscribers);

    let queue_depth_ok = match state.queue.stats().await {
        Ok(stats) => stats.approximate < 10_000,
        Err(_) => false,
    };
    checks.insert("queue_depth_below_threshold".to_string(), queue_depth_ok);

    let failure_rate_ok = match stats {
        Ok(stats) if stats.total > 0 => (stats.failed as f64 / stats.total as f64) < 0.5,
        Ok(_) => true,
        Err(_) => false,
    };
    checks.insert("failure_rate_below_threshold".to_string(), failure_rate_ok);

    let all_ok = checks.values().all(|&ok| ok);
    let status = if all_ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    (status, Json(ReadyResponse { status: if all_ok { "up" } else { "degraded" }, checks })).into_response()
}
