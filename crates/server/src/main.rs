//! hookrelay server binary: loads configuration, wires the store,
//! queue, transports, delivery engine and retry scheduler, and serves
//! the ingest HTTP surface.

use hookrelay_core::RouterConfig;
use hookrelay_crypto::HeaderCipher;
use hookrelay_delivery::{DeliveryEngine, InMemoryQueue, IngestValidator, RetryPolicy, RetryScheduler, Transport};
#[cfg(feature = "http-transport")]
use hookrelay_delivery::{GenericEnvelopeTransport, HttpWebhookTransport};
#[cfg(feature = "amqp-transport")]
use hookrelay_delivery::AmqpBrokerTransport;
use hookrelay_server::{build_router, AppState};
use hookrelay_store::{EventStore, InMemoryEventStore};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "hookrelay.toml".to_string());
    let config = match RouterConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("warning: {e}, falling back to defaults");
            RouterConfig::default()
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_new(&config.monitoring.log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let store: Arc<dyn EventStore> = build_store(&config).await?;

    let queue = InMemoryQueue::shared(Duration::from_millis(config.queue.visibility_timeout_ms));

    let mut transports: HashMap<hookrelay_core::TransportKind, Arc<dyn Transport>> = HashMap::new();
    #[cfg(feature = "http-transport")]
    {
        use hookrelay_core::TransportKind;
        transports.insert(TransportKind::HttpWebhook, Arc::new(HttpWebhookTransport::new()));
        for kind in [TransportKind::Pubsub, TransportKind::LogStreamBroker, TransportKind::CloudQueue, TransportKind::CloudEventBus] {
            transports.insert(kind, Arc::new(GenericEnvelopeTransport::new(kind)));
        }
    }
    #[cfg(feature = "amqp-transport")]
    transports.insert(hookrelay_core::TransportKind::AmqpBroker, Arc::new(AmqpBrokerTransport::new()));

    let header_cipher = HeaderCipher::new(config.store.master_encryption_secret.clone());
    let retry_policy = RetryPolicy::from_config(&config.retry);

    let engine = Arc::new(DeliveryEngine::new(
        store.clone(),
        transports,
        header_cipher.clone(),
        retry_policy,
        config.delivery.clone(),
        config.queue.dead_letter_threshold,
    ));

    let validator = IngestValidator::new(config.ingest.webhook_secret.clone(), &config.security);

    let scheduler = Arc::new(RetryScheduler::new(
        store.clone(),
        engine.clone(),
        config.processing.batch_size,
        Duration::from_millis(config.processing.processing_interval_ms),
    ));

    let shutdown = CancellationToken::new();
    let scheduler_handle = {
        let scheduler = scheduler.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { scheduler.run(shutdown).await })
    };

    let state = Arc::new(AppState { store, queue, validator, engine, header_cipher, config: config.clone() });
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    tracing::info!(%addr, "hookrelay listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    let _ = scheduler_handle.await;

    Ok(())
}

async fn build_store(config: &RouterConfig) -> Result<Arc<dyn EventStore>, Box<dyn std::error::Error>> {
    match config.store.kind.as_str() {
        #[cfg(feature = "postgres")]
        "postgres" => {
            let url = config
                .store
                .database_url
                .as_deref()
                .ok_or("store.database_url is required when store.kind = \"postgres\"")?;
            let pool = sqlx::postgres::PgPoolOptions::new().max_connections(10).connect(url).await?;
            let store = hookrelay_store::PostgresEventStore::new(pool);
            store.migrate().await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        "postgres" => Err("built without the postgres feature".into()),
        _ => Ok(Arc::new(InMemoryEventStore::new())),
    }
}

/// Waits for a Ctrl-C signal, then cancels the shared shutdown token so
/// the retry scheduler and in-flight deliveries can wind down.
async fn shutdown_signal(shutdown: CancellationToken) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
    shutdown.cancel();
}
