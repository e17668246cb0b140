// engagement-consumer/src/main.rs - Engagement consumer service

use anyhow::Result;
use canonsync::{BaseConfiguration, CanonSyncProvider, ChangePublisher, DocumentStore};
use engagement_consumer::{build_registry, health_router, CanonicalEngagement};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured logging with JSON output
    #[cfg(feature = "opentelemetry")]
    canonsync::observability::init_tracing_with_otel("engagement-consumer")?;
    #[cfg(not(feature = "opentelemetry"))]
    canonsync::observability::init_tracing();

    tracing::info!(
        service.name = "engagement-consumer",
        service.version = env!("CARGO_PKG_VERSION"),
        "Starting Engagement consumer"
    );

    let config = match BaseConfiguration::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            return Err(e.into());
        }
    };

    let provider = match CanonSyncProvider::try_new(config.clone()).await {
        Ok(provider) => provider,
        Err(e) => {
            tracing::error!(error = %e, "Failed to initialize canonsync provider");
            return Err(e);
        }
    };

    match provider.health_check().await {
        Ok(health) => {
            tracing::info!(
                health.nats = ?health.nats,
                health.jetstream = ?health.jetstream,
                health.document_store = ?health.document_store,
                "System health check completed"
            );
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check encountered issues");
        }
    }

    let store: Arc<dyn DocumentStore> = Arc::new(provider.document_store().await?);
    let registry = build_registry(store)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let publisher = ChangePublisher::<CanonicalEngagement>::new(Arc::new(provider.topic_sender()));
    let change_feed = provider.start_change_feed(publisher, shutdown_rx.clone());
    let (consumer, consumer_handle) = provider.start_consumer(registry, shutdown_rx.clone());

    let listener = tokio::net::TcpListener::bind(&config.health_addr).await?;
    tracing::info!(http.addr = %config.health_addr, "Liveness endpoint listening");
    let mut http_shutdown = shutdown_rx.clone();
    let http = tokio::spawn(async move {
        let app = health_router().into_make_service_with_connect_info::<SocketAddr>();
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = http_shutdown.wait_for(|stop| *stop).await;
        });
        if let Err(e) = server.await {
            tracing::error!(error = %e, "Liveness endpoint failed");
        }
    });

    tracing::info!(
        input.queue = %config.queue_name,
        output.topic = %config.topic_name,
        store.bucket = %config.db_name,
        store.container = %config.container_name,
        "All workers started successfully"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");
    let _ = shutdown_tx.send(true);

    // sessions get their own grace period inside the consumer
    let grace = config.consumer.shutdown_grace + Duration::from_secs(1);
    if tokio::time::timeout(grace, consumer_handle).await.is_err() {
        tracing::warn!("Session consumer did not stop in time");
    }
    let _ = tokio::time::timeout(grace, change_feed).await;
    let _ = http.await;

    let metrics = consumer.metrics();
    tracing::info!(
        messages.completed = metrics.completed,
        messages.abandoned = metrics.abandoned,
        messages.dead_lettered = metrics.dead_lettered,
        "Engagement consumer shut down"
    );
    Ok(())
}
