// canonsync/src/lib.rs - NATS JetStream runtime for canonical document sync

// ============ MODULES ============
pub mod config;
pub mod consumers;
pub mod observability;
pub mod persistence;
pub mod transport;
pub mod workers;

// ============ RE-EXPORTS ============

pub use canonsync_core;
pub use canonsync_core::{
    CanonicalDocument, DocumentMetadata, Envelope, HandleOutcome, HandlerRegistry, Operation, PayloadEvent,
    PayloadHandler, WorkError, PAYLOAD_TYPE_TAG,
};

pub use config::{BaseConfiguration, ConfigError, ConsumerSettings};
pub use consumers::{
    settlement_for, InboundMessage, MemoryAcker, MessageAcker, MetricsSnapshot, SessionConsumer, Settlement,
};
pub use persistence::{
    load_document, save_document, ConcurrencyToken, DocumentStore, KvDocumentStore, MemoryDocumentStore,
    StoredDocument,
};
pub use transport::{EnvelopeSender, JetStreamSender, MemorySender};
pub use workers::{ChangeFeedProcessor, ChangePublisher, ErrorCallback};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::consumers::QueueConsumer;
use crate::transport::{dead_letter_name, session_filter, stream_name};

// ============ PROVIDER ============

/// Connection, stream provisioning and task startup for one service instance
#[derive(Clone, Debug)]
pub struct CanonSyncProvider {
    nc: async_nats::Client,
    js: async_nats::jetstream::Context,
    config: BaseConfiguration,
}

impl CanonSyncProvider {
    /// Connect to NATS and make sure every stream the service needs exists
    pub async fn try_new(config: BaseConfiguration) -> Result<CanonSyncProvider> {
        tracing::info!("🚀 Initializing canonsync provider '{}'", config.processor_name);
        config.log_summary();

        let nc = config.get_nats_connection().await?;
        let js = config.jetstream_context(nc.clone());

        let provider = CanonSyncProvider { nc, js, config };
        provider.ensure_streams().await?;

        tracing::info!("✅ canonsync provider initialized successfully!");
        Ok(provider)
    }

    pub fn config(&self) -> &BaseConfiguration {
        &self.config
    }

    /// Get access to the underlying NATS client
    pub fn nats_client(&self) -> &async_nats::Client {
        &self.nc
    }

    /// Get access to the JetStream context
    pub fn jetstream(&self) -> &async_nats::jetstream::Context {
        &self.js
    }

    pub async fn document_store(&self) -> Result<KvDocumentStore> {
        KvDocumentStore::new_from_context(&self.js, &self.config.db_name, &self.config.container_name).await
    }

    /// Sender for the output topic
    pub fn topic_sender(&self) -> JetStreamSender {
        JetStreamSender::new(self.js.clone(), self.config.topic_name.clone())
    }

    /// Start the session consumer on the input queue. The consumer is restarted if its
    /// message stream ends before shutdown is signalled.
    pub fn start_consumer(
        &self,
        registry: HandlerRegistry,
        shutdown: watch::Receiver<bool>,
    ) -> (Arc<SessionConsumer>, JoinHandle<()>) {
        tracing::info!(
            "🎯 Starting session consumer for {} payload types: [{}]",
            registry.len(),
            registry.payload_types().join(", ")
        );

        let consumer = Arc::new(SessionConsumer::new(registry, self.config.consumer.clone()));
        let queue = QueueConsumer::new(self.js.clone(), self.config.queue_name.clone(), &self.config.processor_name);
        let prefetch = self.config.consumer.session_prefetch;
        let session_consumer = consumer.clone();

        let handle = tokio::spawn(async move {
            let mut shutdown = shutdown;
            loop {
                if *shutdown.borrow() {
                    break;
                }
                match queue.messages(prefetch).await {
                    Ok(messages) => {
                        if let Err(e) = session_consumer.run(messages, shutdown.clone()).await {
                            tracing::error!(error = %e, "Session consumer failed");
                        }
                        if *shutdown.borrow() {
                            break;
                        }
                        tracing::warn!("Input queue stream ended, restarting consumer in 5 seconds");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to open input queue, will retry in 5 seconds");
                    }
                }
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                }
            }
            tracing::info!(consumer.name = %queue.consumer_name(), "Session consumer stopped");
        });

        (consumer, handle)
    }

    /// Start republishing changes of one canonical document type to the output topic
    pub fn start_change_feed<D: CanonicalDocument>(
        &self,
        publisher: ChangePublisher<D>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let processor = ChangeFeedProcessor::new(
            self.js.clone(),
            self.config.db_name.clone(),
            self.config.container_name.clone(),
            &self.config.processor_name,
            self.config.change_feed_batch_size,
            publisher,
        );

        tokio::spawn(async move {
            let mut shutdown = shutdown;
            loop {
                match processor.run(shutdown.clone()).await {
                    Ok(()) => break,
                    Err(e) => {
                        tracing::error!(
                            consumer.name = %processor.consumer_name(),
                            error = %e,
                            "Change feed failed, will restart in 5 seconds"
                        );
                    }
                }
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                }
            }
        })
    }

    /// Health check for the entire system
    pub async fn health_check(&self) -> Result<HealthStatus> {
        let mut status = HealthStatus::new();

        status.nats = match self.nc.connection_state() {
            async_nats::connection::State::Connected => ServiceHealth::Healthy,
            _ => ServiceHealth::Unhealthy("NATS connection lost".to_string()),
        };

        status.jetstream = match self.js.get_stream(stream_name(&self.config.queue_name)).await {
            Ok(_) => ServiceHealth::Healthy,
            Err(e) => ServiceHealth::Unhealthy(e.to_string()),
        };

        status.document_store = match self.document_store().await {
            Ok(store) => match store.health_check().await {
                Ok(_) => ServiceHealth::Healthy,
                Err(e) => ServiceHealth::Unhealthy(e.to_string()),
            },
            Err(e) => ServiceHealth::Unhealthy(e.to_string()),
        };

        status.overall = if status.is_healthy() {
            ServiceHealth::Healthy
        } else {
            ServiceHealth::Unhealthy("One or more services unhealthy".to_string())
        };

        Ok(status)
    }

    /// Ensure the input queue, its dead-letter stream and the output topic exist
    async fn ensure_streams(&self) -> Result<()> {
        use async_nats::jetstream::stream::{Config as StreamConfig, RetentionPolicy, StorageType};

        tracing::info!("🔧 Ensuring required NATS streams exist...");

        let queue = &self.config.queue_name;
        self.js
            .get_or_create_stream(StreamConfig {
                name: stream_name(queue),
                description: Some(format!("Input queue {}", queue)),
                num_replicas: 1,
                retention: RetentionPolicy::WorkQueue,
                subjects: vec![session_filter(queue)],
                storage: StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create input queue stream: {}", e))?;

        let dead_letters = dead_letter_name(queue);
        self.js
            .get_or_create_stream(StreamConfig {
                name: stream_name(&dead_letters),
                description: Some(format!("Dead letters of {}", queue)),
                num_replicas: 1,
                retention: RetentionPolicy::Limits,
                subjects: vec![session_filter(&dead_letters)],
                storage: StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create dead-letter stream: {}", e))?;

        let topic = &self.config.topic_name;
        self.js
            .get_or_create_stream(StreamConfig {
                name: stream_name(topic),
                description: Some(format!("Output topic {}", topic)),
                num_replicas: 1,
                retention: RetentionPolicy::Limits,
                subjects: vec![session_filter(topic)],
                storage: StorageType::File,
                // a document version republished within this window is dropped as a duplicate;
                // the Nats-Msg-Id is derived from document id and version
                duplicate_window: Duration::from_secs(120),
                ..Default::default()
            })
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create output topic stream: {}", e))?;

        tracing::info!("✅ All required streams are ready!");
        Ok(())
    }
}

// ============ HEALTH CHECK TYPES ============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub overall: ServiceHealth,
    pub nats: ServiceHealth,
    pub jetstream: ServiceHealth,
    pub document_store: ServiceHealth,
}

impl HealthStatus {
    fn new() -> Self {
        Self {
            overall: ServiceHealth::Unknown,
            nats: ServiceHealth::Unknown,
            jetstream: ServiceHealth::Unknown,
            document_store: ServiceHealth::Unknown,
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self.nats, ServiceHealth::Healthy)
            && matches!(self.jetstream, ServiceHealth::Healthy)
            && matches!(self.document_store, ServiceHealth::Healthy)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceHealth {
    Healthy,
    Unhealthy(String),
    Unknown,
}
