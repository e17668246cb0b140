// engagement-consumer/src/lib.rs - Canonical Engagement consumer

pub mod handler;
pub mod models;
pub mod payload;

pub use handler::{merge, EngagementUpdate, MpmEngagementV2Handler};
pub use models::{
    CanonicalEngagement, Checklist, ChecklistItem, EngagementDetails, EngagementPrimeData, EngagementTeam,
    EngagementTeamMember, EntitySubData,
};
pub use payload::{MpmEngagementV2Payload, MPM_ENGAGEMENT_V2};

use axum::extract::ConnectInfo;
use axum::routing::get;
use axum::Router;
use canonsync::{DocumentStore, HandlerRegistry, WorkError};
use std::net::SocketAddr;
use std::sync::Arc;

/// Every payload handler this service runs, bound to one document store
pub fn build_registry(store: Arc<dyn DocumentStore>) -> Result<HandlerRegistry, WorkError> {
    Ok(HandlerRegistry::builder()
        .register(MpmEngagementV2Handler::new(store))?
        .build())
}

/// Liveness endpoint
pub fn health_router() -> Router {
    Router::new().route("/healthz", get(healthz))
}

async fn healthz(ConnectInfo(addr): ConnectInfo<SocketAddr>) -> &'static str {
    tracing::trace!(client.addr = %addr, "Liveness check");
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use canonsync::{
        ConcurrencyToken, ConsumerSettings, Envelope, InboundMessage, MemoryAcker, MemoryDocumentStore, Operation,
        SessionConsumer, Settlement, StoredDocument, PAYLOAD_TYPE_TAG,
    };
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::{mpsc, watch};
    use tokio_test::assert_ok;

    const ENGAGEMENT_ID: &str = "6f1c1c2e-8a43-4f0e-9d3e-2b7a1c9e0a11";

    /// Fails the first `failures` writes with a transient error
    struct FlakyStore {
        inner: MemoryDocumentStore,
        failures: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl DocumentStore for FlakyStore {
        async fn read(&self, id: &str) -> Result<Option<StoredDocument>, WorkError> {
            self.inner.read(id).await
        }

        async fn write(
            &self,
            id: &str,
            body: Bytes,
            token: Option<ConcurrencyToken>,
        ) -> Result<ConcurrencyToken, WorkError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(WorkError::Transient("store unavailable".to_string()));
            }
            self.inner.write(id, body, token).await
        }
    }

    fn delivery(
        operation: Operation,
        payload: Option<Value>,
        minute: u32,
        tx: &mpsc::UnboundedSender<(String, Settlement)>,
    ) -> InboundMessage {
        let mut builder = Envelope::builder()
            .for_operation(operation)
            .at(Utc.with_ymd_and_hms(2025, 3, 1, 12, minute, 0).unwrap())
            .with_tag(PAYLOAD_TYPE_TAG, MPM_ENGAGEMENT_V2);
        if let Some(payload) = payload {
            builder = builder.with_payload(payload);
        }
        let body = builder.create().unwrap().encode().unwrap();
        InboundMessage::new(ENGAGEMENT_ID, body, 1, Utc::now(), MemoryAcker::new(operation.to_string(), tx.clone()))
    }

    #[test]
    fn test_registry_serves_mpm_engagements() {
        let registry = assert_ok!(build_registry(Arc::new(MemoryDocumentStore::new())));
        assert_eq!(registry.payload_types(), vec![MPM_ENGAGEMENT_V2]);
        assert!(registry.get("mpm.engagement.v1").is_err());
    }

    #[tokio::test]
    async fn test_delete_after_failed_create_leaves_document_deleted() {
        let memory = MemoryDocumentStore::new();
        let store = Arc::new(FlakyStore {
            inner: memory.clone(),
            failures: AtomicUsize::new(1),
        });
        let settings = ConsumerSettings {
            retry_backoff: Duration::from_millis(1),
            session_idle_timeout: Duration::from_millis(20),
            ..ConsumerSettings::default()
        };
        let consumer = SessionConsumer::new(assert_ok!(build_registry(store)), settings);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let payload = json!({
            "engagementId": ENGAGEMENT_ID,
            "engagementNo": 4100,
            "clientId": "0b8f2d6a-1c11-4d7e-a0a5-5e3c9d2f7b42",
            "clientNo": 77
        });
        let batch = vec![
            Ok(delivery(Operation::Create, Some(payload), 1, &tx)),
            Ok(delivery(Operation::Delete, None, 2, &tx)),
        ];
        let (_stop_tx, stop_rx) = watch::channel(false);
        assert_ok!(consumer.run(futures::stream::iter(batch), stop_rx).await);

        let doc: CanonicalEngagement = memory.get(ENGAGEMENT_ID).expect("engagement should be stored");
        assert!(doc.metadata.deleted);

        let mut settled = Vec::new();
        while let Ok((label, settlement)) = rx.try_recv() {
            settled.push((label, settlement));
        }
        assert_eq!(
            settled,
            vec![
                (Operation::Create.to_string(), Settlement::Complete),
                (Operation::Delete.to_string(), Settlement::Complete),
            ]
        );
        assert_eq!(consumer.metrics().abandoned, 1);
    }

    #[tokio::test]
    async fn test_healthz_answers_ok() {
        let addr: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        assert_eq!(healthz(ConnectInfo(addr)).await, "ok");
    }
}
