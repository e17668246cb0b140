// engagement-consumer/src/handler.rs - Merges MPM engagement changes into the canonical document

use async_trait::async_trait;
use canonsync::observability::OperationLogger;
use canonsync::{
    load_document, save_document, DocumentStore, HandleOutcome, Operation, PayloadEvent, PayloadHandler, WorkError,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::models::{CanonicalEngagement, EngagementDetails};
use crate::payload::{MpmEngagementV2Payload, MPM_ENGAGEMENT_V2};

/// One validated MPM change, ready to merge
#[derive(Debug, Clone, PartialEq)]
pub struct EngagementUpdate {
    pub id: Uuid,
    /// `None` for a delete that arrived without a payload
    pub details: Option<EngagementDetails>,
    pub extension_data: Option<BTreeMap<String, Value>>,
    pub value_date: DateTime<Utc>,
    pub event_id: Uuid,
    pub operation: Operation,
}

impl EngagementUpdate {
    /// Validate an event. Never touches the store.
    pub fn from_event(event: &PayloadEvent) -> Result<Self, WorkError> {
        let (id, details, extension_data) = match &event.payload {
            Some(value) => {
                let payload = MpmEngagementV2Payload::parse(value)?;
                (payload.engagement_id, Some(payload.details), Some(payload.extension_data))
            }
            None if event.operation == Operation::Delete => {
                // the session key is the document id
                let session = event
                    .session_id
                    .as_deref()
                    .ok_or_else(|| WorkError::Deserialization("Delete without payload or session id".to_string()))?;
                let id = Uuid::parse_str(session).map_err(|e| {
                    WorkError::Deserialization(format!("Session id '{session}' is not an engagement id: {e}"))
                })?;
                (id, None, None)
            }
            None => return Err(WorkError::Deserialization("No payload received".to_string())),
        };

        Ok(Self {
            id,
            details,
            extension_data,
            value_date: event.value_date,
            event_id: event.event_id,
            operation: event.operation,
        })
    }

    fn deletes(&self) -> bool {
        self.operation == Operation::Delete
    }
}

/// Merge an update into a document. Returns whether the document must be written;
/// metadata is stamped only when it must.
pub fn merge(doc: &mut CanonicalEngagement, update: &EngagementUpdate, is_new: bool) -> bool {
    let mut changed = is_new;

    // prime replacement, gated on the section's high-water mark
    if let Some(details) = &update.details {
        let prime = &mut doc.engagement;
        if update.value_date >= prime.last_update_date_time && prime.details != *details {
            prime.details = details.clone();
            prime.last_update_date_time = update.value_date;
            changed = true;
        }
    }

    let overlay_changed = doc.mpm.update_elements(
        update.id,
        update.deletes(),
        update.extension_data.as_ref(),
        update.value_date,
    );

    if !(changed || overlay_changed) {
        return false;
    }

    doc.update_document_metadata(update.value_date, MPM_ENGAGEMENT_V2, update.event_id);
    true
}

/// Handler for `mpm.engagement.v2`
#[derive(Clone)]
pub struct MpmEngagementV2Handler {
    store: Arc<dyn DocumentStore>,
}

impl MpmEngagementV2Handler {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl PayloadHandler for MpmEngagementV2Handler {
    fn payload_type(&self) -> &'static str {
        MPM_ENGAGEMENT_V2
    }

    #[instrument(level = "debug", skip(self, event), fields(event.id = %event.event_id, operation = %event.operation))]
    async fn handle_payload(&self, event: PayloadEvent) -> Result<HandleOutcome, WorkError> {
        let update = EngagementUpdate::from_event(&event)?;
        let doc_id = update.id.to_string();

        let (mut doc, token) = match load_document::<CanonicalEngagement>(self.store.as_ref(), &doc_id).await? {
            Some((doc, token)) => (doc, Some(token)),
            None if update.deletes() => {
                debug!(document.id = %doc_id, "Delete for unknown engagement, nothing to do");
                return Ok(HandleOutcome::Ignored);
            }
            None => {
                let mut doc = CanonicalEngagement::new(update.id, update.event_id, update.value_date, MPM_ENGAGEMENT_V2);
                doc.mpm.id = update.id;
                (doc, None)
            }
        };

        let is_new = token.is_none();
        if !merge(&mut doc, &update, is_new) {
            OperationLogger::discarded_no_op(&doc_id, update.event_id);
            return Ok(HandleOutcome::Unchanged);
        }

        save_document(self.store.as_ref(), &doc, token).await?;

        let version = doc.metadata.document_version;
        OperationLogger::document_written(&doc_id, version, is_new);
        Ok(if is_new {
            HandleOutcome::Created { version }
        } else {
            HandleOutcome::Updated { version }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canonsync::MemoryDocumentStore;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    const ENGAGEMENT_ID: &str = "6f1c1c2e-8a43-4f0e-9d3e-2b7a1c9e0a11";

    fn t(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn payload(engagement_no: i32) -> Value {
        json!({
            "engagementId": ENGAGEMENT_ID,
            "engagementNo": engagement_no,
            "clientId": "0b8f2d6a-1c11-4d7e-a0a5-5e3c9d2f7b42",
            "clientNo": 77,
            "clientName": "Northwind",
            "team": { "members": [
                { "personnelId": "c8a3b1f0-2d7e-4a55-9d10-3f0e6b1a2c33", "personnelNo": 1 }
            ] },
            "billingPartner": "P-17"
        })
    }

    fn event(payload: Option<Value>, operation: Operation, value_date: DateTime<Utc>) -> PayloadEvent {
        PayloadEvent {
            payload,
            value_date,
            event_id: Uuid::new_v4(),
            operation,
            session_id: Some(ENGAGEMENT_ID.to_string()),
        }
    }

    fn setup() -> (MemoryDocumentStore, MpmEngagementV2Handler) {
        let store = MemoryDocumentStore::new();
        let handler = MpmEngagementV2Handler::new(Arc::new(store.clone()));
        (store, handler)
    }

    fn stored(store: &MemoryDocumentStore) -> CanonicalEngagement {
        store.get(ENGAGEMENT_ID).expect("document should be stored")
    }

    #[tokio::test]
    async fn test_create_then_stale_replay() {
        let (store, handler) = setup();

        let outcome = handler
            .handle_payload(event(Some(payload(5)), Operation::Update, t(1)))
            .await
            .unwrap();
        assert_eq!(outcome, HandleOutcome::Created { version: 1 });

        let doc = stored(&store);
        assert_eq!(doc.metadata.id.to_string(), ENGAGEMENT_ID);
        assert_eq!(doc.metadata.schema_version, 2);
        assert_eq!(doc.metadata.last_update_source, MPM_ENGAGEMENT_V2);
        assert!(!doc.metadata.deleted);
        assert_eq!(doc.engagement.details.engagement_no, 5);
        assert_eq!(doc.engagement.last_update_date_time, t(1));
        assert_eq!(doc.mpm.id.to_string(), ENGAGEMENT_ID);
        assert_eq!(doc.mpm.extension_data["billingPartner"], "P-17");

        // an older event must not overwrite newer prime data
        let outcome = handler
            .handle_payload(event(Some(payload(4)), Operation::Update, t(0)))
            .await
            .unwrap();
        assert_eq!(outcome, HandleOutcome::Unchanged);

        let doc = stored(&store);
        assert_eq!(doc.engagement.details.engagement_no, 5);
        assert_eq!(doc.metadata.document_version, 1);
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_a_no_op() {
        let (store, handler) = setup();
        let first = event(Some(payload(5)), Operation::Create, t(1));

        handler.handle_payload(first.clone()).await.unwrap();
        let again = handler.handle_payload(first).await.unwrap();

        assert_eq!(again, HandleOutcome::Unchanged);
        assert_eq!(stored(&store).metadata.document_version, 1);
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_final_state_independent_of_arrival_order() {
        let older = event(Some(payload(1)), Operation::Update, t(1));
        let newer = event(Some(payload(2)), Operation::Update, t(2));

        let (in_order, handler) = setup();
        handler.handle_payload(older.clone()).await.unwrap();
        handler.handle_payload(newer.clone()).await.unwrap();

        let (reversed, handler) = setup();
        handler.handle_payload(newer).await.unwrap();
        assert_eq!(handler.handle_payload(older).await.unwrap(), HandleOutcome::Unchanged);

        let a = stored(&in_order);
        let b = stored(&reversed);
        assert_eq!(a.engagement.details.engagement_no, 2);
        assert_eq!(a.engagement, b.engagement);
        assert_eq!(a.engagement.last_update_date_time, b.engagement.last_update_date_time);
        // the overlay mark only moves on an overlay change, so it records arrival order
        assert_eq!(a.mpm.id, b.mpm.id);
        assert_eq!(a.mpm.deleted, b.mpm.deleted);
        assert_eq!(a.mpm.extension_data, b.mpm.extension_data);
    }

    #[tokio::test]
    async fn test_delete_of_unknown_engagement_is_ignored() {
        let (store, handler) = setup();

        let with_payload = handler
            .handle_payload(event(Some(payload(5)), Operation::Delete, t(1)))
            .await
            .unwrap();
        let without_payload = handler
            .handle_payload(event(None, Operation::Delete, t(2)))
            .await
            .unwrap();

        assert_eq!(with_payload, HandleOutcome::Ignored);
        assert_eq!(without_payload, HandleOutcome::Ignored);
        assert!(store.is_empty());
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_marks_document_deleted() {
        let (store, handler) = setup();
        handler
            .handle_payload(event(Some(payload(5)), Operation::Create, t(1)))
            .await
            .unwrap();

        let outcome = handler
            .handle_payload(event(Some(payload(5)), Operation::Delete, t(2)))
            .await
            .unwrap();
        assert_eq!(outcome, HandleOutcome::Updated { version: 2 });

        let doc = stored(&store);
        assert!(doc.mpm.deleted);
        assert!(doc.metadata.deleted);
        assert_eq!(doc.mpm.last_update_date_time, t(2));
        // prime data did not change, so its mark stays put
        assert_eq!(doc.engagement.last_update_date_time, t(1));

        // a repeated delete without payload changes nothing
        let outcome = handler.handle_payload(event(None, Operation::Delete, t(3))).await.unwrap();
        assert_eq!(outcome, HandleOutcome::Unchanged);
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn test_delete_without_payload_keeps_extension_data() {
        let (store, handler) = setup();
        handler
            .handle_payload(event(Some(payload(5)), Operation::Create, t(1)))
            .await
            .unwrap();

        let outcome = handler.handle_payload(event(None, Operation::Delete, t(2))).await.unwrap();
        assert_eq!(outcome, HandleOutcome::Updated { version: 2 });

        let doc = stored(&store);
        assert!(doc.metadata.deleted);
        assert_eq!(doc.engagement.details.engagement_no, 5);
        assert_eq!(doc.mpm.extension_data["billingPartner"], "P-17");
    }

    #[tokio::test]
    async fn test_extension_only_change_is_written() {
        let (store, handler) = setup();
        handler
            .handle_payload(event(Some(payload(5)), Operation::Create, t(1)))
            .await
            .unwrap();

        let mut changed = payload(5);
        changed["billingPartner"] = json!("P-99");
        let outcome = handler
            .handle_payload(event(Some(changed), Operation::Update, t(2)))
            .await
            .unwrap();
        assert_eq!(outcome, HandleOutcome::Updated { version: 2 });

        let doc = stored(&store);
        assert_eq!(doc.mpm.extension_data["billingPartner"], "P-99");
        assert_eq!(doc.mpm.last_update_date_time, t(2));
        assert_eq!(doc.engagement.last_update_date_time, t(1));
        assert_eq!(doc.metadata.last_update_date_time, t(2));
    }

    #[tokio::test]
    async fn test_invalid_payloads_never_touch_the_store() {
        let (store, handler) = setup();
        handler
            .handle_payload(event(Some(payload(5)), Operation::Create, t(1)))
            .await
            .unwrap();

        let mut duplicate_team = payload(6);
        let member = duplicate_team["team"]["members"][0].clone();
        duplicate_team["team"]["members"].as_array_mut().unwrap().push(member);
        let err = handler
            .handle_payload(event(Some(duplicate_team), Operation::Update, t(2)))
            .await
            .unwrap_err();
        assert_eq!(err, WorkError::Validation("Team contains duplicate members".to_string()));
        assert!(!err.is_retryable());

        let mut missing = payload(6);
        missing.as_object_mut().unwrap().remove("clientNo");
        let err = handler
            .handle_payload(event(Some(missing), Operation::Update, t(2)))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkError::Deserialization(ref msg) if msg.starts_with("Invalid mpm.engagement.v2 payload")));

        let err = handler
            .handle_payload(event(None, Operation::Update, t(2)))
            .await
            .unwrap_err();
        assert_eq!(err, WorkError::Deserialization("No payload received".to_string()));

        assert_eq!(store.write_count(), 1);
        assert_eq!(stored(&store).engagement.details.engagement_no, 5);
    }

    #[tokio::test]
    async fn test_stale_token_loses_and_retry_succeeds() {
        let (store, handler) = setup();
        handler
            .handle_payload(event(Some(payload(5)), Operation::Create, t(1)))
            .await
            .unwrap();

        // two writers start from the same snapshot
        let (snapshot, token) = load_document::<CanonicalEngagement>(&store, ENGAGEMENT_ID)
            .await
            .unwrap()
            .unwrap();
        let first = EngagementUpdate::from_event(&event(Some(payload(6)), Operation::Update, t(2))).unwrap();
        let second = EngagementUpdate::from_event(&event(Some(payload(7)), Operation::Update, t(3))).unwrap();

        let mut a = snapshot.clone();
        assert!(merge(&mut a, &first, false));
        save_document(&store, &a, Some(token)).await.unwrap();

        let mut b = snapshot;
        assert!(merge(&mut b, &second, false));
        let err = save_document(&store, &b, Some(token)).await.unwrap_err();
        assert!(matches!(err, WorkError::Conflict(_)));
        assert!(err.is_retryable());

        // redelivery re-reads and merges on top of the winner
        let outcome = handler
            .handle_payload(PayloadEvent {
                event_id: second.event_id,
                ..event(Some(payload(7)), Operation::Update, t(3))
            })
            .await
            .unwrap();
        assert_eq!(outcome, HandleOutcome::Updated { version: 3 });
        assert_eq!(stored(&store).engagement.details.engagement_no, 7);
    }

    #[tokio::test]
    async fn test_concurrent_creation_has_one_winner() {
        let store = MemoryDocumentStore::new();
        let update = EngagementUpdate::from_event(&event(Some(payload(5)), Operation::Create, t(1))).unwrap();

        let mut a = CanonicalEngagement::new(update.id, update.event_id, update.value_date, MPM_ENGAGEMENT_V2);
        let mut b = a.clone();
        assert!(merge(&mut a, &update, true));
        assert!(merge(&mut b, &update, true));

        save_document(&store, &a, None).await.unwrap();
        let err = save_document(&store, &b, None).await.unwrap_err();
        assert!(matches!(err, WorkError::Conflict(_)));
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_create_then_older_event_then_delete() {
        let (store, handler) = setup();

        // created at T1
        assert_eq!(
            handler
                .handle_payload(event(Some(payload(10)), Operation::Create, t(1)))
                .await
                .unwrap(),
            HandleOutcome::Created { version: 1 }
        );

        // a late event valued T0 leaves prime data alone
        handler
            .handle_payload(event(Some(payload(9)), Operation::Update, t(0)))
            .await
            .unwrap();
        let doc = stored(&store);
        assert_eq!(doc.engagement.details.engagement_no, 10);
        assert_eq!(doc.engagement.last_update_date_time, t(1));

        // delete at T2
        handler
            .handle_payload(event(Some(payload(10)), Operation::Delete, t(2)))
            .await
            .unwrap();
        let doc = stored(&store);
        assert!(doc.metadata.deleted);
        assert!(doc.mpm.deleted);
        assert_eq!(doc.metadata.last_update_date_time, t(2));
        assert_eq!(doc.metadata.document_version, 2);
    }
}
