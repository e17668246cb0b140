// Transport wrapper for change events, shared by the inbound consumer and the publisher

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::{Operation, WorkError};

/// Tag every envelope must carry to be routed to a handler
pub const PAYLOAD_TYPE_TAG: &str = "payloadType";

/// A validated change envelope.
///
/// Instances only come out of [`Envelope::decode`] or [`EnvelopeBuilder::create`], so
/// the `payloadType` tag is always present and `payload` is only absent on deletes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub event_id: Uuid,
    pub event_date_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, rename = "envelopeTags", alias = "tags")]
    pub tags: BTreeMap<String, String>,
}

/// Wire shape before validation; every field is optional so failures can name what is missing
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    operation: Option<Operation>,
    #[serde(default)]
    payload: Option<Value>,
    event_id: Option<Uuid>,
    event_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    trace_id: Option<String>,
    #[serde(default, rename = "envelopeTags", alias = "tags")]
    tags: Option<BTreeMap<String, String>>,
}

impl Envelope {
    pub fn builder() -> EnvelopeBuilder {
        EnvelopeBuilder::default()
    }

    /// Parse and validate a message body
    pub fn decode(body: &[u8]) -> Result<Envelope, WorkError> {
        let raw: RawEnvelope = serde_json::from_slice(body)
            .map_err(|e| WorkError::Deserialization(format!("Malformed envelope: {e}")))?;

        let operation = raw
            .operation
            .ok_or_else(|| WorkError::Deserialization("Missing required field operation".to_string()))?;
        let event_id = raw
            .event_id
            .ok_or_else(|| WorkError::Deserialization("Missing required field eventId".to_string()))?;
        let event_date_time = raw.event_date_time.ok_or_else(|| {
            WorkError::Deserialization("Missing required field eventDateTime".to_string())
        })?;

        if raw.payload.is_none() && operation != Operation::Delete {
            return Err(WorkError::Deserialization("No payload received".to_string()));
        }

        let tags = raw.tags.unwrap_or_default();
        if !tags.contains_key(PAYLOAD_TYPE_TAG) {
            return Err(WorkError::Deserialization(format!(
                "Missing required tag {PAYLOAD_TYPE_TAG}"
            )));
        }

        Ok(Envelope {
            operation,
            payload: raw.payload,
            event_id,
            event_date_time,
            trace_id: raw.trace_id,
            tags,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, WorkError> {
        serde_json::to_vec(self).map_err(|e| WorkError::Other(format!("Failed to serialize envelope: {e}")))
    }

    pub fn payload_type(&self) -> Result<&str, WorkError> {
        self.tags
            .get(PAYLOAD_TYPE_TAG)
            .map(String::as_str)
            .ok_or_else(|| WorkError::Deserialization(format!("Missing required tag {PAYLOAD_TYPE_TAG}")))
    }
}

// ============ ENVELOPE BUILDER ============

#[derive(Debug, Default, Clone)]
pub struct EnvelopeBuilder {
    operation: Option<Operation>,
    payload: Option<Value>,
    event_id: Option<Uuid>,
    event_date_time: Option<DateTime<Utc>>,
    trace_id: Option<String>,
    tags: BTreeMap<String, String>,
}

impl EnvelopeBuilder {
    pub fn for_operation(mut self, operation: Operation) -> Self {
        self.operation = Some(operation);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = Some(event_id);
        self
    }

    pub fn at(mut self, event_date_time: DateTime<Utc>) -> Self {
        self.event_date_time = Some(event_date_time);
        self
    }

    pub fn for_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Finish the envelope, assigning a fresh event id and the current time when unset
    pub fn create(self) -> Result<Envelope, WorkError> {
        let operation = self
            .operation
            .ok_or_else(|| WorkError::Validation("Envelope requires an operation".to_string()))?;
        if self.payload.is_none() && operation != Operation::Delete {
            return Err(WorkError::Validation(format!(
                "{operation} envelope requires a payload"
            )));
        }
        if !self.tags.contains_key(PAYLOAD_TYPE_TAG) {
            return Err(WorkError::Validation(format!(
                "Envelope requires a {PAYLOAD_TYPE_TAG} tag"
            )));
        }

        Ok(Envelope {
            operation,
            payload: self.payload,
            event_id: self.event_id.unwrap_or_else(Uuid::new_v4),
            event_date_time: self.event_date_time.unwrap_or_else(Utc::now),
            trace_id: self.trace_id,
            tags: self.tags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(value: Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn test_decode_valid_envelope() {
        let event_id = Uuid::new_v4();
        let raw = body(json!({
            "operation": "Update",
            "payload": { "engagementId": "abc" },
            "eventId": event_id,
            "eventDateTime": "2024-03-01T10:00:00Z",
            "traceId": "trace-1",
            "envelopeTags": { "payloadType": "mpm.engagement.v2" }
        }));

        let envelope = Envelope::decode(&raw).unwrap();
        assert_eq!(envelope.operation, Operation::Update);
        assert_eq!(envelope.event_id, event_id);
        assert_eq!(envelope.trace_id.as_deref(), Some("trace-1"));
        assert_eq!(envelope.payload_type().unwrap(), "mpm.engagement.v2");
    }

    #[test]
    fn test_decode_accepts_tags_alias() {
        let raw = body(json!({
            "operation": "create",
            "payload": {},
            "eventId": Uuid::new_v4(),
            "eventDateTime": "2024-03-01T10:00:00Z",
            "tags": { "payloadType": "x" }
        }));
        assert_eq!(Envelope::decode(&raw).unwrap().payload_type().unwrap(), "x");
    }

    #[test]
    fn test_decode_rejects_missing_payload_for_update() {
        let raw = body(json!({
            "operation": "Update",
            "payload": null,
            "eventId": Uuid::new_v4(),
            "eventDateTime": "2024-03-01T10:00:00Z",
            "envelopeTags": { "payloadType": "x" }
        }));
        let err = Envelope::decode(&raw).unwrap_err();
        assert_eq!(err, WorkError::Deserialization("No payload received".to_string()));
    }

    #[test]
    fn test_decode_allows_delete_without_payload() {
        let raw = body(json!({
            "operation": "Delete",
            "eventId": Uuid::new_v4(),
            "eventDateTime": "2024-03-01T10:00:00Z",
            "envelopeTags": { "payloadType": "x" }
        }));
        let envelope = Envelope::decode(&raw).unwrap();
        assert!(envelope.payload.is_none());
    }

    #[test]
    fn test_decode_rejects_missing_payload_type() {
        let raw = body(json!({
            "operation": "Update",
            "payload": {},
            "eventId": Uuid::new_v4(),
            "eventDateTime": "2024-03-01T10:00:00Z",
            "envelopeTags": { "other": "y" }
        }));
        let err = Envelope::decode(&raw).unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("payloadType"));
    }

    #[test]
    fn test_decode_rejects_missing_event_id_and_garbage() {
        let raw = body(json!({
            "operation": "Update",
            "payload": {},
            "eventDateTime": "2024-03-01T10:00:00Z",
            "envelopeTags": { "payloadType": "x" }
        }));
        assert!(Envelope::decode(&raw).unwrap_err().to_string().contains("eventId"));

        let err = Envelope::decode(b"not json").unwrap_err();
        assert!(matches!(err, WorkError::Deserialization(_)));
    }

    #[test]
    fn test_builder_fills_defaults_and_survives_decode() {
        let envelope = Envelope::builder()
            .for_operation(Operation::Update)
            .with_payload(json!({ "id": 1 }))
            .for_trace_id("t")
            .with_tag(PAYLOAD_TYPE_TAG, "dm.engagement.v2")
            .create()
            .unwrap();

        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded, envelope);

        let wire: Value = serde_json::from_slice(&envelope.encode().unwrap()).unwrap();
        assert_eq!(wire["envelopeTags"]["payloadType"], "dm.engagement.v2");
    }

    #[test]
    fn test_builder_requires_payload_type_tag() {
        let result = Envelope::builder()
            .for_operation(Operation::Update)
            .with_payload(json!({}))
            .create();
        assert!(matches!(result, Err(WorkError::Validation(_))));
    }
}
