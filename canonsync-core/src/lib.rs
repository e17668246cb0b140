// Core types and traits for the canonsync change-data-capture runtime

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt::{self, Debug};
use thiserror::Error;
use uuid::Uuid;

pub mod envelope;
pub mod registry;

pub use envelope::{Envelope, EnvelopeBuilder, PAYLOAD_TYPE_TAG};
pub use registry::{HandlerRegistry, HandlerRegistryBuilder};

// ============ CORE TRAITS ============

/// A handler that applies one payload type to the canonical store.
///
/// Handlers are registered once at startup and shared by every session, so an
/// implementation must be safe to call concurrently for different documents.
#[async_trait::async_trait]
pub trait PayloadHandler: Send + Sync {
    /// The `payloadType` tag this handler is registered under
    fn payload_type(&self) -> &'static str;

    /// Apply a single change event
    async fn handle_payload(&self, event: PayloadEvent) -> Result<HandleOutcome, WorkError>;
}

/// Implemented by every canonical document type that is stored and republished
pub trait CanonicalDocument: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static {
    /// Payload type used when this document is republished downstream
    const PAYLOAD_TYPE: &'static str;
    /// Schema version stamped on every document of this type
    const SCHEMA_VERSION: u32;

    fn metadata(&self) -> &DocumentMetadata;

    fn id(&self) -> Uuid {
        self.metadata().id
    }
}

// ============ CORE DATA TYPES ============

/// Kind of change carried by an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl TryFrom<String> for Operation {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.trim().to_lowercase().as_str() {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(format!("unknown operation '{other}'")),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create => write!(f, "Create"),
            Operation::Update => write!(f, "Update"),
            Operation::Delete => write!(f, "Delete"),
        }
    }
}

/// Metadata shared by every canonical document.
///
/// `document_version` only ever moves forward: it is bumped once per successful
/// write and never on a discarded no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadata {
    pub id: Uuid,
    pub schema_version: u32,
    pub document_version: u64,
    #[serde(default)]
    pub deleted: bool,
    pub last_update_date_time: DateTime<Utc>,
    pub last_update_source: String,
    pub last_update_event_id: Uuid,
}

impl DocumentMetadata {
    /// Metadata for a document that has not been written yet
    pub fn new(
        id: Uuid,
        schema_version: u32,
        event_id: Uuid,
        value_date: DateTime<Utc>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id,
            schema_version,
            document_version: 0,
            deleted: false,
            last_update_date_time: value_date,
            last_update_source: source.into(),
            last_update_event_id: event_id,
        }
    }

    /// Stamp the metadata of a document that is about to be written
    pub fn record_write(
        &mut self,
        value_date: DateTime<Utc>,
        source: &str,
        event_id: Uuid,
        deleted: bool,
    ) {
        self.document_version += 1;
        self.last_update_date_time = value_date;
        self.last_update_source = source.to_string();
        self.last_update_event_id = event_id;
        self.deleted = deleted;
    }
}

/// One inbound change, as handed to a [`PayloadHandler`]
#[derive(Debug, Clone, PartialEq)]
pub struct PayloadEvent {
    pub payload: Option<serde_json::Value>,
    /// Producer-assigned value date, never later than the broker enqueue time
    pub value_date: DateTime<Utc>,
    pub event_id: Uuid,
    pub operation: Operation,
    /// Session key the message arrived on (the document id)
    pub session_id: Option<String>,
}

/// What a handler did with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// A new document was written
    Created { version: u64 },
    /// An existing document was rewritten
    Updated { version: u64 },
    /// Nothing changed, no write was issued
    Unchanged,
    /// The event did not apply (e.g. a delete for a document that never existed)
    Ignored,
}

impl HandleOutcome {
    pub fn wrote(&self) -> bool {
        matches!(self, HandleOutcome::Created { .. } | HandleOutcome::Updated { .. })
    }
}

// ============ ERRORS ============

/// Failures raised while handling a message.
///
/// The variant decides how the message is settled: deserialization, validation and
/// unknown payload types are never retried, everything else is abandoned and
/// redelivered until the delivery threshold is reached.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkError {
    #[error("{0}")]
    Deserialization(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Conflict(String),
    #[error("no handler registered for payload type {0}")]
    UnknownPayloadType(String),
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Other(String),
}

impl WorkError {
    /// Name recorded as the dead-letter reason
    pub fn kind(&self) -> &'static str {
        match self {
            WorkError::Deserialization(_) => "DeserializationError",
            WorkError::Validation(_) => "ValidationError",
            WorkError::Conflict(_) => "ConflictError",
            WorkError::UnknownPayloadType(_) => "UnknownPayloadType",
            WorkError::Transient(_) => "TransientInfrastructureError",
            WorkError::Other(_) => "Other",
        }
    }

    /// Whether redelivering the same message can succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            WorkError::Deserialization(_)
                | WorkError::Validation(_)
                | WorkError::UnknownPayloadType(_)
        )
    }
}

impl From<serde_json::Error> for WorkError {
    fn from(err: serde_json::Error) -> Self {
        WorkError::Deserialization(err.to_string())
    }
}

// ============ TESTING ============
