// canonsync/src/transport.rs - Subjects, headers and the outbound envelope sender

use async_nats::jetstream::Context;
use async_nats::HeaderMap;
use bytes::Bytes;
use canonsync_core::{Envelope, WorkError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, instrument};

// ============ HEADERS ============

pub const SESSION_ID_HEADER: &str = "Session-Id";
pub const PAYLOAD_TYPE_HEADER: &str = "payloadType";
pub const DEAD_LETTER_REASON_HEADER: &str = "DeadLetterReason";
pub const DEAD_LETTER_DESCRIPTION_HEADER: &str = "DeadLetterErrorDescription";
pub const DELIVERY_COUNT_HEADER: &str = "DeliveryCount";

// ============ SUBJECTS AND STREAMS ============

/// JetStream stream name for a queue or topic name (`dih-engagement.in` -> `DIH_ENGAGEMENT_IN`)
pub fn stream_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '.' | '-' | ' ' | '*' | '>' => '_',
            other => other.to_ascii_uppercase(),
        })
        .collect()
}

/// Wildcard covering every session of a queue or topic
pub fn session_filter(name: &str) -> String {
    format!("{}.*", name)
}

pub fn session_subject(name: &str, session_id: &str) -> String {
    format!("{}.{}", name, session_id)
}

pub fn dead_letter_name(queue: &str) -> String {
    format!("{}-deadletter", queue)
}

pub fn dead_letter_subject(queue: &str, session_id: &str) -> String {
    session_subject(&dead_letter_name(queue), session_id)
}

/// Whether `value` fits in a single subject token, i.e. can stand in for a `*` wildcard
pub fn is_subject_token(value: &str) -> bool {
    !value.is_empty()
        && !value
            .chars()
            .any(|c| matches!(c, '.' | '*' | '>') || c.is_whitespace() || c.is_control())
}

/// Session key of an inbound message: the `Session-Id` header if it is a valid subject
/// token, else the last subject token. Dead letters are published under the session key,
/// so a key that would not match `<queue>-deadletter.*` is never used.
pub fn session_id_for(subject: &str, headers: Option<&HeaderMap>) -> Option<String> {
    if let Some(id) = headers
        .and_then(|h| h.get(SESSION_ID_HEADER))
        .map(|v| v.as_str().trim())
        .filter(|v| !v.is_empty())
    {
        if is_subject_token(id) {
            return Some(id.to_string());
        }
        debug!(session.header = %id, nats.subject = %subject, "Session-Id header is not a subject token, using subject");
    }
    session_id_from_subject(subject).map(str::to_string)
}

pub fn session_id_from_subject(subject: &str) -> Option<&str> {
    match subject.rsplit_once('.') {
        Some((_, last)) if !last.is_empty() => Some(last),
        _ => None,
    }
}

// ============ OUTBOUND SENDER ============

/// Publishes envelopes onto a session-partitioned topic
#[async_trait::async_trait]
pub trait EnvelopeSender: Send + Sync {
    /// Resolves only once the broker has accepted the message
    async fn send(&self, session_id: &str, envelope: &Envelope) -> Result<(), WorkError>;
}

#[derive(Clone, Debug)]
pub struct JetStreamSender {
    js: Context,
    topic: String,
}

impl JetStreamSender {
    pub fn new(js: Context, topic: impl Into<String>) -> Self {
        Self {
            js,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait::async_trait]
impl EnvelopeSender for JetStreamSender {
    #[instrument(name = "envelope.publish", level = "debug", skip(self, envelope), fields(event.id = %envelope.event_id))]
    async fn send(&self, session_id: &str, envelope: &Envelope) -> Result<(), WorkError> {
        let subject = session_subject(&self.topic, session_id);
        let body = envelope.encode()?;

        let mut headers = HeaderMap::new();
        headers.insert(async_nats::header::NATS_MESSAGE_ID, envelope.event_id.to_string().as_str());
        headers.insert(SESSION_ID_HEADER, session_id);
        headers.insert(PAYLOAD_TYPE_HEADER, envelope.payload_type()?);

        let ack = self
            .js
            .publish_with_headers(subject.clone(), headers, Bytes::from(body))
            .await
            .map_err(|e| {
                error!(nats.subject = %subject, error = %e, "Failed to publish envelope");
                WorkError::Transient(format!("Failed to publish to {subject}: {e}"))
            })?;
        ack.await
            .map_err(|e| WorkError::Transient(format!("Publish to {subject} was not acknowledged: {e}")))?;

        debug!(nats.subject = %subject, event.id = %envelope.event_id, "📤 Envelope published");
        Ok(())
    }
}

/// Records envelopes instead of publishing them; can be switched into a failing mode
#[derive(Clone, Debug, Default)]
pub struct MemorySender {
    sent: Arc<Mutex<Vec<(String, Envelope)>>>,
    failing: Arc<AtomicBool>,
}

impl MemorySender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Everything sent so far as `(session id, envelope)`
    pub fn sent(&self) -> Vec<(String, Envelope)> {
        self.sent
            .lock()
            .map(|sent| sent.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

#[async_trait::async_trait]
impl EnvelopeSender for MemorySender {
    async fn send(&self, session_id: &str, envelope: &Envelope) -> Result<(), WorkError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(WorkError::Transient("topic unavailable".to_string()));
        }
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((session_id.to_string(), envelope.clone()));
        Ok(())
    }
}
