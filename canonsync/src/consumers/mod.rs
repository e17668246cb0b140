// canonsync/src/consumers/mod.rs - Inbound messages, settlement and session metrics

pub mod jetstream;
mod session;

pub use jetstream::{JetStreamAcker, QueueConsumer};
pub use session::{dispatch, value_date, SessionConsumer};

use bytes::Bytes;
use canonsync_core::{HandleOutcome, WorkError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::mpsc;

// ============ SETTLEMENT ============

/// Final disposition of one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// Remove the message from the queue
    Complete,
    /// Hand the message back for redelivery
    Abandon,
    /// Park the message; it is never retried
    DeadLetter { reason: String, description: String },
}

impl Settlement {
    pub fn name(&self) -> &'static str {
        match self {
            Settlement::Complete => "complete",
            Settlement::Abandon => "abandon",
            Settlement::DeadLetter { .. } => "dead_letter",
        }
    }
}

/// Decide how a delivery is settled from the handler result and the delivery attempt (1-based)
pub fn settlement_for(
    result: &Result<HandleOutcome, WorkError>,
    delivery_count: u32,
    max_delivery_count: u32,
) -> Settlement {
    match result {
        Ok(_) => Settlement::Complete,
        Err(err) if !err.is_retryable() || delivery_count >= max_delivery_count => Settlement::DeadLetter {
            reason: err.kind().to_string(),
            description: err.to_string(),
        },
        Err(_) => Settlement::Abandon,
    }
}

/// Broker-side settlement of a single delivery
#[async_trait::async_trait]
pub trait MessageAcker: Send + Sync {
    async fn complete(&self) -> Result<(), WorkError>;
    async fn abandon(&self) -> Result<(), WorkError>;
    async fn dead_letter(&self, reason: &str, description: &str, delivery_count: u32) -> Result<(), WorkError>;

    /// Extend the lease on a delivery that is still being worked on
    async fn in_progress(&self) -> Result<(), WorkError> {
        Ok(())
    }
}

// ============ INBOUND MESSAGE ============

/// One delivery from the input queue. Settles at most once; dropping it unsettled
/// leaves the message to broker redelivery.
pub struct InboundMessage {
    pub session_id: String,
    pub subject: Option<String>,
    pub body: Bytes,
    /// 1 on first delivery
    pub delivery_count: u32,
    /// When the broker accepted the message
    pub enqueued_at: DateTime<Utc>,
    acker: Option<Box<dyn MessageAcker>>,
}

impl InboundMessage {
    pub fn new(
        session_id: impl Into<String>,
        body: impl Into<Bytes>,
        delivery_count: u32,
        enqueued_at: DateTime<Utc>,
        acker: impl MessageAcker + 'static,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            subject: None,
            body: body.into(),
            delivery_count,
            enqueued_at,
            acker: Some(Box::new(acker)),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub async fn settle(&mut self, settlement: &Settlement) -> Result<(), WorkError> {
        let acker = self
            .acker
            .take()
            .ok_or_else(|| WorkError::Other("Message was already settled".to_string()))?;
        match settlement {
            Settlement::Complete => acker.complete().await,
            Settlement::Abandon => acker.abandon().await,
            Settlement::DeadLetter { reason, description } => {
                acker.dead_letter(reason, description, self.delivery_count).await
            }
        }
    }

    /// Tell the broker the delivery is still being worked on
    pub async fn keep_alive(&self) -> Result<(), WorkError> {
        match &self.acker {
            Some(acker) => acker.in_progress().await,
            None => Err(WorkError::Other("Message was already settled".to_string())),
        }
    }

    pub fn is_settled(&self) -> bool {
        self.acker.is_none()
    }
}

impl Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("session_id", &self.session_id)
            .field("subject", &self.subject)
            .field("body_len", &self.body.len())
            .field("delivery_count", &self.delivery_count)
            .field("enqueued_at", &self.enqueued_at)
            .field("settled", &self.is_settled())
            .finish()
    }
}

impl Drop for InboundMessage {
    fn drop(&mut self) {
        if self.acker.is_some() {
            tracing::debug!(
                session.id = %self.session_id,
                delivery.count = self.delivery_count,
                "Message dropped unsettled, broker will redeliver"
            );
        }
    }
}

// ============ METRICS ============

/// Counters owned by the session consumer
#[derive(Debug, Default)]
pub(crate) struct SessionMetrics {
    active_sessions: AtomicUsize,
    completed: AtomicU64,
    abandoned: AtomicU64,
    dead_lettered: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub active_sessions: usize,
    pub completed: u64,
    pub abandoned: u64,
    pub dead_lettered: u64,
}

impl SessionMetrics {
    /// Returns the number of active sessions including the new one
    pub(crate) fn session_opened(&self) -> usize {
        self.active_sessions.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn session_closed(&self) {
        self.active_sessions.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn record(&self, settlement: &Settlement) {
        let counter = match settlement {
            Settlement::Complete => &self.completed,
            Settlement::Abandon => &self.abandoned,
            Settlement::DeadLetter { .. } => &self.dead_lettered,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_sessions: self.active_sessions.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

// ============ IN-MEMORY ACKER ============

/// Reports settlements as `(label, settlement)` on a channel
#[derive(Clone, Debug)]
pub struct MemoryAcker {
    label: String,
    tx: mpsc::UnboundedSender<(String, Settlement)>,
}

impl MemoryAcker {
    pub fn new(label: impl Into<String>, tx: mpsc::UnboundedSender<(String, Settlement)>) -> Self {
        Self {
            label: label.into(),
            tx,
        }
    }

    fn report(&self, settlement: Settlement) -> Result<(), WorkError> {
        self.tx
            .send((self.label.clone(), settlement))
            .map_err(|_| WorkError::Transient("settlement receiver dropped".to_string()))
    }
}

#[async_trait::async_trait]
impl MessageAcker for MemoryAcker {
    async fn complete(&self) -> Result<(), WorkError> {
        self.report(Settlement::Complete)
    }

    async fn abandon(&self) -> Result<(), WorkError> {
        self.report(Settlement::Abandon)
    }

    async fn dead_letter(&self, reason: &str, description: &str, _delivery_count: u32) -> Result<(), WorkError> {
        self.report(Settlement::DeadLetter {
            reason: reason.to_string(),
            description: description.to_string(),
        })
    }
}
