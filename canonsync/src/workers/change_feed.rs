// canonsync/src/workers/change_feed.rs - Republishes canonical document changes from the KV change log

use async_nats::jetstream::consumer::{pull, AckPolicy, DeliverPolicy};
use async_nats::jetstream::{AckKind, Context, Message};
use canonsync_core::{CanonicalDocument, Envelope, Operation, WorkError, PAYLOAD_TYPE_TAG};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::consumers::{InboundMessage, MessageAcker, Settlement};
use crate::observability::OperationLogger;
use crate::transport::{session_id_from_subject, EnvelopeSender};

/// Called with `(lease token, error)` whenever a batch, or an entry of it, cannot be handled
pub type ErrorCallback = Arc<dyn Fn(&str, &WorkError) + Send + Sync>;

const KV_OPERATION_HEADER: &str = "KV-Operation";

fn log_error(lease_token: &str, error: &WorkError) {
    error!(lease.token = %lease_token, error = %error, error.kind = error.kind(), "Error caught from change feed");
}

// ============ CHANGE PUBLISHER ============

/// Turns changed documents into `Update` envelopes on the output topic
pub struct ChangePublisher<D> {
    sender: Arc<dyn EnvelopeSender>,
    on_error: ErrorCallback,
    _document: PhantomData<fn() -> D>,
}

impl<D: CanonicalDocument> ChangePublisher<D> {
    pub fn new(sender: Arc<dyn EnvelopeSender>) -> Self {
        Self {
            sender,
            on_error: Arc::new(log_error),
            _document: PhantomData,
        }
    }

    pub fn with_error_callback(mut self, on_error: ErrorCallback) -> Self {
        self.on_error = on_error;
        self
    }

    /// Outbound envelope for one document snapshot. The event id is derived from the
    /// document id and version, so a replayed change publishes the same message id.
    pub fn envelope_for(document: &D) -> Result<Envelope, WorkError> {
        let payload = serde_json::to_value(document)
            .map_err(|e| WorkError::Other(format!("Failed to serialize document {}: {e}", document.id())))?;
        let version = document.metadata().document_version;
        Envelope::builder()
            .with_event_id(Uuid::new_v5(&document.id(), &version.to_be_bytes()))
            .for_operation(Operation::Update)
            .with_payload(payload)
            .for_trace_id(Uuid::new_v4().to_string())
            .with_tag(PAYLOAD_TYPE_TAG, D::PAYLOAD_TYPE)
            .create()
    }

    /// Publish every document in order. Stops at the first failure, which the caller must
    /// treat as "batch not handled".
    pub async fn handle_changes(&self, documents: &[D]) -> Result<usize, WorkError> {
        for document in documents {
            let envelope = Self::envelope_for(document)?;
            self.sender.send(&document.id().to_string(), &envelope).await?;
            debug!(document.id = %document.id(), "Detected operation for item");
        }
        debug!("Finished handling changes");
        Ok(documents.len())
    }

    /// Handle one change-log batch and settle its entries.
    ///
    /// Entries that do not decode are reported and dead-lettered on their own. If
    /// publishing fails every remaining entry is abandoned so the whole batch comes back.
    pub async fn process_batch(&self, lease_token: &str, entries: Vec<InboundMessage>) -> Result<usize, WorkError> {
        let read_cost: usize = entries.iter().map(|e| e.body.len()).sum();

        let mut documents = Vec::with_capacity(entries.len());
        let mut pending = Vec::with_capacity(entries.len());
        for mut entry in entries {
            match serde_json::from_slice::<D>(&entry.body) {
                Ok(document) => {
                    documents.push(document);
                    pending.push(entry);
                }
                Err(e) => {
                    let err = WorkError::Deserialization(format!(
                        "Change entry {} is not a valid {}: {e}",
                        entry.session_id,
                        D::PAYLOAD_TYPE
                    ));
                    (self.on_error)(lease_token, &err);
                    let settlement = Settlement::DeadLetter {
                        reason: err.kind().to_string(),
                        description: err.to_string(),
                    };
                    if let Err(e) = entry.settle(&settlement).await {
                        warn!(lease.token = %lease_token, error = %e, "Failed to terminate change entry");
                    }
                }
            }
        }

        match self.handle_changes(&documents).await {
            Ok(published) => {
                for entry in pending.iter_mut() {
                    if let Err(e) = entry.settle(&Settlement::Complete).await {
                        warn!(lease.token = %lease_token, error = %e, "Failed to checkpoint change entry");
                    }
                }
                OperationLogger::change_batch_consumed(lease_token, published, read_cost);
                Ok(published)
            }
            Err(err) => {
                (self.on_error)(lease_token, &err);
                for entry in pending.iter_mut() {
                    if let Err(e) = entry.settle(&Settlement::Abandon).await {
                        warn!(lease.token = %lease_token, error = %e, "Failed to release change entry");
                    }
                }
                Err(err)
            }
        }
    }
}

// ============ CHANGE FEED PROCESSOR ============

/// Acks change-log entries; a dead letter here just terminates the entry
struct ChangeEntryAcker(Message);

#[async_trait::async_trait]
impl MessageAcker for ChangeEntryAcker {
    async fn complete(&self) -> Result<(), WorkError> {
        self.0
            .ack()
            .await
            .map_err(|e| WorkError::Transient(format!("Failed to ack change entry: {e}")))
    }

    async fn abandon(&self) -> Result<(), WorkError> {
        self.0
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(|e| WorkError::Transient(format!("Failed to nack change entry: {e}")))
    }

    async fn dead_letter(&self, _reason: &str, _description: &str, _delivery_count: u32) -> Result<(), WorkError> {
        self.0
            .ack_with(AckKind::Term)
            .await
            .map_err(|e| WorkError::Transient(format!("Failed to terminate change entry: {e}")))
    }
}

/// Durable pull loop over the KV bucket's backing stream, filtered to one container.
/// The consumer's ack floor is the checkpoint.
pub struct ChangeFeedProcessor<D> {
    js: Context,
    bucket: String,
    container: String,
    consumer_name: String,
    batch_size: usize,
    publisher: ChangePublisher<D>,
}

impl<D: CanonicalDocument> ChangeFeedProcessor<D> {
    pub fn new(
        js: Context,
        bucket: impl Into<String>,
        container: impl Into<String>,
        processor_name: &str,
        batch_size: usize,
        publisher: ChangePublisher<D>,
    ) -> Self {
        Self {
            js,
            bucket: bucket.into(),
            container: container.into(),
            consumer_name: format!("{}_changefeed", processor_name),
            batch_size: batch_size.max(1),
            publisher,
        }
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    fn filter_subject(&self) -> String {
        format!("$KV.{}.{}.>", self.bucket, self.container)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let stream = self
            .js
            .get_stream(format!("KV_{}", self.bucket))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to get change log stream for {}: {}", self.bucket, e))?;

        let consumer = stream
            .get_or_create_consumer(
                &self.consumer_name,
                pull::Config {
                    durable_name: Some(self.consumer_name.clone()),
                    description: Some(format!("Change feed for {}.{}", self.bucket, self.container)),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: Duration::from_secs(30),
                    deliver_policy: DeliverPolicy::All,
                    filter_subject: self.filter_subject(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create change feed consumer: {}", e))?;

        info!(
            consumer.name = %self.consumer_name,
            consumer.filter = %self.filter_subject(),
            batch.size = self.batch_size,
            "Change feed processor started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let fetched = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                fetched = consumer
                    .fetch()
                    .max_messages(self.batch_size)
                    .expires(Duration::from_secs(5))
                    .messages() => fetched,
            };

            let mut batch = match fetched {
                Ok(batch) => batch,
                Err(e) => {
                    error!(error = %e, "Failed to fetch change batch, will retry");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let mut entries = Vec::new();
            let mut first_sequence = None;
            while let Some(item) = batch.next().await {
                match item {
                    Ok(message) => {
                        if let Ok(info) = message.info() {
                            first_sequence.get_or_insert(info.stream_sequence);
                        }
                        if let Some(entry) = self.into_entry(message).await {
                            entries.push(entry);
                        }
                    }
                    Err(e) => warn!(error = %e, "Error reading change batch"),
                }
            }
            if entries.is_empty() {
                continue;
            }

            let lease_token = format!("{}:{}", self.consumer_name, first_sequence.unwrap_or_default());
            let span = tracing::info_span!("changefeed.batch", lease.token = %lease_token, batch.len = entries.len());
            if let Err(e) = self.publisher.process_batch(&lease_token, entries).instrument(span).await {
                warn!(lease.token = %lease_token, error = %e, "Change batch withheld for redelivery");
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }

        info!(consumer.name = %self.consumer_name, "Change feed processor stopped");
        Ok(())
    }

    /// Delete and purge markers carry no snapshot; they are acked and skipped
    async fn into_entry(&self, message: Message) -> Option<InboundMessage> {
        let is_marker = message
            .headers
            .as_ref()
            .and_then(|h| h.get(KV_OPERATION_HEADER))
            .map(|v| matches!(v.as_str(), "DEL" | "PURGE"))
            .unwrap_or(false);
        if is_marker {
            if let Err(e) = message.ack().await {
                warn!(error = %e, "Failed to ack delete marker");
            }
            return None;
        }

        let document_id = session_id_from_subject(&message.subject).unwrap_or_default().to_string();
        let (delivery_count, published) = match message.info() {
            Ok(info) => (
                u32::try_from(info.delivered).unwrap_or(u32::MAX),
                DateTime::<Utc>::from_timestamp(info.published.unix_timestamp(), info.published.nanosecond())
                    .unwrap_or_else(Utc::now),
            ),
            Err(_) => (1, Utc::now()),
        };
        let body = message.payload.clone();
        Some(InboundMessage::new(
            document_id,
            body,
            delivery_count,
            published,
            ChangeEntryAcker(message),
        ))
    }
}
