// canonsync/src/consumers/jetstream.rs - Input queue bindings: durable pull consumer and acker

use async_nats::jetstream::consumer::{pull, AckPolicy, DeliverPolicy};
use async_nats::jetstream::{AckKind, Context, Message};
use async_nats::HeaderMap;
use canonsync_core::WorkError;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, info};

use super::{InboundMessage, MessageAcker};
use crate::transport::{
    dead_letter_subject, session_filter, session_id_for, stream_name, DEAD_LETTER_DESCRIPTION_HEADER,
    DEAD_LETTER_REASON_HEADER, DELIVERY_COUNT_HEADER, SESSION_ID_HEADER,
};

pub const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);

/// Header values are single-line and bounded
fn header_safe(value: &str) -> String {
    value
        .chars()
        .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
        .take(1024)
        .collect()
}

/// Settles a JetStream delivery. Dead-lettering republishes the body to the queue's
/// dead-letter subject before terminating the original.
pub struct JetStreamAcker {
    message: Message,
    js: Context,
    dead_letter_subject: String,
    session_id: String,
}

#[async_trait::async_trait]
impl MessageAcker for JetStreamAcker {
    async fn complete(&self) -> Result<(), WorkError> {
        self.message
            .ack()
            .await
            .map_err(|e| WorkError::Transient(format!("Failed to acknowledge message: {e}")))
    }

    async fn abandon(&self) -> Result<(), WorkError> {
        self.message
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(|e| WorkError::Transient(format!("Failed to nack message: {e}")))
    }

    async fn dead_letter(&self, reason: &str, description: &str, delivery_count: u32) -> Result<(), WorkError> {
        let mut headers = HeaderMap::new();
        headers.insert(DEAD_LETTER_REASON_HEADER, header_safe(reason).as_str());
        headers.insert(DEAD_LETTER_DESCRIPTION_HEADER, header_safe(description).as_str());
        headers.insert(DELIVERY_COUNT_HEADER, delivery_count.to_string().as_str());
        headers.insert(SESSION_ID_HEADER, self.session_id.as_str());

        self.js
            .publish_with_headers(self.dead_letter_subject.clone(), headers, self.message.payload.clone())
            .await
            .map_err(|e| WorkError::Transient(format!("Failed to publish dead letter: {e}")))?
            .await
            .map_err(|e| WorkError::Transient(format!("Dead letter was not acknowledged: {e}")))?;

        debug!(nats.subject = %self.dead_letter_subject, dead_letter.reason = %reason, "Dead letter published");

        self.message
            .ack_with(AckKind::Term)
            .await
            .map_err(|e| WorkError::Transient(format!("Failed to terminate message: {e}")))
    }

    async fn in_progress(&self) -> Result<(), WorkError> {
        self.message
            .ack_with(AckKind::Progress)
            .await
            .map_err(|e| WorkError::Transient(format!("Failed to extend message lease: {e}")))
    }
}

/// Durable pull consumer on the input queue stream
#[derive(Clone, Debug)]
pub struct QueueConsumer {
    js: Context,
    queue: String,
    consumer_name: String,
}

impl QueueConsumer {
    pub fn new(js: Context, queue: impl Into<String>, processor_name: &str) -> Self {
        let queue = queue.into();
        let consumer_name = format!("{}_{}", processor_name, stream_name(&queue));
        Self {
            js,
            queue,
            consumer_name,
        }
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    /// Open the consumer and adapt its deliveries to [`InboundMessage`]s
    pub async fn messages(&self, batch: usize) -> anyhow::Result<BoxStream<'static, Result<InboundMessage, WorkError>>> {
        let stream = self
            .js
            .get_stream(stream_name(&self.queue))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to get input queue stream: {}", e))?;

        let consumer = stream
            .get_or_create_consumer(
                &self.consumer_name,
                pull::Config {
                    durable_name: Some(self.consumer_name.clone()),
                    name: Some(self.consumer_name.clone()),
                    description: Some(format!("Session consumer for {}", self.queue)),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: DEFAULT_ACK_WAIT,
                    // the delivery threshold is enforced when settling
                    max_deliver: -1,
                    deliver_policy: DeliverPolicy::All,
                    filter_subject: session_filter(&self.queue),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create input queue consumer: {}", e))?;

        let messages = consumer
            .stream()
            .max_messages_per_batch(batch)
            .messages()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create message stream: {}", e))?;

        info!(
            consumer.name = %self.consumer_name,
            consumer.filter = %session_filter(&self.queue),
            "Input queue consumer ready"
        );

        let js = self.js.clone();
        let queue = self.queue.clone();
        Ok(messages
            .map(move |item| match item {
                Ok(message) => Ok(into_inbound(message, &js, &queue)),
                Err(e) => Err(WorkError::Transient(format!("Input queue error: {e}"))),
            })
            .boxed())
    }
}

fn into_inbound(message: Message, js: &Context, queue: &str) -> InboundMessage {
    let session_id = session_id_for(&message.subject, message.headers.as_ref())
        .unwrap_or_else(|| message.subject.to_string());
    let subject = message.subject.to_string();

    let (delivery_count, enqueued_at) = match message.info() {
        Ok(info) => (
            u32::try_from(info.delivered).unwrap_or(u32::MAX),
            DateTime::<Utc>::from_timestamp(info.published.unix_timestamp(), info.published.nanosecond())
                .unwrap_or_else(Utc::now),
        ),
        Err(_) => (1, Utc::now()),
    };

    let body = message.payload.clone();
    let acker = JetStreamAcker {
        js: js.clone(),
        dead_letter_subject: dead_letter_subject(queue, &session_id),
        session_id: session_id.clone(),
        message,
    };
    InboundMessage::new(session_id, body, delivery_count, enqueued_at, acker).with_subject(subject)
}
