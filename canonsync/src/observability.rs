// canonsync/src/observability.rs - Correlation, spans and structured operation logs

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info_span, Span};
use uuid::Uuid;

// ============ CORRELATION CONTEXT ============

/// Correlation context that follows one message from receipt to settlement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationContext {
    /// Unique identifier for the whole operation flow
    pub correlation_id: String,
    /// Session the message arrived on (the document id)
    pub session_id: String,
    /// Envelope event id, once decoded
    pub event_id: Option<Uuid>,
    /// Producer trace id, if the envelope carried one
    pub trace_id: Option<String>,
    pub payload_type: Option<String>,
    pub operation: Option<String>,
    pub delivery_count: u32,
    /// When this operation started
    pub started_at: chrono::DateTime<chrono::Utc>,
    /// NATS subject the message came from
    pub source_subject: Option<String>,
}

impl CorrelationContext {
    pub fn new(session_id: impl Into<String>, delivery_count: u32) -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            event_id: None,
            trace_id: None,
            payload_type: None,
            operation: None,
            delivery_count,
            started_at: Utc::now(),
            source_subject: None,
        }
    }

    pub fn with_subject(mut self, subject: Option<String>) -> Self {
        self.source_subject = subject;
        self
    }

    /// Fill in what only becomes known after the envelope is decoded
    pub fn with_envelope(mut self, envelope: &canonsync_core::Envelope) -> Self {
        self.event_id = Some(envelope.event_id);
        self.trace_id = envelope.trace_id.clone();
        self.payload_type = envelope.payload_type().ok().map(str::to_string);
        self.operation = Some(envelope.operation.to_string());
        // prefer the producer's trace id so logs join up across systems
        if let Some(trace_id) = &envelope.trace_id {
            self.correlation_id = trace_id.clone();
        }
        self
    }

    pub fn elapsed_ms(&self) -> u64 {
        (Utc::now() - self.started_at).num_milliseconds().max(0) as u64
    }
}

// ============ SPAN BUILDER ============

/// Builds consistent spans for each stage of message handling
pub struct SpanBuilder {
    ctx: CorrelationContext,
}

impl SpanBuilder {
    pub fn new(ctx: CorrelationContext) -> Self {
        Self { ctx }
    }

    pub fn message_ingestion(&self) -> Span {
        info_span!(
            "nats.message.ingestion",
            correlation_id = %self.ctx.correlation_id,
            session.id = %self.ctx.session_id,
            nats.subject = ?self.ctx.source_subject,
            delivery.count = self.ctx.delivery_count,
            layer = "infrastructure"
        )
    }

    pub fn payload_handling(&self) -> Span {
        info_span!(
            "handler.payload.handle",
            correlation_id = %self.ctx.correlation_id,
            session.id = %self.ctx.session_id,
            event.id = ?self.ctx.event_id,
            payload.type = ?self.ctx.payload_type,
            operation = ?self.ctx.operation,
            layer = "domain"
        )
    }

    pub fn message_settle(&self, settlement: &str) -> Span {
        info_span!(
            "nats.message.settle",
            correlation_id = %self.ctx.correlation_id,
            session.id = %self.ctx.session_id,
            settlement = %settlement,
            layer = "infrastructure"
        )
    }
}

// ============ OPERATION LOGGER ============

/// Structured logger for message flow
pub struct OperationLogger;

impl OperationLogger {
    pub fn message_received(ctx: &CorrelationContext) {
        tracing::debug!(
            correlation_id = %ctx.correlation_id,
            session.id = %ctx.session_id,
            delivery.count = ctx.delivery_count,
            "Message received"
        );
    }

    pub fn message_completed(ctx: &CorrelationContext, outcome: &str) {
        tracing::info!(
            correlation_id = %ctx.correlation_id,
            session.id = %ctx.session_id,
            event.id = ?ctx.event_id,
            payload.type = ?ctx.payload_type,
            outcome = %outcome,
            duration_ms = ctx.elapsed_ms(),
            "Message completed"
        );
    }

    pub fn message_abandoned(ctx: &CorrelationContext, error: &str) {
        tracing::warn!(
            correlation_id = %ctx.correlation_id,
            session.id = %ctx.session_id,
            event.id = ?ctx.event_id,
            delivery.count = ctx.delivery_count,
            error = %error,
            duration_ms = ctx.elapsed_ms(),
            "Message abandoned for redelivery"
        );
    }

    pub fn message_dead_lettered(ctx: &CorrelationContext, reason: &str, description: &str) {
        tracing::error!(
            correlation_id = %ctx.correlation_id,
            session.id = %ctx.session_id,
            event.id = ?ctx.event_id,
            payload.type = ?ctx.payload_type,
            delivery.count = ctx.delivery_count,
            dead_letter.reason = %reason,
            dead_letter.description = %description,
            "Message dead-lettered"
        );
    }

    /// The merge found nothing to change
    pub fn discarded_no_op(document_id: &str, event_id: Uuid) {
        tracing::debug!(
            document.id = %document_id,
            event.id = %event_id,
            "Update discarded, document unchanged"
        );
    }

    pub fn document_written(document_id: &str, version: u64, created: bool) {
        tracing::info!(
            document.id = %document_id,
            document.version = version,
            document.created = created,
            "Document written"
        );
    }

    pub fn change_batch_consumed(lease_token: &str, documents: usize, read_cost: usize) {
        tracing::info!(
            lease.token = %lease_token,
            batch.documents = documents,
            batch.read_cost_bytes = read_cost,
            "Change batch consumed"
        );
    }
}

// ============ TRACING SETUP ============

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "canonsync=debug,engagement_consumer=debug,warn";

/// Initialize tracing with structured JSON output
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_thread_ids(true)
        .with_target(true)
        .with_level(true)
        .json();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

// ============ OPENTELEMETRY SETUP ============

/// Same as [`init_tracing`] plus an OTLP exporter (endpoint from `OTEL_EXPORTER_OTLP_ENDPOINT`)
#[cfg(feature = "opentelemetry")]
pub fn init_tracing_with_otel(service_name: &str) -> anyhow::Result<()> {
    use opentelemetry_otlp::WithExportConfig;

    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string());

    let otlp_exporter = opentelemetry_otlp::new_exporter().tonic().with_endpoint(endpoint);

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(otlp_exporter)
        .with_trace_config(opentelemetry_sdk::trace::config().with_resource(
            opentelemetry_sdk::Resource::new(vec![opentelemetry::KeyValue::new(
                "service.name",
                service_name.to_string(),
            )]),
        ))
        .install_batch(opentelemetry_sdk::runtime::Tokio)
        .map_err(|e| anyhow::anyhow!("Failed to initialize OTLP trace pipeline: {}", e))?;

    let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .with(telemetry_layer)
        .init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use canonsync_core::{Envelope, Operation, PAYLOAD_TYPE_TAG};

    #[test]
    fn test_context_picks_up_envelope_details() {
        let envelope = Envelope::builder()
            .for_operation(Operation::Delete)
            .for_trace_id("trace-42")
            .with_tag(PAYLOAD_TYPE_TAG, "mpm.engagement.v2")
            .create()
            .unwrap();

        let ctx = CorrelationContext::new("doc-1", 3).with_envelope(&envelope);
        assert_eq!(ctx.correlation_id, "trace-42");
        assert_eq!(ctx.event_id, Some(envelope.event_id));
        assert_eq!(ctx.payload_type.as_deref(), Some("mpm.engagement.v2"));
        assert_eq!(ctx.operation.as_deref(), Some("Delete"));
        assert_eq!(ctx.delivery_count, 3);
    }
}
