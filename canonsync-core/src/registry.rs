// Payload handler registry: filled once at startup, read-only afterwards

use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::Arc;
use tracing::{error, trace};

use crate::{PayloadHandler, WorkError};

/// Immutable map from `payloadType` tag to its handler.
///
/// Cloning is cheap and lookups take `&self`, so one registry can be shared by every
/// session task without locking.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<HashMap<&'static str, Arc<dyn PayloadHandler>>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// Find the handler for a payload type. A miss is fatal for the message being handled.
    pub fn get(&self, payload_type: &str) -> Result<Arc<dyn PayloadHandler>, WorkError> {
        trace!("Resolving handler for payload type {}", payload_type);
        self.handlers.get(payload_type).cloned().ok_or_else(|| {
            error!("No handler registered for payload type: {}", payload_type);
            WorkError::UnknownPayloadType(format!(
                "{}. Available types: [{}]",
                payload_type,
                self.payload_types().join(", ")
            ))
        })
    }

    pub fn contains(&self, payload_type: &str) -> bool {
        self.handlers.contains_key(payload_type)
    }

    /// Registered payload types, sorted (useful for debugging)
    pub fn payload_types(&self) -> Vec<&'static str> {
        let mut types: Vec<&'static str> = self.handlers.keys().copied().collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("payload_types", &self.payload_types())
            .finish()
    }
}

// ============ REGISTRATION ============

#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: HashMap<&'static str, Arc<dyn PayloadHandler>>,
}

impl HandlerRegistryBuilder {
    pub fn register<H>(self, handler: H) -> Result<Self, WorkError>
    where
        H: PayloadHandler + 'static,
    {
        self.register_shared(Arc::new(handler))
    }

    /// Register a handler that is already shared elsewhere
    pub fn register_shared(mut self, handler: Arc<dyn PayloadHandler>) -> Result<Self, WorkError> {
        let payload_type = handler.payload_type();
        if self.handlers.contains_key(payload_type) {
            return Err(WorkError::Other(format!(
                "A handler for payload type {payload_type} is already registered"
            )));
        }
        self.handlers.insert(payload_type, handler);
        Ok(self)
    }

    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            handlers: Arc::new(self.handlers),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HandleOutcome, PayloadEvent};
    use tokio_test::assert_ok;

    struct StaticHandler(&'static str);

    #[async_trait::async_trait]
    impl PayloadHandler for StaticHandler {
        fn payload_type(&self) -> &'static str {
            self.0
        }

        async fn handle_payload(&self, _event: PayloadEvent) -> Result<HandleOutcome, WorkError> {
            Ok(HandleOutcome::Unchanged)
        }
    }

    #[test]
    fn test_lookup_registered_handler() {
        let registry = assert_ok!(HandlerRegistry::builder().register(StaticHandler("mpm.engagement.v2")))
            .build();

        assert!(registry.contains("mpm.engagement.v2"));
        assert_eq!(registry.len(), 1);
        let handler = assert_ok!(registry.get("mpm.engagement.v2"));
        assert_eq!(handler.payload_type(), "mpm.engagement.v2");
    }

    #[test]
    fn test_unknown_payload_type_lists_available_types() {
        let registry = HandlerRegistry::builder()
            .register(StaticHandler("b.v1"))
            .and_then(|b| b.register(StaticHandler("a.v1")))
            .unwrap()
            .build();

        let err = registry.get("c.v1").err().expect("lookup should miss");
        assert!(!err.is_retryable());
        let message = err.to_string();
        assert!(message.contains("c.v1"));
        assert!(message.contains("[a.v1, b.v1]"));
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let result = HandlerRegistry::builder()
            .register(StaticHandler("a.v1"))
            .and_then(|b| b.register(StaticHandler("a.v1")));
        assert!(result.is_err());
    }
}
