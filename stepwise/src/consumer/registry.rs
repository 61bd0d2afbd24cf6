//! Typed event registry.
//!
//! Maps the event type carried in message metadata to a decoder producing
//! one variant of the consumer's event enum. The registry is filled once at
//! startup; messages of unregistered types are fatal.

use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;

use super::message::StreamMessage;
use crate::errors::{FlowError, FlowResult};

type Decoder<E> = Box<dyn Fn(&[u8]) -> FlowResult<E> + Send + Sync>;

/// Registry of event decoders keyed by event type.
pub struct EventRegistry<E> {
    type_key: String,
    decoders: HashMap<String, Decoder<E>>,
}

impl<E: 'static> EventRegistry<E> {
    /// Creates an empty registry reading the event type from `type_key`.
    #[must_use]
    pub fn new(type_key: impl Into<String>) -> Self {
        Self {
            type_key: type_key.into(),
            decoders: HashMap::new(),
        }
    }

    /// Registers a JSON payload type wrapped into an event variant.
    #[must_use]
    pub fn register<P, F>(self, event_type: impl Into<String>, wrap: F) -> Self
    where
        P: DeserializeOwned,
        F: Fn(P) -> E + Send + Sync + 'static,
    {
        let event_type = event_type.into();
        let label = event_type.clone();
        self.register_decoder(event_type, move |bytes| {
            serde_json::from_slice::<P>(bytes)
                .map(&wrap)
                .map_err(|e| FlowError::FatalPayload(format!("cannot decode '{label}' payload: {e}")))
        })
    }

    /// Registers a custom decoder.
    #[must_use]
    pub fn register_decoder<F>(mut self, event_type: impl Into<String>, decoder: F) -> Self
    where
        F: Fn(&[u8]) -> FlowResult<E> + Send + Sync + 'static,
    {
        self.decoders.insert(event_type.into(), Box::new(decoder));
        self
    }

    /// Returns the metadata key holding the event type.
    #[must_use]
    pub fn type_key(&self) -> &str {
        &self.type_key
    }

    /// Returns true if the event type has a decoder.
    #[must_use]
    pub fn contains(&self, event_type: &str) -> bool {
        self.decoders.contains_key(event_type)
    }

    /// Returns the registered event types, sorted.
    #[must_use]
    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.decoders.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Decodes a message into an event.
    pub fn decode(&self, message: &StreamMessage) -> FlowResult<E> {
        let event_type = message.metadata_value(&self.type_key).ok_or_else(|| {
            FlowError::FatalPayload(format!("message {} has no '{}' metadata", message.id, self.type_key))
        })?;
        let decoder = self.decoders.get(event_type).ok_or_else(|| {
            FlowError::FatalPayload(format!("message {} has unregistered event type '{event_type}'", message.id))
        })?;
        decoder(&message.payload)
    }
}

impl<E> fmt::Debug for EventRegistry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&String> = self.decoders.keys().collect();
        types.sort_unstable();
        f.debug_struct("EventRegistry")
            .field("type_key", &self.type_key)
            .field("event_types", &types)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct StepCompleted {
        node_id: String,
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct StepFailed {
        node_id: String,
        category: String,
    }

    #[derive(Debug, PartialEq)]
    enum PipelineEvent {
        Completed(StepCompleted),
        Failed(StepFailed),
    }

    fn registry() -> EventRegistry<PipelineEvent> {
        EventRegistry::new("eventType")
            .register("step_completed", PipelineEvent::Completed)
            .register("step_failed", PipelineEvent::Failed)
    }

    fn message(event_type: &str, payload: &str) -> StreamMessage {
        StreamMessage::new("1-0", payload.as_bytes().to_vec(), Utc::now()).with_metadata("eventType", event_type)
    }

    #[test]
    fn test_decodes_registered_types() {
        let registry = registry();
        let event = registry
            .decode(&message("step_failed", r#"{"node_id":"build","category":"TIMEOUT"}"#))
            .unwrap();
        assert_eq!(
            event,
            PipelineEvent::Failed(StepFailed {
                node_id: "build".into(),
                category: "TIMEOUT".into()
            })
        );
        assert_eq!(registry.event_types(), vec!["step_completed", "step_failed"]);
    }

    #[test]
    fn test_unknown_type_is_fatal() {
        let err = registry().decode(&message("step_paused", "{}")).unwrap_err();
        assert!(matches!(err, FlowError::FatalPayload(ref m) if m.contains("step_paused")));
    }

    #[test]
    fn test_missing_type_key_is_fatal() {
        let msg = StreamMessage::new("1-0", b"{}".to_vec(), Utc::now());
        assert!(matches!(registry().decode(&msg), Err(FlowError::FatalPayload(_))));
    }

    #[test]
    fn test_bad_payload_is_fatal() {
        let err = registry().decode(&message("step_completed", "not json")).unwrap_err();
        assert_eq!(err.code(), "FATAL_PAYLOAD");
    }

    #[test]
    fn test_custom_decoder() {
        let registry = EventRegistry::new("eventType").register_decoder("raw", |bytes: &[u8]| Ok(bytes.len()));
        assert_eq!(registry.decode(&message("raw", "abcd")).unwrap(), 4);
        assert!(registry.contains("raw"));
    }
}
