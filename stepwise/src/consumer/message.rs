//! Stream message envelope.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::utils::Timestamp;

/// An immutable message read from a stream broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMessage {
    /// Broker-assigned id.
    pub id: String,
    /// String metadata; carries the routing and event type keys.
    pub metadata: HashMap<String, String>,
    /// Opaque payload.
    pub payload: Vec<u8>,
    /// When the broker accepted the message.
    pub enqueued_at: Timestamp,
}

impl StreamMessage {
    /// Creates a message with empty metadata.
    #[must_use]
    pub fn new(id: impl Into<String>, payload: Vec<u8>, enqueued_at: Timestamp) -> Self {
        Self {
            id: id.into(),
            metadata: HashMap::new(),
            payload,
            enqueued_at,
        }
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Looks up a metadata value.
    #[must_use]
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Returns true if the routing key names `service`.
    #[must_use]
    pub fn is_addressed_to(&self, routing_key: &str, service: &str) -> bool {
        self.metadata_value(routing_key) == Some(service)
    }

    /// Enqueue time as epoch milliseconds, as carried on the wire.
    #[must_use]
    pub fn timestamp_millis(&self) -> i64 {
        self.enqueued_at.timestamp_millis()
    }
}
