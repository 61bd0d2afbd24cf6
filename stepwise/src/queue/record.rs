//! Terminal failure records for dropped and exhausted items.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::utils::Timestamp;

/// Why an item left the queue without succeeding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalKind {
    /// The handler or payload decoding reported a fatal error.
    Dropped,
    /// A transient failure happened with no retries left.
    Exhausted,
}

/// Record of an item that failed terminally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalRecord {
    /// The queue item id.
    pub item_id: String,
    /// Queue name.
    pub queue: String,
    /// Terminal kind.
    pub kind: TerminalKind,
    /// Error message.
    pub error: String,
    /// Stable error code.
    pub error_code: String,
    /// Number of claims made for the item.
    pub attempts: u32,
    /// Retries left when the item failed.
    pub retries_remaining: u32,
    /// Worker that observed the failure.
    pub worker_id: String,
    /// When the failure was recorded.
    pub recorded_at: Timestamp,
    /// Additional context.
    pub context: HashMap<String, serde_json::Value>,
}

impl TerminalRecord {
    /// Creates a new terminal record.
    #[must_use]
    pub fn new(
        item_id: impl Into<String>,
        queue: impl Into<String>,
        kind: TerminalKind,
        error: impl Into<String>,
        recorded_at: Timestamp,
    ) -> Self {
        let error_code = match kind {
            TerminalKind::Dropped => "FATAL_PAYLOAD",
            TerminalKind::Exhausted => "EXHAUSTED_RETRIES",
        };
        Self {
            item_id: item_id.into(),
            queue: queue.into(),
            kind,
            error: error.into(),
            error_code: error_code.to_string(),
            attempts: 0,
            retries_remaining: 0,
            worker_id: String::new(),
            recorded_at,
            context: HashMap::new(),
        }
    }

    /// Sets the attempt and retry counters.
    #[must_use]
    pub fn with_counters(mut self, attempts: u32, retries_remaining: u32) -> Self {
        self.attempts = attempts;
        self.retries_remaining = retries_remaining;
        self
    }

    /// Sets the worker id.
    #[must_use]
    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// Adds context.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_error_code_follows_kind() {
        let now = Utc::now();
        let dropped = TerminalRecord::new("a", "deploy", TerminalKind::Dropped, "bad json", now);
        let exhausted = TerminalRecord::new("b", "deploy", TerminalKind::Exhausted, "timeout", now);
        assert_eq!(dropped.error_code, "FATAL_PAYLOAD");
        assert_eq!(exhausted.error_code, "EXHAUSTED_RETRIES");
    }

    #[test]
    fn test_record_serializes() {
        let record = TerminalRecord::new("a", "deploy", TerminalKind::Exhausted, "timeout", Utc::now())
            .with_counters(4, 0)
            .with_worker("worker-1")
            .with_context("schema_version", serde_json::json!("1"));

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["kind"], "exhausted");
        assert_eq!(value["attempts"], 4);
        assert_eq!(value["worker_id"], "worker-1");
        assert_eq!(value["context"]["schema_version"], "1");
    }
}
