//! Error types for the stepwise execution core.
//!
//! The taxonomy follows how failures are treated by the loops:
//! transient store/broker problems are retried, fatal payloads are dropped,
//! handler failures consume retries, and barrier failures are propagated to
//! every waiting participant.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// The main error type for stepwise operations.
#[derive(Debug, Error)]
pub enum FlowError {
    /// The lease store or stream broker could not be reached.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The store connection was closed and will not recover.
    #[error("Store closed: {0}")]
    StoreClosed(String),

    /// The payload can never be processed (e.g. it does not deserialize).
    #[error("Fatal payload: {0}")]
    FatalPayload(String),

    /// The handler reported a recoverable failure.
    #[error("Transient handler error: {0}")]
    TransientHandler(String),

    /// A transient failure occurred with no retries left.
    #[error("Retries exhausted for {id} after {attempts} attempt(s): {reason}")]
    ExhaustedRetries {
        /// The queue item id.
        id: String,
        /// Number of claims made for the item.
        attempts: u32,
        /// The last failure reason.
        reason: String,
    },

    /// The lease was reclaimed by another worker.
    #[error("Lease lost for item {0}")]
    LeaseLost(String),

    /// The barrier was aborted before every participant arrived.
    #[error("Barrier {barrier_id} aborted: {reason}")]
    BarrierAborted {
        /// The barrier id.
        barrier_id: String,
        /// The abort reason.
        reason: String,
    },

    /// The barrier timed out before every participant arrived.
    #[error("Barrier {0} timed out")]
    BarrierTimedOut(String),

    /// No expected count is known for the barrier.
    #[error("Barrier {0} is not registered")]
    BarrierNotRegistered(String),

    /// A step state machine transition is not allowed.
    #[error("{0}")]
    InvalidTransition(#[from] InvalidTransitionError),

    /// Configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FlowError {
    /// Returns true for failures that should be retried after a backoff.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::TransientHandler(_))
    }

    /// Returns true when a loop hitting this error must stop.
    #[must_use]
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Self::StoreClosed(_))
    }

    /// Returns a stable error code for records and events.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            Self::StoreClosed(_) => "STORE_CLOSED",
            Self::FatalPayload(_) => "FATAL_PAYLOAD",
            Self::TransientHandler(_) => "TRANSIENT_HANDLER_ERROR",
            Self::ExhaustedRetries { .. } => "EXHAUSTED_RETRIES",
            Self::LeaseLost(_) => "LEASE_LOST",
            Self::BarrierAborted { .. } => "BARRIER_ABORTED",
            Self::BarrierTimedOut(_) => "BARRIER_TIMED_OUT",
            Self::BarrierNotRegistered(_) => "BARRIER_NOT_REGISTERED",
            Self::InvalidTransition(_) => "INVALID_TRANSITION",
            Self::Config(_) => "CONFIG",
            Self::Serialization(_) => "SERIALIZATION",
            Self::Io(_) => "IO",
        }
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Error returned by queue and message handlers.
///
/// The variant decides what the worker does with the item: fatal errors are
/// acknowledged and dropped, transient errors consume a retry.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The work can never succeed.
    #[error("fatal: {0:#}")]
    Fatal(anyhow::Error),

    /// The work may succeed on a later attempt.
    #[error("transient: {0:#}")]
    Transient(anyhow::Error),
}

impl HandlerError {
    /// Creates a fatal error from a message.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(anyhow::anyhow!(message.into()))
    }

    /// Creates a transient error from a message.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(anyhow::anyhow!(message.into()))
    }

    /// Returns true if the error is fatal.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

impl From<HandlerError> for FlowError {
    fn from(err: HandlerError) -> Self {
        match err {
            HandlerError::Fatal(e) => Self::FatalPayload(format!("{e:#}")),
            HandlerError::Transient(e) => Self::TransientHandler(format!("{e:#}")),
        }
    }
}

/// Error raised when a step state machine is asked for a forbidden transition.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("Invalid transition for node {node_id}: {from} -> {to}")]
pub struct InvalidTransitionError {
    /// The node whose machine rejected the transition.
    pub node_id: String,
    /// The current state.
    pub from: String,
    /// The requested state or event.
    pub to: String,
}

impl InvalidTransitionError {
    /// Creates a new invalid transition error.
    #[must_use]
    pub fn new(node_id: impl Into<String>, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            from: from.into(),
            to: to.into(),
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("node_id".to_string(), serde_json::Value::String(self.node_id.clone()));
        map.insert("from".to_string(), serde_json::Value::String(self.from.clone()));
        map.insert("to".to_string(), serde_json::Value::String(self.to.clone()));
        map
    }
}

/// Result alias used across the crate.
pub type FlowResult<T> = Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(FlowError::StoreUnavailable("down".into()).is_transient());
        assert!(FlowError::TransientHandler("flaky".into()).is_transient());
        assert!(!FlowError::FatalPayload("bad".into()).is_transient());
        assert!(!FlowError::LeaseLost("id".into()).is_transient());
    }

    #[test]
    fn test_unrecoverable_classification() {
        assert!(FlowError::StoreClosed("gone".into()).is_unrecoverable());
        assert!(!FlowError::StoreUnavailable("down".into()).is_unrecoverable());
    }

    #[test]
    fn test_exhausted_retries_message() {
        let err = FlowError::ExhaustedRetries {
            id: "item-1".into(),
            attempts: 3,
            reason: "timeout".into(),
        };
        assert_eq!(err.to_string(), "Retries exhausted for item-1 after 3 attempt(s): timeout");
        assert_eq!(err.code(), "EXHAUSTED_RETRIES");
    }

    #[test]
    fn test_handler_error_conversion() {
        let fatal: FlowError = HandlerError::fatal("cannot parse").into();
        assert!(matches!(fatal, FlowError::FatalPayload(ref m) if m == "cannot parse"));

        let transient: FlowError = HandlerError::transient("try later").into();
        assert!(transient.is_transient());
    }

    #[test]
    fn test_handler_error_keeps_context() {
        let source = anyhow::anyhow!("connection reset").context("calling deploy api");
        let err = HandlerError::Transient(source);
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "transient: calling deploy api: connection reset");
    }

    #[test]
    fn test_invalid_transition_to_dict() {
        let err = InvalidTransitionError::new("node-a", "succeeded", "retrying");
        let dict = err.to_dict();
        assert_eq!(dict["node_id"], "node-a");
        assert_eq!(err.to_string(), "Invalid transition for node node-a: succeeded -> retrying");
    }

    #[test]
    fn test_serde_error_conversion() {
        let parse: Result<u32, _> = serde_json::from_str("not json");
        let err: FlowError = parse.unwrap_err().into();
        assert_eq!(err.code(), "SERIALIZATION");
    }
}
