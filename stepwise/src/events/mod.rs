//! Observability events.
//!
//! Loops and primitives report terminal outcomes through an [`EventSink`]
//! handed to them at construction time. There is no process-wide sink.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use serde::Serialize;

/// Serializes a record and emits it without blocking.
///
/// Serialization failures are logged and the event is emitted without data,
/// so a terminal outcome is never silently lost.
pub fn emit_record<T: Serialize>(sink: &dyn EventSink, event_type: &str, record: &T) {
    match serde_json::to_value(record) {
        Ok(value) => sink.try_emit(event_type, Some(value)),
        Err(e) => {
            tracing::error!(event_type, error = %e, "Failed to serialize event record");
            sink.try_emit(event_type, None);
        }
    }
}

/// Event type names emitted by the core.
pub mod names {
    /// A queue item was acknowledged after successful handling.
    pub const QUEUE_ITEM_ACKED: &str = "queue.item.acked";
    /// A queue item was requeued after a transient failure.
    pub const QUEUE_ITEM_REQUEUED: &str = "queue.item.requeued";
    /// A queue item was dropped because its payload can never succeed.
    pub const QUEUE_ITEM_DROPPED: &str = "queue.item.dropped";
    /// A queue item ran out of retries.
    pub const QUEUE_ITEM_EXHAUSTED: &str = "queue.item.exhausted";
    /// A worker gave up an item after losing its lease.
    pub const QUEUE_ITEM_ABANDONED: &str = "queue.item.abandoned";
    /// A heartbeat found its lease owned by another worker.
    pub const QUEUE_LEASE_LOST: &str = "queue.lease.lost";
    /// A consumed message took longer than the slow threshold.
    pub const CONSUMER_MESSAGE_SLOW: &str = "consumer.message.slow";
    /// A consumed message failed in its handler.
    pub const CONSUMER_MESSAGE_FAILED: &str = "consumer.message.failed";
    /// A barrier released all participants.
    pub const BARRIER_RELEASED: &str = "barrier.released";
    /// A barrier was aborted.
    pub const BARRIER_ABORTED: &str = "barrier.aborted";
    /// A barrier timed out.
    pub const BARRIER_TIMED_OUT: &str = "barrier.timed_out";
    /// The failure adviser produced a decision.
    pub const ADVISER_DECISION: &str = "adviser.decision";
}
