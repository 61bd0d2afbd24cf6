//! Consumer-group event stream listener.
//!
//! Delivery is at-least-once: a message read but not acknowledged is
//! delivered again once the broker's redelivery policy applies.

mod backoff;
pub(crate) mod broker;
mod listener;
mod message;
mod metrics;
mod registry;

pub use backoff::{BackoffStrategy, JitterStrategy, PollBackoff, PollBackoffConfig};
pub use broker::{InMemoryStreamBroker, StreamBroker};
pub use listener::{EventConsumer, MessageHandler};
pub use message::StreamMessage;
pub use metrics::ConsumerMetrics;
pub use registry::EventRegistry;
