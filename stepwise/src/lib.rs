//! # Stepwise
//!
//! The durable execution core of a step-based pipeline engine.
//!
//! Stepwise provides the primitives that keep long-running work moving when
//! processes crash or restart:
//!
//! - **Work queue**: leased, prioritized, delayable items with heartbeats,
//!   bounded retries and stuck-item detection
//! - **Queue workers**: claim, handle, acknowledge or requeue loops
//! - **Event consumers**: consumer-group stream readers with at-least-once delivery
//! - **Failure adviser**: strategy-driven retry, rollback and manual intervention
//! - **Barriers**: named join points for parallel branches
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stepwise::prelude::*;
//!
//! let store = Arc::new(InMemoryLeaseStore::new());
//! let queue = Arc::new(WorkQueue::new(store, QueueConfig::new("steps", "step_queue")));
//! queue.enqueue(&json!({ "step": "build" }), EnqueueOptions::new().with_priority(5.0)).await?;
//!
//! let worker = QueueWorker::new(queue, Arc::new(StepHandler));
//! worker.run(&shutdown).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod adviser;
pub mod barrier;
pub mod cancellation;
pub mod config;
pub mod consumer;
pub mod errors;
pub mod events;
pub mod logging;
pub mod queue;
pub mod testing;
pub mod utils;

#[cfg(test)]
mod integration_tests;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::adviser::{
        Advice, AdviserDecision, ExecutionAdviser, FailureAction, FailureAdviser,
        FailureStrategy, FallbackAction, InterventionBoard, InterventionResolution,
        StepFailure, StepState,
    };
    pub use crate::barrier::{BarrierOutcome, BarrierRegistry, BarrierState};
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{
        AckMode, BarrierConfig, ConsumerConfig, LoggingConfig, QueueConfig, StepwiseConfig,
    };
    pub use crate::consumer::{
        EventConsumer, EventRegistry, InMemoryStreamBroker, MessageHandler, StreamBroker,
        StreamMessage,
    };
    pub use crate::errors::{FlowError, FlowResult, HandlerError};
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::logging::init_logging;
    pub use crate::queue::{
        CountFilter, EnqueueOptions, InMemoryLeaseStore, ItemOutcome, JobContext, LeaseStore,
        QueueHandler, QueueItem, QueueWorker, QueueWorkerPool, WorkQueue,
    };
    pub use crate::utils::{Clock, SystemClock, Timestamp};
}
