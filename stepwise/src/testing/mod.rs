//! Testing utilities for queues and consumers.
//!
//! This module provides:
//! - Mock handlers implementing both handler traits
//! - An in-memory work queue fixture driven by a manual clock

mod fixtures;
mod mocks;

pub use fixtures::TestQueue;
pub use mocks::{FailingHandler, RecordingHandler, SlowHandler};
