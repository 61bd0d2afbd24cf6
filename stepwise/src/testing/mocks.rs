//! Mock handlers for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::consumer::{MessageHandler, StreamMessage};
use crate::errors::HandlerError;
use crate::queue::{JobContext, QueueHandler};

/// A handler that succeeds and records every payload it sees.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    payloads: Mutex<Vec<serde_json::Value>>,
}

impl RecordingHandler {
    /// Creates a new recording handler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of handled payloads.
    #[must_use]
    pub fn count(&self) -> usize {
        self.payloads.lock().len()
    }

    /// Returns the handled payloads in order.
    #[must_use]
    pub fn payloads(&self) -> Vec<serde_json::Value> {
        self.payloads.lock().clone()
    }

    /// Resets the recorded payloads.
    pub fn reset(&self) {
        self.payloads.lock().clear();
    }
}

#[async_trait]
impl QueueHandler for RecordingHandler {
    type Payload = serde_json::Value;

    async fn handle(&self, payload: Self::Payload, _ctx: &JobContext) -> Result<(), HandlerError> {
        self.payloads.lock().push(payload);
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    type Event = serde_json::Value;

    async fn handle(&self, event: Self::Event, _message: &StreamMessage) -> Result<(), HandlerError> {
        self.payloads.lock().push(event);
        Ok(())
    }
}

/// A handler that always fails.
#[derive(Debug)]
pub struct FailingHandler {
    error: String,
    fatal: bool,
    calls: AtomicUsize,
}

impl FailingHandler {
    /// Creates a handler failing with a retryable error.
    #[must_use]
    pub fn transient(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            fatal: false,
            calls: AtomicUsize::new(0),
        }
    }

    /// Creates a handler failing with an error that never succeeds on retry.
    #[must_use]
    pub fn fatal(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            fatal: true,
            calls: AtomicUsize::new(0),
        }
    }

    /// Returns the number of calls.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn fail(&self) -> HandlerError {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fatal {
            HandlerError::fatal(self.error.clone())
        } else {
            HandlerError::transient(self.error.clone())
        }
    }
}

#[async_trait]
impl QueueHandler for FailingHandler {
    type Payload = serde_json::Value;

    async fn handle(&self, _payload: Self::Payload, _ctx: &JobContext) -> Result<(), HandlerError> {
        Err(self.fail())
    }
}

#[async_trait]
impl MessageHandler for FailingHandler {
    type Event = serde_json::Value;

    async fn handle(&self, _event: Self::Event, _message: &StreamMessage) -> Result<(), HandlerError> {
        Err(self.fail())
    }
}

/// A handler that sleeps before succeeding.
#[derive(Debug)]
pub struct SlowHandler {
    delay: Duration,
    completed: AtomicUsize,
}

impl SlowHandler {
    /// Creates a handler with the given delay.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            completed: AtomicUsize::new(0),
        }
    }

    /// Returns the number of calls that ran to completion.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        tokio::time::sleep(self.delay).await;
        self.completed.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl QueueHandler for SlowHandler {
    type Payload = serde_json::Value;

    async fn handle(&self, _payload: Self::Payload, _ctx: &JobContext) -> Result<(), HandlerError> {
        self.pause().await;
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for SlowHandler {
    type Event = serde_json::Value;

    async fn handle(&self, _event: Self::Event, _message: &StreamMessage) -> Result<(), HandlerError> {
        self.pause().await;
        Ok(())
    }
}
