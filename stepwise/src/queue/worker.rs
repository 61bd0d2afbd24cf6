//! Queue worker loop and pool.
//!
//! A worker claims one item at a time, keeps its lease alive with a
//! [`HeartbeatGuard`] while the handler runs, and then settles the item:
//!
//! | Handler result        | Action                                   |
//! |-----------------------|------------------------------------------|
//! | success               | acknowledge                              |
//! | fatal / bad payload   | acknowledge, emit a terminal record      |
//! | transient, retries >0 | requeue with one retry fewer             |
//! | transient, retries 0  | acknowledge, emit a terminal record      |
//! | lease lost            | abandon without touching the item        |

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use super::heartbeat::HeartbeatGuard;
use super::item::QueueItem;
use super::record::{TerminalKind, TerminalRecord};
use super::work_queue::WorkQueue;
use crate::cancellation::CancellationToken;
use crate::errors::{FlowError, FlowResult, HandlerError};
use crate::events::{emit_record, names, EventSink, NoOpEventSink};
use crate::utils::generate_id;

/// Processes payloads claimed from a queue.
#[async_trait]
pub trait QueueHandler: Send + Sync + 'static {
    /// Payload type; an item whose payload does not decode is dropped.
    type Payload: DeserializeOwned + Send;

    /// Handles one payload.
    async fn handle(&self, payload: Self::Payload, ctx: &JobContext) -> Result<(), HandlerError>;
}

/// Per-item context passed to handlers.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// The queue item id.
    pub item_id: String,
    /// Claims made so far, including this one.
    pub attempts: u32,
    /// Retries left if this attempt fails transiently.
    pub retries_remaining: u32,
    /// Item priority.
    pub priority: f64,
    lease_lost: Arc<CancellationToken>,
}

impl JobContext {
    /// Returns true once another worker has taken the item over.
    #[must_use]
    pub fn is_lease_lost(&self) -> bool {
        self.lease_lost.is_cancelled()
    }

    /// Waits until the lease is lost.
    pub async fn lease_lost(&self) {
        self.lease_lost.cancelled().await;
    }
}

/// How a claimed item was settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemOutcome {
    /// Succeeded and removed.
    Acked,
    /// Failed fatally and removed.
    Dropped {
        /// Failure reason.
        reason: String,
    },
    /// Failed transiently and returned to the queue.
    Requeued {
        /// Retries left after this failure.
        retries_remaining: u32,
    },
    /// Failed transiently with no retries left and removed.
    Exhausted {
        /// Claims made for the item.
        attempts: u32,
    },
    /// The lease was lost; the item now belongs to another worker.
    Abandoned,
}

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Waiting for an item.
    #[default]
    Idle,
    /// Holding a claimed item.
    Claimed,
    /// Handler running with the heartbeat active.
    Heartbeating,
    /// Last item acknowledged.
    Acked,
    /// Last item requeued.
    Requeued,
    /// Last item abandoned after losing its lease.
    Abandoned,
    /// Loop stopped.
    Stopped,
}

/// Claims and processes items from one queue.
pub struct QueueWorker<H: QueueHandler> {
    worker_id: String,
    queue: Arc<WorkQueue>,
    handler: Arc<H>,
    events: Arc<dyn EventSink>,
    state: RwLock<WorkerState>,
}

impl<H: QueueHandler> QueueWorker<H> {
    /// Creates a worker with a generated id and no event sink.
    #[must_use]
    pub fn new(queue: Arc<WorkQueue>, handler: Arc<H>) -> Self {
        Self {
            worker_id: format!("worker-{}", generate_id()),
            queue,
            handler,
            events: Arc::new(NoOpEventSink),
            state: RwLock::new(WorkerState::Idle),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Sets the worker id.
    #[must_use]
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// Returns the worker id.
    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        *self.state.read()
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.write() = state;
    }

    /// Runs until `shutdown` is cancelled or the store closes.
    ///
    /// Store outages are logged and retried after the configured backoff.
    pub async fn run(&self, shutdown: &CancellationToken) -> FlowResult<()> {
        let config = self.queue.config();
        info!(worker_id = %self.worker_id, queue = %config.name, "Queue worker started");

        let result = loop {
            if shutdown.is_cancelled() {
                break Ok(());
            }
            let claimed = tokio::select! {
                () = shutdown.cancelled() => break Ok(()),
                claimed = self.queue.claim(config.claim_wait(), config.poll_interval()) => claimed,
            };
            match claimed {
                Ok(Some(item)) => {
                    self.process(item).await;
                }
                Ok(None) => {}
                Err(e) if e.is_unrecoverable() => {
                    error!(worker_id = %self.worker_id, error = %e, "Queue store closed; worker stopping");
                    break Err(e);
                }
                Err(e) => {
                    warn!(
                        worker_id = %self.worker_id,
                        error = %e,
                        backoff_ms = config.store_backoff_ms,
                        "Queue store unavailable; backing off"
                    );
                    tokio::select! {
                        () = shutdown.cancelled() => break Ok(()),
                        () = tokio::time::sleep(config.store_backoff()) => {}
                    }
                }
            }
        };

        self.set_state(WorkerState::Stopped);
        info!(worker_id = %self.worker_id, queue = %config.name, "Queue worker stopped");
        result
    }

    /// Claims and processes at most one item.
    pub async fn run_once(&self, max_wait: Duration, poll_interval: Duration) -> FlowResult<Option<ItemOutcome>> {
        match self.queue.claim(max_wait, poll_interval).await? {
            Some(item) => Ok(Some(self.process(item).await)),
            None => Ok(None),
        }
    }

    /// Processes items until none is immediately claimable.
    pub async fn pump_all(&self) -> FlowResult<Vec<ItemOutcome>> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.run_once(Duration::ZERO, Duration::ZERO).await? {
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Runs the handler on a claimed item and settles it.
    pub async fn process(&self, item: QueueItem) -> ItemOutcome {
        let span = tracing::info_span!(
            "queue_item",
            worker_id = %self.worker_id,
            queue = %self.queue.config().name,
            item_id = %item.id,
            attempts = item.attempts,
        );
        self.process_inner(item).instrument(span).await
    }

    async fn process_inner(&self, item: QueueItem) -> ItemOutcome {
        self.set_state(WorkerState::Claimed);

        let payload: H::Payload = match item.payload_as() {
            Ok(payload) => payload,
            Err(e) => return self.drop_item(&item, &e.to_string()).await,
        };

        let Some(token) = item.lease_token else {
            return self.drop_item(&item, "claimed item carries no lease token").await;
        };
        let heartbeat = HeartbeatGuard::start(
            self.queue.clone(),
            item.id.clone(),
            token,
            item.lease_reset_at,
            self.events.clone(),
        );
        let ctx = JobContext {
            item_id: item.id.clone(),
            attempts: item.attempts,
            retries_remaining: item.retries_remaining,
            priority: item.priority,
            lease_lost: heartbeat.lease_lost().clone(),
        };
        self.set_state(WorkerState::Heartbeating);

        let handled = tokio::select! {
            biased;
            result = AssertUnwindSafe(self.handler.handle(payload, &ctx)).catch_unwind() => Some(result),
            () = ctx.lease_lost() => None,
        };
        drop(heartbeat);

        match handled {
            None => self.abandon(&item),
            Some(Ok(Ok(()))) => self.ack_item(&item).await,
            Some(Ok(Err(HandlerError::Fatal(e)))) => self.drop_item(&item, &format!("{e:#}")).await,
            Some(Ok(Err(HandlerError::Transient(e)))) => self.retry_or_exhaust(&item, format!("{e:#}")).await,
            Some(Err(_panic)) => self.retry_or_exhaust(&item, "handler panicked".to_string()).await,
        }
    }

    fn abandon(&self, item: &QueueItem) -> ItemOutcome {
        self.set_state(WorkerState::Abandoned);
        warn!(item_id = %item.id, "Abandoning item after lease loss");
        self.events.try_emit(
            names::QUEUE_ITEM_ABANDONED,
            Some(serde_json::json!({"item_id": item.id, "worker_id": self.worker_id})),
        );
        ItemOutcome::Abandoned
    }

    async fn ack_item(&self, item: &QueueItem) -> ItemOutcome {
        if !self.settle(self.remove(item).await, &item.id, "acknowledge") {
            return self.abandon(item);
        }
        self.set_state(WorkerState::Acked);
        debug!(item_id = %item.id, "Item acknowledged");
        self.events.try_emit(
            names::QUEUE_ITEM_ACKED,
            Some(serde_json::json!({"item_id": item.id, "attempts": item.attempts})),
        );
        ItemOutcome::Acked
    }

    async fn drop_item(&self, item: &QueueItem, reason: &str) -> ItemOutcome {
        if !self.settle(self.remove(item).await, &item.id, "acknowledge") {
            return self.abandon(item);
        }
        error!(item_id = %item.id, reason = %reason, "Dropping item after fatal failure");
        self.set_state(WorkerState::Acked);
        let record = self.terminal_record(item, TerminalKind::Dropped, reason);
        emit_record(self.events.as_ref(), names::QUEUE_ITEM_DROPPED, &record);
        ItemOutcome::Dropped {
            reason: reason.to_string(),
        }
    }

    async fn retry_or_exhaust(&self, item: &QueueItem, reason: String) -> ItemOutcome {
        if item.retries_remaining > 0 {
            let retries_remaining = item.retries_remaining - 1;
            let requeued = match item.lease_token {
                Some(token) => {
                    self.queue
                        .requeue_with_token(&item.id, token, retries_remaining, None)
                        .await
                }
                None => self.queue.requeue(&item.id, retries_remaining, None).await,
            };
            if !self.settle(requeued, &item.id, "requeue") {
                return self.abandon(item);
            }
            warn!(
                item_id = %item.id,
                reason = %reason,
                retries_remaining,
                "Transient failure; requeueing"
            );
            self.set_state(WorkerState::Requeued);
            self.events.try_emit(
                names::QUEUE_ITEM_REQUEUED,
                Some(serde_json::json!({
                    "item_id": item.id,
                    "retries_remaining": retries_remaining,
                    "reason": reason,
                })),
            );
            return ItemOutcome::Requeued { retries_remaining };
        }

        let exhausted = FlowError::ExhaustedRetries {
            id: item.id.clone(),
            attempts: item.attempts,
            reason,
        };
        if !self.settle(self.remove(item).await, &item.id, "acknowledge") {
            return self.abandon(item);
        }
        error!(item_id = %item.id, error = %exhausted, "Retries exhausted");
        self.set_state(WorkerState::Acked);
        let record = self.terminal_record(item, TerminalKind::Exhausted, &exhausted.to_string());
        emit_record(self.events.as_ref(), names::QUEUE_ITEM_EXHAUSTED, &record);
        ItemOutcome::Exhausted {
            attempts: item.attempts,
        }
    }

    async fn remove(&self, item: &QueueItem) -> FlowResult<()> {
        match item.lease_token {
            Some(token) => self.queue.acknowledge_with_token(&item.id, token).await,
            None => self.queue.acknowledge(&item.id).await,
        }
    }

    /// Returns false when another worker holds the item.
    fn settle(&self, result: FlowResult<()>, item_id: &str, operation: &str) -> bool {
        match result {
            Ok(()) => true,
            Err(FlowError::LeaseLost(_)) => false,
            Err(e) => {
                // The lease will expire and the item will be redelivered.
                error!(item_id = %item_id, operation, error = %e, "Failed to settle item");
                true
            }
        }
    }

    fn terminal_record(&self, item: &QueueItem, kind: TerminalKind, reason: &str) -> TerminalRecord {
        TerminalRecord::new(&item.id, &self.queue.config().name, kind, reason, self.queue.now())
            .with_counters(item.attempts, item.retries_remaining)
            .with_worker(&self.worker_id)
            .with_context("schema_version", serde_json::json!(item.schema_version))
    }
}

impl<H: QueueHandler> std::fmt::Debug for QueueWorker<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueWorker")
            .field("worker_id", &self.worker_id)
            .field("queue", &self.queue)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// A fixed set of workers sharing one queue and handler.
#[derive(Debug)]
pub struct QueueWorkerPool {
    shutdown: Arc<CancellationToken>,
    handles: Vec<JoinHandle<FlowResult<()>>>,
}

impl QueueWorkerPool {
    /// Spawns `pool_size` workers from the queue configuration.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn spawn<H: QueueHandler>(queue: Arc<WorkQueue>, handler: Arc<H>, events: Arc<dyn EventSink>) -> Self {
        let shutdown = Arc::new(CancellationToken::new());
        let size = queue.config().pool_size.max(1);
        let name = queue.config().name.clone();

        let handles = (0..size)
            .map(|index| {
                let worker = QueueWorker::new(queue.clone(), handler.clone())
                    .with_events(events.clone())
                    .with_worker_id(format!("{name}-{index}"));
                let shutdown = shutdown.clone();
                tokio::spawn(async move { worker.run(&shutdown).await })
            })
            .collect();

        Self { shutdown, handles }
    }

    /// Returns the number of workers.
    #[must_use]
    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Returns the token that stops every worker.
    #[must_use]
    pub fn shutdown_token(&self) -> Arc<CancellationToken> {
        self.shutdown.clone()
    }

    /// Stops the workers and waits for them to finish their current item.
    ///
    /// Returns the first worker error, if any.
    pub async fn shutdown(self, reason: impl Into<String>) -> FlowResult<()> {
        self.shutdown.cancel(reason);
        let mut first_error = None;
        for result in futures::future::join_all(self.handles).await {
            let err = match result {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(join) => FlowError::TransientHandler(format!("worker task failed: {join}")),
            };
            first_error.get_or_insert(err);
        }
        first_error.map_or(Ok(()), Err)
    }
}
