//! Event consumer loop.
//!
//! Each cycle reads a bounded batch from the broker, skips messages routed to
//! other services (without acknowledging them), decodes the rest through the
//! [`EventRegistry`] and hands them to a bounded handler pool. By default a
//! message is acknowledged as soon as its handler task is submitted, so
//! handlers must tolerate redelivery and must not rely on the ack for
//! exactly-once effects.

use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};

use super::backoff::PollBackoff;
use super::broker::StreamBroker;
use super::message::StreamMessage;
use super::metrics::ConsumerMetrics;
use super::registry::EventRegistry;
use crate::cancellation::CancellationToken;
use crate::config::{AckMode, ConsumerConfig};
use crate::errors::{FlowError, FlowResult, HandlerError};
use crate::events::{names, EventSink, NoOpEventSink};

/// Handles decoded stream events.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Event type produced by the registry.
    type Event: Send + 'static;

    /// Handles one event. Errors are logged and counted, never retried here.
    async fn handle(&self, event: Self::Event, message: &StreamMessage) -> Result<(), HandlerError>;
}

struct Shared<H: MessageHandler> {
    config: ConsumerConfig,
    broker: Arc<dyn StreamBroker>,
    registry: EventRegistry<H::Event>,
    handler: Arc<H>,
    metrics: Arc<ConsumerMetrics>,
}

/// Consumer-group listener dispatching broker messages to a handler.
pub struct EventConsumer<H: MessageHandler> {
    shared: Arc<Shared<H>>,
    events: Arc<dyn EventSink>,
}

/// In-flight handler tasks and the permits bounding them.
struct Dispatcher {
    tasks: JoinSet<()>,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    fn new(pool_size: usize) -> Self {
        Self {
            tasks: JoinSet::new(),
            permits: Arc::new(Semaphore::new(pool_size.max(1))),
        }
    }

    fn reap(&mut self) {
        while let Some(Some(joined)) = self.tasks.join_next().now_or_never() {
            if let Err(e) = joined {
                if !e.is_cancelled() {
                    error!(error = %e, "Handler task failed");
                }
            }
        }
    }

    async fn join_all(&mut self) {
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                if !e.is_cancelled() {
                    error!(error = %e, "Handler task failed");
                }
            }
        }
    }
}

impl<H: MessageHandler> EventConsumer<H> {
    /// Creates a consumer.
    #[must_use]
    pub fn new(
        config: ConsumerConfig,
        broker: Arc<dyn StreamBroker>,
        registry: EventRegistry<H::Event>,
        handler: Arc<H>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                broker,
                registry,
                handler,
                metrics: Arc::new(ConsumerMetrics::default()),
            }),
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Returns the consumer metrics.
    #[must_use]
    pub fn metrics(&self) -> Arc<ConsumerMetrics> {
        self.shared.metrics.clone()
    }

    /// Returns the consumer configuration.
    #[must_use]
    pub fn config(&self) -> &ConsumerConfig {
        &self.shared.config
    }

    /// Polls until `shutdown` is cancelled or the broker closes.
    ///
    /// On shutdown no new batch is read; in-flight handlers get up to the
    /// configured shutdown timeout to finish before they are aborted.
    pub async fn run(&self, shutdown: &CancellationToken) -> FlowResult<()> {
        let config = &self.shared.config;
        let mut dispatcher = Dispatcher::new(config.handler_pool_size);
        let mut lazy = config.lazy.clone().map(PollBackoff::new);
        info!(
            service = %config.service_name,
            group = %config.group,
            consumer = %config.consumer_name,
            "Event consumer started"
        );

        let result = loop {
            if shutdown.is_cancelled() {
                break Ok(());
            }
            if let Some(backoff) = &lazy {
                tokio::select! {
                    () = shutdown.cancelled() => break Ok(()),
                    () = tokio::time::sleep(backoff.next_delay()) => {}
                }
            }

            let read = tokio::select! {
                () = shutdown.cancelled() => break Ok(()),
                read = self.read_batch() => read,
            };
            match read {
                Ok(batch) => {
                    if let Some(backoff) = lazy.as_mut() {
                        if batch.is_empty() {
                            backoff.record_idle();
                        } else {
                            backoff.reset();
                        }
                    }
                    self.dispatch_batch(batch, &mut dispatcher).await;
                }
                Err(e) if e.is_unrecoverable() => {
                    error!(error = %e, "Broker closed; consumer stopping");
                    break Err(e);
                }
                Err(e) if e.is_transient() => {
                    self.shared.metrics.record_poll_error();
                    warn!(
                        error = %e,
                        backoff_ms = config.unavailable_backoff_ms,
                        "Broker unavailable; backing off"
                    );
                    tokio::select! {
                        () = shutdown.cancelled() => break Ok(()),
                        () = tokio::time::sleep(config.unavailable_backoff()) => {}
                    }
                }
                Err(e) => {
                    self.shared.metrics.record_poll_error();
                    warn!(error = %e, "Poll failed; continuing");
                }
            }
            dispatcher.reap();
        };

        self.drain(&mut dispatcher).await;
        info!(service = %config.service_name, metrics = %self.shared.metrics.to_dict(), "Event consumer stopped");
        result
    }

    /// Runs one poll cycle and waits for every handler it started.
    ///
    /// Returns the number of messages dispatched.
    pub async fn poll_once(&self) -> FlowResult<usize> {
        let mut dispatcher = Dispatcher::new(self.shared.config.handler_pool_size);
        let batch = self.read_batch().await?;
        let dispatched = self.dispatch_batch(batch, &mut dispatcher).await;
        dispatcher.join_all().await;
        Ok(dispatched)
    }

    async fn read_batch(&self) -> FlowResult<Vec<StreamMessage>> {
        let config = &self.shared.config;
        let batch = self
            .shared
            .broker
            .read(&config.group, &config.consumer_name, config.batch_size, config.poll_wait())
            .await?;
        self.shared.metrics.record_received(batch.len());
        Ok(batch)
    }

    async fn dispatch_batch(&self, batch: Vec<StreamMessage>, dispatcher: &mut Dispatcher) -> usize {
        let config = &self.shared.config;
        let mut dispatched = 0;

        for message in batch {
            if !message.is_addressed_to(&config.routing_key, &config.service_name) {
                self.shared.metrics.record_skipped();
                debug!(message_id = %message.id, "Message addressed to another service; skipping");
                continue;
            }

            let event = match self.shared.registry.decode(&message) {
                Ok(event) => event,
                Err(e) => {
                    error!(message_id = %message.id, error = %e, "Dropping undecodable message");
                    self.shared.metrics.record_failed();
                    self.events.try_emit(
                        names::CONSUMER_MESSAGE_FAILED,
                        Some(serde_json::json!({
                            "message_id": message.id,
                            "error": e.to_string(),
                            "fatal": true,
                        })),
                    );
                    ack(&self.shared, &message.id).await;
                    continue;
                }
            };

            let Ok(permit) = dispatcher.permits.clone().acquire_owned().await else {
                break;
            };
            let ack_after_completion = config.ack_mode == AckMode::AfterCompletion;
            let task = handle_message(
                self.shared.clone(),
                self.events.clone(),
                event,
                message.clone(),
                ack_after_completion,
                permit,
            );
            dispatcher.tasks.spawn(task);
            self.shared.metrics.record_dispatched();
            dispatched += 1;

            if !ack_after_completion {
                ack(&self.shared, &message.id).await;
            }
        }
        dispatched
    }

    async fn drain(&self, dispatcher: &mut Dispatcher) {
        let timeout = self.shared.config.shutdown_timeout();
        if tokio::time::timeout(timeout, dispatcher.join_all()).await.is_err() {
            warn!(
                in_flight = dispatcher.tasks.len(),
                timeout_ms = self.shared.config.shutdown_timeout_ms,
                "Handlers still running at shutdown; aborting"
            );
            dispatcher.tasks.abort_all();
            dispatcher.join_all().await;
        }
    }
}

impl<H: MessageHandler> std::fmt::Debug for EventConsumer<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventConsumer")
            .field("service", &self.shared.config.service_name)
            .field("group", &self.shared.config.group)
            .field("registry", &self.shared.registry)
            .finish_non_exhaustive()
    }
}

async fn ack<H: MessageHandler>(shared: &Shared<H>, message_id: &str) {
    match shared.broker.ack(&shared.config.group, message_id).await {
        Ok(()) => shared.metrics.record_acked(),
        // Unacked messages are redelivered; handlers are expected to be idempotent.
        Err(e) => warn!(message_id = %message_id, error = %e, "Acknowledge failed"),
    }
}

async fn handle_message<H: MessageHandler>(
    shared: Arc<Shared<H>>,
    events: Arc<dyn EventSink>,
    event: H::Event,
    message: StreamMessage,
    ack_after_completion: bool,
    _permit: OwnedSemaphorePermit,
) {
    let span = tracing::info_span!(
        "consume",
        message_id = %message.id,
        service = %shared.config.service_name,
        event_type = message.metadata_value(&shared.config.event_type_key).unwrap_or("unknown"),
        metadata = ?message.metadata,
    );

    async move {
        let started = Instant::now();
        let result = AssertUnwindSafe(shared.handler.handle(event, &message)).catch_unwind().await;
        let elapsed = started.elapsed();

        if elapsed > shared.config.slow_threshold() {
            shared.metrics.record_slow();
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                threshold_ms = shared.config.slow_threshold_ms,
                "Slow message handling"
            );
            events.try_emit(
                names::CONSUMER_MESSAGE_SLOW,
                Some(serde_json::json!({
                    "message_id": message.id,
                    "elapsed_ms": elapsed.as_millis() as u64,
                })),
            );
        }

        let failure = match result {
            Ok(Ok(())) => {
                shared.metrics.record_handled(elapsed);
                debug!(elapsed_ms = elapsed.as_millis() as u64, "Message handled");
                if ack_after_completion {
                    ack(&shared, &message.id).await;
                }
                return;
            }
            Ok(Err(e)) => FlowError::from(e),
            Err(_panic) => FlowError::TransientHandler("handler panicked".to_string()),
        };

        shared.metrics.record_failed();
        error!(error = %failure, code = failure.code(), "Message handler failed");
        events.try_emit(
            names::CONSUMER_MESSAGE_FAILED,
            Some(serde_json::json!({
                "message_id": message.id,
                "error": failure.to_string(),
                "fatal": !failure.is_transient(),
            })),
        );
        // Fatal failures will never succeed, so they are not left for redelivery.
        if ack_after_completion && !failure.is_transient() {
            ack(&shared, &message.id).await;
        }
    }
    .instrument(span)
    .await;
}
