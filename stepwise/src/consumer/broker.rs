//! Stream broker contract and the in-memory broker.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::message::StreamMessage;
use crate::errors::{FlowError, FlowResult};
use crate::utils::{generate_message_id, Clock, SystemClock};

/// An ordered, replayable stream with consumer groups.
///
/// Reading does not acknowledge. An entry read by a group stays pending until
/// acknowledged and may be delivered again.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StreamBroker: Send + Sync {
    /// Reads up to `max_count` entries for `consumer` in `group`, waiting up to `max_wait`.
    async fn read(
        &self,
        group: &str,
        consumer: &str,
        max_count: usize,
        max_wait: Duration,
    ) -> FlowResult<Vec<StreamMessage>>;

    /// Acknowledges an entry for `group`. Unknown ids are ignored.
    async fn ack(&self, group: &str, message_id: &str) -> FlowResult<()>;
}

#[derive(Debug)]
struct PendingEntry {
    index: usize,
    consumer: String,
    delivered_at: Instant,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct GroupState {
    cursor: usize,
    pending: HashMap<String, PendingEntry>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: Vec<StreamMessage>,
    groups: HashMap<String, GroupState>,
    last_millis: i64,
    sequence: u64,
}

/// Single-stream broker held in process memory.
///
/// Entries left pending longer than the redelivery timeout are handed out
/// again on the next read by any consumer of the group.
pub struct InMemoryStreamBroker {
    state: Mutex<StreamState>,
    notify: Notify,
    redelivery_timeout: Duration,
    unavailable: AtomicBool,
    closed: AtomicBool,
    clock: Arc<dyn Clock>,
}

impl InMemoryStreamBroker {
    /// Creates a broker with a 30 second redelivery timeout.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StreamState::default()),
            notify: Notify::new(),
            redelivery_timeout: Duration::from_secs(30),
            unavailable: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            clock: Arc::new(SystemClock),
        }
    }

    /// Sets how long an entry may stay pending before redelivery.
    #[must_use]
    pub fn with_redelivery_timeout(mut self, timeout: Duration) -> Self {
        self.redelivery_timeout = timeout;
        self
    }

    /// Sets the clock used to stamp entries.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Toggles simulated unavailability.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Closes the broker; later calls fail with `StoreClosed`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn check(&self) -> FlowResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FlowError::StoreClosed("in-memory broker closed".to_string()));
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(FlowError::StoreUnavailable("in-memory broker offline".to_string()));
        }
        Ok(())
    }

    /// Appends an entry and wakes blocked readers. Returns the entry id.
    pub fn publish(&self, metadata: HashMap<String, String>, payload: Vec<u8>) -> FlowResult<String> {
        self.check()?;
        let now = self.clock.now();
        let id = {
            let mut state = self.state.lock();
            let millis = now.timestamp_millis().max(state.last_millis);
            if millis == state.last_millis {
                state.sequence += 1;
            } else {
                state.last_millis = millis;
                state.sequence = 0;
            }
            let id = generate_message_id(millis, state.sequence);
            state.entries.push(StreamMessage {
                id: id.clone(),
                metadata,
                payload,
                enqueued_at: now,
            });
            id
        };
        self.notify.notify_waiters();
        Ok(id)
    }

    /// Appends a JSON payload routed to `service`.
    pub fn publish_json(
        &self,
        routing_key: &str,
        service: &str,
        event_type_key: &str,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> FlowResult<String> {
        let metadata = HashMap::from([
            (routing_key.to_string(), service.to_string()),
            (event_type_key.to_string(), event_type.to_string()),
        ]);
        self.publish(metadata, serde_json::to_vec(payload)?)
    }

    /// Returns the number of entries in the stream.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Returns true if nothing was published.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of unacknowledged entries delivered to `group`.
    #[must_use]
    pub fn pending_count(&self, group: &str) -> usize {
        self.state.lock().groups.get(group).map_or(0, |g| g.pending.len())
    }

    /// Returns how many times an entry was delivered to `group`.
    #[must_use]
    pub fn delivery_count(&self, group: &str, message_id: &str) -> Option<u32> {
        self.state
            .lock()
            .groups
            .get(group)
            .and_then(|g| g.pending.get(message_id))
            .map(|p| p.deliveries)
    }

    /// Returns the consumer that last received a pending entry.
    #[must_use]
    pub fn pending_owner(&self, group: &str, message_id: &str) -> Option<String> {
        self.state
            .lock()
            .groups
            .get(group)
            .and_then(|g| g.pending.get(message_id))
            .map(|p| p.consumer.clone())
    }

    fn take_batch(&self, group: &str, consumer: &str, max_count: usize) -> Vec<StreamMessage> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let group_state = state.groups.entry(group.to_string()).or_default();
        let now = Instant::now();
        let mut batch = Vec::new();

        let mut expired: Vec<(usize, String)> = group_state
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.delivered_at) >= self.redelivery_timeout)
            .map(|(id, p)| (p.index, id.clone()))
            .collect();
        expired.sort_unstable();
        for (index, id) in expired.into_iter().take(max_count) {
            if let Some(pending) = group_state.pending.get_mut(&id) {
                pending.consumer = consumer.to_string();
                pending.delivered_at = now;
                pending.deliveries += 1;
            }
            if let Some(entry) = state.entries.get(index) {
                batch.push(entry.clone());
            }
        }

        while batch.len() < max_count && group_state.cursor < state.entries.len() {
            let index = group_state.cursor;
            let entry = &state.entries[index];
            group_state.pending.insert(
                entry.id.clone(),
                PendingEntry {
                    index,
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    deliveries: 1,
                },
            );
            batch.push(entry.clone());
            group_state.cursor += 1;
        }
        batch
    }
}

impl Default for InMemoryStreamBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryStreamBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStreamBroker")
            .field("entries", &self.len())
            .field("redelivery_timeout", &self.redelivery_timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl StreamBroker for InMemoryStreamBroker {
    async fn read(
        &self,
        group: &str,
        consumer: &str,
        max_count: usize,
        max_wait: Duration,
    ) -> FlowResult<Vec<StreamMessage>> {
        let deadline = Instant::now() + max_wait;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.check()?;
            let batch = self.take_batch(group, consumer, max_count.max(1));
            if !batch.is_empty() {
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(batch);
            }
            let wait = (deadline - now).min(self.redelivery_timeout.max(Duration::from_millis(1)));
            tokio::select! {
                () = &mut notified => {}
                () = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn ack(&self, group: &str, message_id: &str) -> FlowResult<()> {
        self.check()?;
        if let Some(group_state) = self.state.lock().groups.get_mut(group) {
            group_state.pending.remove(message_id);
        }
        Ok(())
    }
}
