//! Queue item model and store operation parameters.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::Duration;
use uuid::Uuid;

use crate::errors::{FlowError, FlowResult};
use crate::utils::{far_future, Timestamp};

/// A persisted unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    /// Item id; generated by the store when empty at insert.
    pub id: String,
    /// True while claimed by a worker.
    pub running: bool,
    /// Higher values dequeue first.
    pub priority: f64,
    /// When the item was enqueued.
    pub created_at: Timestamp,
    /// The item is invisible to claimers before this time.
    pub earliest_visible_at: Timestamp,
    /// A running item becomes reclaimable at this time.
    pub lease_reset_at: Timestamp,
    /// Retries left before a transient failure becomes terminal.
    pub retries_remaining: u32,
    /// Number of times the item has been claimed.
    #[serde(default)]
    pub attempts: u32,
    /// Token stamped by the most recent claim.
    #[serde(default)]
    pub lease_token: Option<Uuid>,
    /// Payload schema version.
    pub schema_version: String,
    /// Opaque payload.
    pub payload: serde_json::Value,
}

impl QueueItem {
    /// Creates an unclaimed item visible from `now`.
    #[must_use]
    pub fn new(payload: serde_json::Value, schema_version: impl Into<String>, now: Timestamp) -> Self {
        Self {
            id: String::new(),
            running: false,
            priority: 0.0,
            created_at: now,
            earliest_visible_at: now,
            lease_reset_at: far_future(),
            retries_remaining: 0,
            attempts: 0,
            lease_token: None,
            schema_version: schema_version.into(),
            payload,
        }
    }

    /// Returns true if a claim at `now` may take this item.
    ///
    /// Unclaimed items are claimable once visible; running items only once
    /// their lease has run out.
    #[must_use]
    pub fn is_claimable(&self, now: Timestamp, schema_version: &str) -> bool {
        self.schema_version == schema_version
            && now >= self.earliest_visible_at
            && (!self.running || now >= self.lease_reset_at)
    }

    /// Returns true if a worker holds an unexpired lease.
    #[must_use]
    pub fn has_live_lease(&self, now: Timestamp) -> bool {
        self.running && now < self.lease_reset_at
    }

    /// Returns true if the item was claimed and its lease ran out.
    #[must_use]
    pub fn is_stuck(&self, now: Timestamp) -> bool {
        self.running && now >= self.lease_reset_at
    }

    /// Deserializes the payload.
    pub fn payload_as<P: DeserializeOwned>(&self) -> FlowResult<P> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            FlowError::FatalPayload(format!(
                "item {} (schema {}) payload does not decode: {e}",
                self.id, self.schema_version
            ))
        })
    }
}

/// Ordering used to pick the next item: priority descending, then oldest first.
#[must_use]
pub fn claim_order(a: &QueueItem, b: &QueueItem) -> Ordering {
    b.priority
        .total_cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Options for enqueueing an item.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Priority; higher dequeues first.
    pub priority: f64,
    /// Absolute visibility time.
    pub earliest_visible_at: Option<Timestamp>,
    /// Visibility delay relative to now; ignored when an absolute time is set.
    pub delay: Option<Duration>,
    /// Retry count; the queue default applies when unset.
    pub retries: Option<u32>,
}

impl EnqueueOptions {
    /// Creates default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    /// Makes the item visible at an absolute time.
    #[must_use]
    pub fn visible_at(mut self, at: Timestamp) -> Self {
        self.earliest_visible_at = Some(at);
        self
    }

    /// Makes the item visible after a delay.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Sets the retry count.
    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }
}

/// Filter for counting items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountFilter {
    /// Every item.
    All,
    /// Claimed items.
    Running,
    /// Unclaimed items.
    NotRunning,
}

impl CountFilter {
    /// Returns true if the item passes the filter.
    #[must_use]
    pub fn matches(self, item: &QueueItem) -> bool {
        match self {
            Self::All => true,
            Self::Running => item.running,
            Self::NotRunning => !item.running,
        }
    }
}

/// Parameters of an atomic claim.
#[derive(Debug, Clone)]
pub struct ClaimCriteria {
    /// The claim time.
    pub now: Timestamp,
    /// Lease expiry to stamp on the claimed item.
    pub lease_until: Timestamp,
    /// Only items of this schema version are considered.
    pub schema_version: String,
    /// Token to stamp on the claimed item.
    pub lease_token: Uuid,
}

/// Parameters of a requeue.
#[derive(Debug, Clone)]
pub struct RequeueUpdate {
    /// New retry count.
    pub retries_remaining: u32,
    /// New visibility time.
    pub earliest_visible_at: Timestamp,
}

/// Result of a lease renewal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewOutcome {
    /// The lease now expires at the given time.
    Renewed(Timestamp),
    /// The item no longer exists (acknowledged concurrently).
    Missing,
    /// The item is no longer held under the given token.
    Lost,
}

/// Result of acknowledging or requeueing an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleOutcome {
    /// The item was deleted or requeued.
    Applied,
    /// The item no longer exists.
    Missing,
    /// The item is no longer held under the given token; nothing was changed.
    Lost,
}
