//! Leased work queue over a [`LeaseStore`].

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::item::{ClaimCriteria, CountFilter, EnqueueOptions, QueueItem, RenewOutcome, RequeueUpdate, SettleOutcome};
use super::store::LeaseStore;
use crate::config::QueueConfig;
use crate::errors::{FlowError, FlowResult};
use crate::utils::{add_duration, generate_lease_token, Clock, SystemClock, Timestamp};

/// A durable queue with priority, delayed visibility and leases.
///
/// One `WorkQueue` serves one queue type; its collection and schema version
/// come from the [`QueueConfig`].
pub struct WorkQueue {
    store: Arc<dyn LeaseStore>,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
}

impl WorkQueue {
    /// Creates a queue on the wall clock.
    #[must_use]
    pub fn new(store: Arc<dyn LeaseStore>, config: QueueConfig) -> Self {
        Self {
            store,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the clock used for visibility and lease arithmetic.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Returns the queue configuration.
    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Returns the queue's clock.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Returns the current time on the queue's clock.
    #[must_use]
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    fn collection(&self) -> &str {
        &self.config.collection
    }

    /// Persists a new item and returns its id.
    pub async fn enqueue<P: Serialize + ?Sized>(&self, payload: &P, options: EnqueueOptions) -> FlowResult<String> {
        let now = self.now();
        let mut item = QueueItem::new(serde_json::to_value(payload)?, self.config.schema_version.clone(), now);
        item.priority = options.priority;
        item.retries_remaining = options.retries.unwrap_or(self.config.default_retries);
        item.earliest_visible_at = match (options.earliest_visible_at, options.delay) {
            (Some(at), _) => at,
            (None, Some(delay)) => add_duration(now, delay),
            (None, None) => now,
        };

        let id = self.store.insert(self.collection(), item).await?;
        debug!(queue = %self.config.name, item_id = %id, priority = options.priority, "Enqueued item");
        Ok(id)
    }

    /// Makes one atomic claim attempt.
    pub async fn try_claim(&self) -> FlowResult<Option<QueueItem>> {
        let now = self.now();
        let criteria = ClaimCriteria {
            now,
            lease_until: add_duration(now, self.config.lease_duration()),
            schema_version: self.config.schema_version.clone(),
            lease_token: generate_lease_token(),
        };
        let claimed = self.store.claim(self.collection(), &criteria).await?;
        if let Some(item) = &claimed {
            debug!(
                queue = %self.config.name,
                item_id = %item.id,
                attempts = item.attempts,
                "Claimed item"
            );
        }
        Ok(claimed)
    }

    /// Claims the best available item, polling until one appears or `max_wait` elapses.
    ///
    /// A zero `max_wait` makes exactly one attempt.
    pub async fn claim(&self, max_wait: Duration, poll_interval: Duration) -> FlowResult<Option<QueueItem>> {
        let deadline = Instant::now() + max_wait;
        loop {
            if let Some(item) = self.try_claim().await? {
                return Ok(Some(item));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let pause = poll_interval.max(Duration::from_millis(1)).min(deadline - now);
            tokio::time::sleep(pause).await;
        }
    }

    /// Claims with the configured wait and poll interval.
    pub async fn claim_default(&self) -> FlowResult<Option<QueueItem>> {
        self.claim(self.config.claim_wait(), self.config.poll_interval()).await
    }

    /// Extends the lease of a running item by the lease duration.
    ///
    /// Renewing an item that no longer exists is not an error.
    pub async fn renew_lease(&self, id: &str) -> FlowResult<()> {
        match self.renew(id, None).await? {
            RenewOutcome::Renewed(_) => {}
            RenewOutcome::Missing => debug!(item_id = %id, "Lease renewal skipped; item no longer exists"),
            RenewOutcome::Lost => debug!(item_id = %id, "Lease renewal skipped; item is not running"),
        }
        Ok(())
    }

    /// Extends the lease only if it is still held under `token`.
    pub async fn renew_lease_with_token(&self, id: &str, token: Uuid) -> FlowResult<RenewOutcome> {
        self.renew(id, Some(token)).await
    }

    async fn renew(&self, id: &str, token: Option<Uuid>) -> FlowResult<RenewOutcome> {
        let lease_until = add_duration(self.now(), self.config.lease_duration());
        self.store.renew(self.collection(), id, token, lease_until).await
    }

    /// Removes a completed item. Acknowledging a missing item is a no-op.
    pub async fn acknowledge(&self, id: &str) -> FlowResult<()> {
        let outcome = self.store.delete(self.collection(), id, None).await?;
        settled(id, outcome, "acknowledge")
    }

    /// Removes a completed item only if it is still leased under `token`.
    ///
    /// Fails with [`FlowError::LeaseLost`] when another claimer holds the item.
    pub async fn acknowledge_with_token(&self, id: &str, token: Uuid) -> FlowResult<()> {
        let outcome = self.store.delete(self.collection(), id, Some(token)).await?;
        settled(id, outcome, "acknowledge")
    }

    /// Returns an item to the queue with a new retry count.
    ///
    /// Without an explicit visibility time the configured requeue delay applies.
    pub async fn requeue(
        &self,
        id: &str,
        retries_remaining: u32,
        earliest_visible_at: Option<Timestamp>,
    ) -> FlowResult<()> {
        let update = self.requeue_update(retries_remaining, earliest_visible_at);
        let outcome = self.store.requeue(self.collection(), id, None, &update).await?;
        settled(id, outcome, "requeue")
    }

    /// Requeues an item only if it is still leased under `token`.
    ///
    /// Fails with [`FlowError::LeaseLost`] when another claimer holds the item.
    pub async fn requeue_with_token(
        &self,
        id: &str,
        token: Uuid,
        retries_remaining: u32,
        earliest_visible_at: Option<Timestamp>,
    ) -> FlowResult<()> {
        let update = self.requeue_update(retries_remaining, earliest_visible_at);
        let outcome = self.store.requeue(self.collection(), id, Some(token), &update).await?;
        settled(id, outcome, "requeue")
    }

    fn requeue_update(&self, retries_remaining: u32, earliest_visible_at: Option<Timestamp>) -> RequeueUpdate {
        RequeueUpdate {
            retries_remaining,
            earliest_visible_at: earliest_visible_at
                .unwrap_or_else(|| add_duration(self.now(), self.config.requeue_delay())),
        }
    }

    /// Counts items matching the filter.
    pub async fn count(&self, filter: CountFilter) -> FlowResult<u64> {
        self.store.count(self.collection(), filter).await
    }

    /// Lists running items whose lease has expired.
    pub async fn find_stuck(&self) -> FlowResult<Vec<QueueItem>> {
        self.store.find_stuck(self.collection(), self.now()).await
    }

    /// Fetches an item by id.
    pub async fn get(&self, id: &str) -> FlowResult<Option<QueueItem>> {
        self.store.get(self.collection(), id).await
    }
}

fn settled(id: &str, outcome: SettleOutcome, operation: &str) -> FlowResult<()> {
    match outcome {
        SettleOutcome::Applied => Ok(()),
        SettleOutcome::Missing => {
            debug!(item_id = %id, operation, "Settle of missing item ignored");
            Ok(())
        }
        SettleOutcome::Lost => {
            debug!(item_id = %id, operation, "Item is leased by another claimer; left untouched");
            Err(FlowError::LeaseLost(id.to_string()))
        }
    }
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("name", &self.config.name)
            .field("collection", &self.config.collection)
            .finish_non_exhaustive()
    }
}
