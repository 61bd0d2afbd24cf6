//! Lease store abstraction and the in-memory implementation.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use uuid::Uuid;

use super::item::{claim_order, ClaimCriteria, CountFilter, QueueItem, RenewOutcome, RequeueUpdate, SettleOutcome};
use crate::errors::{FlowError, FlowResult};
use crate::utils::{far_future, generate_id, Timestamp};

/// Durable storage for queue items.
///
/// `claim` must be atomic: among concurrent claimers at most one receives a
/// given item.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Inserts an item, generating its id when empty. Returns the id.
    async fn insert(&self, collection: &str, item: QueueItem) -> FlowResult<String>;

    /// Atomically selects the best claimable item and leases it.
    async fn claim(&self, collection: &str, criteria: &ClaimCriteria) -> FlowResult<Option<QueueItem>>;

    /// Extends a lease. With a token, only the holder of that token may renew.
    async fn renew(
        &self,
        collection: &str,
        id: &str,
        token: Option<Uuid>,
        lease_until: Timestamp,
    ) -> FlowResult<RenewOutcome>;

    /// Deletes an item. With a token, only the holder of that token may delete it.
    async fn delete(&self, collection: &str, id: &str, token: Option<Uuid>) -> FlowResult<SettleOutcome>;

    /// Returns an item to the unclaimed state. With a token, only the holder
    /// of that token may requeue it.
    async fn requeue(
        &self,
        collection: &str,
        id: &str,
        token: Option<Uuid>,
        update: &RequeueUpdate,
    ) -> FlowResult<SettleOutcome>;

    /// Counts items.
    async fn count(&self, collection: &str, filter: CountFilter) -> FlowResult<u64>;

    /// Lists running items whose lease ran out before `now`.
    async fn find_stuck(&self, collection: &str, now: Timestamp) -> FlowResult<Vec<QueueItem>>;

    /// Fetches an item by id.
    async fn get(&self, collection: &str, id: &str) -> FlowResult<Option<QueueItem>>;
}

/// Lease store backed by process memory.
///
/// Availability can be toggled to simulate an unreachable store.
#[derive(Debug, Default)]
pub struct InMemoryLeaseStore {
    collections: Mutex<HashMap<String, HashMap<String, QueueItem>>>,
    unavailable: AtomicBool,
    failures_pending: AtomicU32,
    closed: AtomicBool,
}

impl InMemoryLeaseStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every operation fail with `StoreUnavailable` until re-enabled.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Makes the next `count` operations fail with `StoreUnavailable`.
    pub fn fail_next(&self, count: u32) {
        self.failures_pending.store(count, Ordering::SeqCst);
    }

    /// Closes the store; every later operation fails with `StoreClosed`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Returns the number of items across all collections.
    #[must_use]
    pub fn total_items(&self) -> usize {
        self.collections.lock().values().map(HashMap::len).sum()
    }

    fn check(&self) -> FlowResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FlowError::StoreClosed("in-memory store closed".to_string()));
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(FlowError::StoreUnavailable("in-memory store offline".to_string()));
        }
        let consumed = self
            .failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            return Err(FlowError::StoreUnavailable("injected store failure".to_string()));
        }
        Ok(())
    }
}

/// Without a token any caller may settle the item.
fn holds_lease(item: &QueueItem, token: Option<Uuid>) -> bool {
    token.map_or(true, |t| item.running && item.lease_token == Some(t))
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn insert(&self, collection: &str, mut item: QueueItem) -> FlowResult<String> {
        self.check()?;
        if item.id.is_empty() {
            item.id = generate_id();
        }
        let id = item.id.clone();
        self.collections
            .lock()
            .entry(collection.to_string())
            .or_default()
            .insert(id.clone(), item);
        Ok(id)
    }

    async fn claim(&self, collection: &str, criteria: &ClaimCriteria) -> FlowResult<Option<QueueItem>> {
        self.check()?;
        let mut collections = self.collections.lock();
        let Some(items) = collections.get_mut(collection) else {
            return Ok(None);
        };

        let best_id = items
            .values()
            .filter(|item| item.is_claimable(criteria.now, &criteria.schema_version))
            .min_by(|a, b| claim_order(a, b))
            .map(|item| item.id.clone());

        Ok(best_id.and_then(|id| {
            items.get_mut(&id).map(|item| {
                item.running = true;
                item.lease_reset_at = criteria.lease_until;
                item.lease_token = Some(criteria.lease_token);
                item.attempts = item.attempts.saturating_add(1);
                item.clone()
            })
        }))
    }

    async fn renew(
        &self,
        collection: &str,
        id: &str,
        token: Option<Uuid>,
        lease_until: Timestamp,
    ) -> FlowResult<RenewOutcome> {
        self.check()?;
        let mut collections = self.collections.lock();
        let Some(item) = collections.get_mut(collection).and_then(|items| items.get_mut(id)) else {
            return Ok(RenewOutcome::Missing);
        };

        let held = item.running && token.map_or(true, |t| item.lease_token == Some(t));
        if !held {
            return Ok(RenewOutcome::Lost);
        }
        item.lease_reset_at = lease_until;
        Ok(RenewOutcome::Renewed(lease_until))
    }

    async fn delete(&self, collection: &str, id: &str, token: Option<Uuid>) -> FlowResult<SettleOutcome> {
        self.check()?;
        let mut collections = self.collections.lock();
        let Some(items) = collections.get_mut(collection) else {
            return Ok(SettleOutcome::Missing);
        };
        match items.get(id) {
            None => Ok(SettleOutcome::Missing),
            Some(item) if !holds_lease(item, token) => Ok(SettleOutcome::Lost),
            Some(_) => {
                items.remove(id);
                Ok(SettleOutcome::Applied)
            }
        }
    }

    async fn requeue(
        &self,
        collection: &str,
        id: &str,
        token: Option<Uuid>,
        update: &RequeueUpdate,
    ) -> FlowResult<SettleOutcome> {
        self.check()?;
        let mut collections = self.collections.lock();
        let Some(item) = collections.get_mut(collection).and_then(|items| items.get_mut(id)) else {
            return Ok(SettleOutcome::Missing);
        };
        if !holds_lease(item, token) {
            return Ok(SettleOutcome::Lost);
        }
        item.running = false;
        item.lease_reset_at = far_future();
        item.lease_token = None;
        item.retries_remaining = update.retries_remaining;
        item.earliest_visible_at = update.earliest_visible_at;
        Ok(SettleOutcome::Applied)
    }

    async fn count(&self, collection: &str, filter: CountFilter) -> FlowResult<u64> {
        self.check()?;
        let collections = self.collections.lock();
        let count = collections
            .get(collection)
            .map_or(0, |items| items.values().filter(|item| filter.matches(item)).count());
        Ok(count as u64)
    }

    async fn find_stuck(&self, collection: &str, now: Timestamp) -> FlowResult<Vec<QueueItem>> {
        self.check()?;
        let collections = self.collections.lock();
        let mut stuck: Vec<QueueItem> = collections
            .get(collection)
            .map(|items| items.values().filter(|item| item.is_stuck(now)).cloned().collect())
            .unwrap_or_default();
        stuck.sort_by(claim_order);
        Ok(stuck)
    }

    async fn get(&self, collection: &str, id: &str) -> FlowResult<Option<QueueItem>> {
        self.check()?;
        Ok(self
            .collections
            .lock()
            .get(collection)
            .and_then(|items| items.get(id))
            .cloned())
    }
}
