//! Named barriers shared by parallel branches.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::state::{BarrierOutcome, BarrierSnapshot, BarrierState};
use crate::config::BarrierConfig;
use crate::errors::{FlowError, FlowResult};
use crate::events::{emit_record, names, EventSink, NoOpEventSink};
use crate::utils::{Clock, SystemClock, Timestamp};

#[derive(Debug)]
struct BarrierInner {
    expected_count: usize,
    arrivals: BTreeSet<String>,
    state: BarrierState,
    reason: Option<String>,
    decided_at: Option<Timestamp>,
}

impl BarrierInner {
    fn outcome(&self) -> Option<BarrierOutcome> {
        match self.state {
            BarrierState::Waiting => None,
            BarrierState::Released => Some(BarrierOutcome::Released),
            BarrierState::Failed => Some(BarrierOutcome::Failed {
                reason: self.reason.clone().unwrap_or_default(),
            }),
            BarrierState::TimedOut => Some(BarrierOutcome::TimedOut),
        }
    }
}

#[derive(Debug)]
struct BarrierCell {
    id: String,
    inner: Mutex<BarrierInner>,
    decided: watch::Sender<Option<BarrierOutcome>>,
}

impl BarrierCell {
    fn new(id: &str, expected_count: usize) -> Self {
        let (decided, _) = watch::channel(None);
        Self {
            id: id.to_string(),
            inner: Mutex::new(BarrierInner {
                expected_count,
                arrivals: BTreeSet::new(),
                state: BarrierState::Waiting,
                reason: None,
                decided_at: None,
            }),
            decided,
        }
    }

    fn snapshot(&self) -> BarrierSnapshot {
        let inner = self.inner.lock();
        snapshot_of(&self.id, &inner)
    }
}

fn snapshot_of(id: &str, inner: &BarrierInner) -> BarrierSnapshot {
    BarrierSnapshot {
        barrier_id: id.to_string(),
        expected_count: inner.expected_count,
        arrived_count: inner.arrivals.len(),
        state: inner.state,
        arrivals: inner.arrivals.clone(),
        reason: inner.reason.clone(),
        decided_at: inner.decided_at,
    }
}

/// Registry of named barriers.
///
/// A barrier releases once `expected_count` distinct participants arrive.
/// Abort and timeout are sticky: every current and future arrival on the
/// same id observes the decided outcome.
pub struct BarrierRegistry {
    barriers: DashMap<String, Arc<BarrierCell>>,
    config: BarrierConfig,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
}

impl BarrierRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(config: BarrierConfig) -> Self {
        Self {
            barriers: DashMap::new(),
            config,
            events: Arc::new(NoOpEventSink),
            clock: Arc::new(SystemClock),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Sets the clock used for decision timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Registers a barrier.
    ///
    /// Registering an id that already exists keeps the existing barrier and
    /// returns false.
    pub fn register(&self, barrier_id: &str, expected_count: usize) -> FlowResult<bool> {
        if expected_count == 0 {
            return Err(FlowError::Config(format!(
                "barrier {barrier_id} needs at least one participant"
            )));
        }
        let mut created = false;
        self.barriers.entry(barrier_id.to_string()).or_insert_with(|| {
            created = true;
            Arc::new(BarrierCell::new(barrier_id, expected_count))
        });
        if created {
            debug!(barrier_id, expected_count, "Barrier registered");
        }
        Ok(created)
    }

    /// Records an arrival without waiting and returns the resulting state.
    pub fn try_arrive(&self, barrier_id: &str, participant_id: &str) -> FlowResult<BarrierState> {
        let cell = self.cell_for_arrival(barrier_id)?;
        Ok(self.record_arrival(&cell, participant_id))
    }

    /// Records an arrival and waits until the barrier is decided.
    pub async fn arrive(&self, barrier_id: &str, participant_id: &str) -> FlowResult<BarrierOutcome> {
        let cell = self.cell_for_arrival(barrier_id)?;
        self.record_arrival(&cell, participant_id);
        Ok(wait_decided(&cell).await)
    }

    /// Records an arrival and waits at most `timeout`.
    ///
    /// If the wait elapses first the barrier times out for every participant.
    pub async fn arrive_with_timeout(
        &self,
        barrier_id: &str,
        participant_id: &str,
        timeout: Duration,
    ) -> FlowResult<BarrierOutcome> {
        let cell = self.cell_for_arrival(barrier_id)?;
        self.record_arrival(&cell, participant_id);
        match tokio::time::timeout(timeout, wait_decided(&cell)).await {
            Ok(outcome) => Ok(outcome),
            Err(_) => Ok(self.decide(&cell, BarrierState::TimedOut, None)),
        }
    }

    /// Aborts a barrier, failing every current and future participant.
    ///
    /// Aborting an unknown id leaves a failed barrier behind so late arrivals
    /// still observe the failure. Returns the decided outcome, which is the
    /// earlier one if the barrier was already decided.
    pub fn abort(&self, barrier_id: &str, reason: impl Into<String>) -> BarrierOutcome {
        let cell = self.cell_or_tombstone(barrier_id);
        self.decide(&cell, BarrierState::Failed, Some(reason.into()))
    }

    /// Times a barrier out, failing every current and future participant.
    pub fn timeout(&self, barrier_id: &str) -> BarrierOutcome {
        let cell = self.cell_or_tombstone(barrier_id);
        self.decide(&cell, BarrierState::TimedOut, None)
    }

    /// Returns a snapshot of a barrier.
    #[must_use]
    pub fn status(&self, barrier_id: &str) -> Option<BarrierSnapshot> {
        self.barriers.get(barrier_id).map(|cell| cell.snapshot())
    }

    /// Forgets a barrier. Participants already waiting keep waiting on it.
    pub fn remove(&self, barrier_id: &str) -> Option<BarrierSnapshot> {
        self.barriers.remove(barrier_id).map(|(_, cell)| cell.snapshot())
    }

    /// Returns the number of known barriers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.barriers.len()
    }

    /// Returns true if no barrier is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.barriers.is_empty()
    }

    fn cell_for_arrival(&self, barrier_id: &str) -> FlowResult<Arc<BarrierCell>> {
        if let Some(cell) = self.barriers.get(barrier_id) {
            return Ok(Arc::clone(cell.value()));
        }
        let expected = self
            .config
            .default_expected_count
            .ok_or_else(|| FlowError::BarrierNotRegistered(barrier_id.to_string()))?;
        let cell = self
            .barriers
            .entry(barrier_id.to_string())
            .or_insert_with(|| Arc::new(BarrierCell::new(barrier_id, expected)));
        Ok(Arc::clone(cell.value()))
    }

    fn cell_or_tombstone(&self, barrier_id: &str) -> Arc<BarrierCell> {
        let expected = self.config.default_expected_count.unwrap_or(0);
        let cell = self
            .barriers
            .entry(barrier_id.to_string())
            .or_insert_with(|| Arc::new(BarrierCell::new(barrier_id, expected)));
        Arc::clone(cell.value())
    }

    fn record_arrival(&self, cell: &BarrierCell, participant_id: &str) -> BarrierState {
        let (outcome, snapshot) = {
            let mut inner = cell.inner.lock();
            if inner.state.is_decided() {
                return inner.state;
            }
            if !inner.arrivals.insert(participant_id.to_string()) {
                debug!(barrier_id = %cell.id, participant_id, "Duplicate barrier arrival ignored");
                return inner.state;
            }
            debug!(
                barrier_id = %cell.id,
                participant_id,
                arrived = inner.arrivals.len(),
                expected = inner.expected_count,
                "Barrier arrival"
            );
            if inner.arrivals.len() < inner.expected_count {
                return BarrierState::Waiting;
            }
            // Release in the same critical section that counted the last
            // arrival so a concurrent abort cannot slip in between.
            decide_locked(cell, &mut inner, BarrierState::Released, None, self.clock.now())
        };

        self.report(cell, &outcome, &snapshot);
        outcome.state()
    }

    /// Moves a waiting barrier to `state`. The first decision wins.
    fn decide(&self, cell: &BarrierCell, state: BarrierState, reason: Option<String>) -> BarrierOutcome {
        let (outcome, snapshot) = {
            let mut inner = cell.inner.lock();
            if let Some(existing) = inner.outcome() {
                return existing;
            }
            decide_locked(cell, &mut inner, state, reason, self.clock.now())
        };
        self.report(cell, &outcome, &snapshot);
        outcome
    }

    fn report(&self, cell: &BarrierCell, outcome: &BarrierOutcome, snapshot: &BarrierSnapshot) {
        let event_type = match outcome {
            BarrierOutcome::Released => {
                info!(barrier_id = %cell.id, participants = snapshot.arrived_count, "Barrier released");
                names::BARRIER_RELEASED
            }
            BarrierOutcome::Failed { reason } => {
                warn!(barrier_id = %cell.id, reason = %reason, "Barrier aborted");
                names::BARRIER_ABORTED
            }
            BarrierOutcome::TimedOut => {
                warn!(
                    barrier_id = %cell.id,
                    arrived = snapshot.arrived_count,
                    expected = snapshot.expected_count,
                    "Barrier timed out"
                );
                names::BARRIER_TIMED_OUT
            }
        };
        emit_record(self.events.as_ref(), event_type, snapshot);
    }
}

/// Records a decision on a barrier still waiting. Caller holds the lock.
fn decide_locked(
    cell: &BarrierCell,
    inner: &mut BarrierInner,
    state: BarrierState,
    reason: Option<String>,
    now: Timestamp,
) -> (BarrierOutcome, BarrierSnapshot) {
    let outcome = match state {
        BarrierState::Released => BarrierOutcome::Released,
        BarrierState::Failed => BarrierOutcome::Failed {
            reason: reason.clone().unwrap_or_default(),
        },
        BarrierState::Waiting | BarrierState::TimedOut => BarrierOutcome::TimedOut,
    };
    inner.state = outcome.state();
    inner.reason = reason;
    inner.decided_at = Some(now);
    // Publish under the lock so no arrival can observe the state
    // without the watch value.
    cell.decided.send_replace(Some(outcome.clone()));
    (outcome, snapshot_of(&cell.id, inner))
}

impl Default for BarrierRegistry {
    fn default() -> Self {
        Self::new(BarrierConfig::default())
    }
}

impl std::fmt::Debug for BarrierRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BarrierRegistry")
            .field("barriers", &self.barriers.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

async fn wait_decided(cell: &BarrierCell) -> BarrierOutcome {
    let mut rx = cell.decided.subscribe();
    loop {
        let current = rx.borrow_and_update().clone();
        if let Some(outcome) = current {
            return outcome;
        }
        // The sender lives as long as the cell, so this only fails if the
        // cell is gone, which cannot happen while we hold a reference.
        if rx.changed().await.is_err() {
            return cell
                .inner
                .lock()
                .outcome()
                .unwrap_or(BarrierOutcome::TimedOut);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use pretty_assertions::assert_eq;

    async fn wait_for_arrivals(registry: &BarrierRegistry, barrier_id: &str, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while registry.status(barrier_id).map_or(0, |s| s.arrived_count) < count {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_releases_when_all_arrive() {
        let events = Arc::new(CollectingEventSink::new());
        let registry = Arc::new(BarrierRegistry::default().with_events(events.clone()));
        registry.register("join", 3).unwrap();

        let mut waiters = Vec::new();
        for participant in ["a", "b", "c"] {
            let registry = registry.clone();
            waiters.push(tokio::spawn(async move { registry.arrive("join", participant).await }));
        }
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap().unwrap(), BarrierOutcome::Released);
        }

        let record = events.last_of_type(names::BARRIER_RELEASED).unwrap();
        assert_eq!(record["arrived_count"], 3);
        assert_eq!(record["arrivals"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_duplicate_arrival_counts_once() {
        let registry = BarrierRegistry::default();
        registry.register("join", 2).unwrap();

        assert_eq!(registry.try_arrive("join", "a").unwrap(), BarrierState::Waiting);
        assert_eq!(registry.try_arrive("join", "a").unwrap(), BarrierState::Waiting);
        assert_eq!(registry.status("join").unwrap().arrived_count, 1);
        assert_eq!(registry.try_arrive("join", "b").unwrap(), BarrierState::Released);
    }

    #[tokio::test]
    async fn test_abort_fails_waiters_and_late_arrivals() {
        let events = Arc::new(CollectingEventSink::new());
        let registry = Arc::new(BarrierRegistry::default().with_events(events.clone()));
        registry.register("join", 3).unwrap();

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.arrive("join", "a").await })
        };
        wait_for_arrivals(&registry, "join", 1).await;
        registry.try_arrive("join", "b").unwrap();

        let outcome = registry.abort("join", "branch b failed");
        assert_eq!(
            outcome,
            BarrierOutcome::Failed {
                reason: "branch b failed".into()
            }
        );
        assert_eq!(waiter.await.unwrap().unwrap(), outcome);

        let late = registry.arrive("join", "c").await.unwrap();
        assert_eq!(late, outcome);
        assert_eq!(registry.status("join").unwrap().arrived_count, 2);
        assert_eq!(events.events_of_type(names::BARRIER_ABORTED).len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_barrier_is_never_aborted() {
        let registry = Arc::new(BarrierRegistry::default());
        for round in 0..200 {
            let id = format!("join-{round}");
            registry.register(&id, 2).unwrap();
            registry.try_arrive(&id, "a").unwrap();

            let arriving = {
                let registry = registry.clone();
                let id = id.clone();
                tokio::spawn(async move { registry.try_arrive(&id, "b").unwrap() })
            };
            let aborting = {
                let registry = registry.clone();
                let id = id.clone();
                tokio::spawn(async move { registry.abort(&id, "branch failed") })
            };
            let arrived = arriving.await.unwrap();
            let aborted = aborting.await.unwrap();

            let snapshot = registry.status(&id).unwrap();
            if snapshot.arrived_count == snapshot.expected_count {
                assert_eq!(snapshot.state, BarrierState::Released);
                assert_eq!(arrived, BarrierState::Released);
                assert_eq!(aborted, BarrierOutcome::Released);
            } else {
                assert_eq!(snapshot.state, BarrierState::Failed);
                assert_eq!(arrived, BarrierState::Failed);
            }
        }
    }

    #[test]
    fn test_first_decision_wins() {
        let registry = BarrierRegistry::default();
        registry.register("join", 1).unwrap();
        registry.try_arrive("join", "a").unwrap();

        assert_eq!(registry.abort("join", "too late"), BarrierOutcome::Released);
        assert_eq!(registry.timeout("join"), BarrierOutcome::Released);
    }

    #[tokio::test]
    async fn test_arrive_with_timeout_times_out_everyone() {
        let events = Arc::new(CollectingEventSink::new());
        let registry = BarrierRegistry::default().with_events(events.clone());
        registry.register("join", 2).unwrap();

        let outcome = registry
            .arrive_with_timeout("join", "a", Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(outcome, BarrierOutcome::TimedOut);
        assert_eq!(registry.try_arrive("join", "b").unwrap(), BarrierState::TimedOut);
        assert!(events.last_of_type(names::BARRIER_TIMED_OUT).is_some());
    }

    #[test]
    fn test_unknown_barrier_requires_default() {
        let registry = BarrierRegistry::default();
        let err = registry.try_arrive("missing", "a").unwrap_err();
        assert_eq!(err.code(), "BARRIER_NOT_REGISTERED");

        let registry = BarrierRegistry::new(BarrierConfig {
            default_expected_count: Some(2),
        });
        assert_eq!(registry.try_arrive("implicit", "a").unwrap(), BarrierState::Waiting);
        assert_eq!(registry.status("implicit").unwrap().expected_count, 2);
    }

    #[test]
    fn test_abort_unknown_leaves_failed_barrier() {
        let registry = BarrierRegistry::default();
        registry.abort("ghost", "cancelled");
        assert_eq!(registry.try_arrive("ghost", "a").unwrap(), BarrierState::Failed);
    }

    #[test]
    fn test_register_rejects_zero_and_keeps_existing() {
        let registry = BarrierRegistry::default();
        assert!(registry.register("join", 0).is_err());
        assert!(registry.register("join", 2).unwrap());
        assert!(!registry.register("join", 5).unwrap());
        assert_eq!(registry.status("join").unwrap().expected_count, 2);

        assert!(registry.remove("join").is_some());
        assert!(registry.is_empty());
    }
}
