//! Test fixtures wiring the in-memory backends together.

use std::sync::Arc;
use std::time::Duration;

use crate::config::QueueConfig;
use crate::events::CollectingEventSink;
use crate::queue::{InMemoryLeaseStore, WorkQueue};
use crate::utils::ManualClock;

/// A work queue over an in-memory store with a manual clock.
#[derive(Debug, Clone)]
pub struct TestQueue {
    /// Backing store, for outage injection and inspection.
    pub store: Arc<InMemoryLeaseStore>,
    /// Clock driving lease expiry and visibility.
    pub clock: Arc<ManualClock>,
    /// The queue under test.
    pub queue: Arc<WorkQueue>,
    /// Collected events.
    pub events: Arc<CollectingEventSink>,
}

impl TestQueue {
    /// Creates a fixture with the given configuration.
    #[must_use]
    pub fn new(config: QueueConfig) -> Self {
        let store = Arc::new(InMemoryLeaseStore::new());
        let clock = Arc::new(ManualClock::starting_now());
        let queue = Arc::new(WorkQueue::new(store.clone(), config).with_clock(clock.clone()));
        Self {
            store,
            clock,
            queue,
            events: Arc::new(CollectingEventSink::new()),
        }
    }

    /// Creates a fixture with short timings suitable for tests.
    #[must_use]
    pub fn fast() -> Self {
        Self::new(
            QueueConfig::new("steps", "step_queue")
                .with_lease_duration(Duration::from_secs(30))
                .with_claim_wait(Duration::from_millis(20), Duration::from_millis(5))
                .with_store_backoff(Duration::from_millis(5)),
        )
    }

    /// Advances the clock.
    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{CountFilter, EnqueueOptions};

    #[tokio::test]
    async fn test_fixture_shares_store() {
        let fixture = TestQueue::fast();
        fixture
            .queue
            .enqueue(&serde_json::json!({ "step": 1 }), EnqueueOptions::new())
            .await
            .unwrap();

        assert_eq!(fixture.store.total_items(), 1);
        assert_eq!(fixture.queue.count(CountFilter::All).await.unwrap(), 1);
    }
}
