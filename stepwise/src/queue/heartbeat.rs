//! Background lease renewal for claimed items.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::item::RenewOutcome;
use super::work_queue::WorkQueue;
use crate::cancellation::CancellationToken;
use crate::events::{names, EventSink};
use crate::utils::Timestamp;

/// Renews a lease periodically until dropped.
///
/// If the store reports the lease as taken over, or renewals keep failing
/// until the lease has run out, the guard cancels its
/// [`HeartbeatGuard::lease_lost`] token and stops renewing.
#[derive(Debug)]
pub struct HeartbeatGuard {
    handle: JoinHandle<()>,
    lease_lost: Arc<CancellationToken>,
}

impl HeartbeatGuard {
    /// Starts renewing the lease on `item_id` held under `token` until `lease_until`.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(
        queue: Arc<WorkQueue>,
        item_id: String,
        token: Uuid,
        lease_until: Timestamp,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let lease_lost = Arc::new(CancellationToken::new());
        let signal = lease_lost.clone();
        let interval = queue.config().heartbeat_interval();
        let retry = queue.config().store_backoff().min(interval);

        let handle = tokio::spawn(async move {
            let mut lease_until = lease_until;
            let mut next = interval;
            loop {
                tokio::time::sleep(next).await;
                match queue.renew_lease_with_token(&item_id, token).await {
                    Ok(RenewOutcome::Renewed(until)) => {
                        debug!(item_id = %item_id, lease_reset_at = %until, "Lease renewed");
                        lease_until = until;
                        next = interval;
                    }
                    Ok(RenewOutcome::Missing) => {
                        debug!(item_id = %item_id, "Heartbeat stopped; item no longer exists");
                        break;
                    }
                    Ok(RenewOutcome::Lost) => {
                        warn!(item_id = %item_id, queue = %queue.config().name, "Lease lost to another worker");
                        report_lost(&queue, &item_id, events.as_ref(), &signal);
                        break;
                    }
                    Err(e) if queue.now() >= lease_until => {
                        warn!(item_id = %item_id, error = %e, "Lease expired while the store was unavailable");
                        report_lost(&queue, &item_id, events.as_ref(), &signal);
                        break;
                    }
                    Err(e) => {
                        warn!(
                            item_id = %item_id,
                            error = %e,
                            retry_ms = u64::try_from(retry.as_millis()).unwrap_or(u64::MAX),
                            "Lease renewal failed; retrying"
                        );
                        next = retry;
                    }
                }
            }
        });

        Self { handle, lease_lost }
    }

    /// Token cancelled when the lease is lost.
    #[must_use]
    pub fn lease_lost(&self) -> &Arc<CancellationToken> {
        &self.lease_lost
    }
}

fn report_lost(queue: &WorkQueue, item_id: &str, events: &dyn EventSink, signal: &CancellationToken) {
    events.try_emit(
        names::QUEUE_LEASE_LOST,
        Some(serde_json::json!({
            "item_id": item_id,
            "queue": queue.config().name,
        })),
    );
    signal.cancel(format!("lease on {item_id} lost"));
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
