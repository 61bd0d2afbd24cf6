//! Manual intervention board.
//!
//! A step waiting for input registers here and blocks until an operator
//! submits a resolution or the timeout elapses.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

use super::machine::InterventionResolution;
use super::strategy::FallbackAction;

/// How a wait for manual input ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InterventionOutcome {
    /// An operator resolved the step.
    Resolved {
        /// The resolution.
        resolution: InterventionResolution,
    },
    /// Nobody intervened; the fallback applies.
    TimedOut {
        /// The fallback.
        action: FallbackAction,
    },
    /// The wait was cancelled or superseded.
    Cancelled,
}

#[derive(Debug)]
struct PendingIntervention {
    ticket: u64,
    waiting_since: Instant,
    timeout: Duration,
    response_tx: Option<oneshot::Sender<InterventionResolution>>,
}

/// Open manual interventions keyed by node id.
#[derive(Default)]
pub struct InterventionBoard {
    pending: RwLock<HashMap<String, PendingIntervention>>,
    next_ticket: AtomicU64,
}

impl InterventionBoard {
    /// Creates an empty board.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for input on `node_id`.
    ///
    /// A second wait on the same node supersedes the first, which returns `Cancelled`.
    pub async fn await_input(
        &self,
        node_id: &str,
        timeout: Duration,
        on_timeout: FallbackAction,
    ) -> InterventionOutcome {
        let (tx, rx) = oneshot::channel();
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        self.pending.write().insert(
            node_id.to_string(),
            PendingIntervention {
                ticket,
                waiting_since: Instant::now(),
                timeout,
                response_tx: Some(tx),
            },
        );

        let outcome = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resolution)) => InterventionOutcome::Resolved { resolution },
            Ok(Err(_)) => InterventionOutcome::Cancelled,
            Err(_) => InterventionOutcome::TimedOut { action: on_timeout },
        };

        let mut pending = self.pending.write();
        if pending.get(node_id).is_some_and(|p| p.ticket == ticket) {
            pending.remove(node_id);
        }
        outcome
    }

    /// Resolves a waiting step. Returns false if nothing is waiting on `node_id`.
    pub fn submit(&self, node_id: &str, resolution: InterventionResolution) -> bool {
        if let Some(mut request) = self.pending.write().remove(node_id) {
            if let Some(tx) = request.response_tx.take() {
                return tx.send(resolution).is_ok();
            }
        }
        false
    }

    /// Cancels a wait.
    pub fn cancel(&self, node_id: &str) -> bool {
        self.pending.write().remove(node_id).is_some()
    }

    /// Returns true if `node_id` is waiting.
    #[must_use]
    pub fn is_waiting(&self, node_id: &str) -> bool {
        self.pending.read().contains_key(node_id)
    }

    /// Returns the number of waiting steps.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.read().len()
    }

    /// Lists waiting node ids with the time left before their timeout.
    #[must_use]
    pub fn pending_nodes(&self) -> Vec<(String, Duration)> {
        let mut nodes: Vec<(String, Duration)> = self
            .pending
            .read()
            .iter()
            .map(|(id, p)| (id.clone(), p.timeout.saturating_sub(p.waiting_since.elapsed())))
            .collect();
        nodes.sort_by(|a, b| a.0.cmp(&b.0));
        nodes
    }
}

impl std::fmt::Debug for InterventionBoard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterventionBoard")
            .field("pending_count", &self.pending_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn wait_until_waiting(board: &InterventionBoard, node_id: &str) {
        while !board.is_waiting(node_id) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test]
    async fn test_submit_resolves_wait() {
        let board = Arc::new(InterventionBoard::new());
        let handle = {
            let board = board.clone();
            tokio::spawn(async move {
                board
                    .await_input("deploy", Duration::from_secs(5), FallbackAction::Abort)
                    .await
            })
        };

        wait_until_waiting(&board, "deploy").await;
        assert_eq!(board.pending_nodes().len(), 1);
        assert!(board.submit("deploy", InterventionResolution::Retry));

        let outcome = handle.await.unwrap();
        assert_eq!(
            outcome,
            InterventionOutcome::Resolved {
                resolution: InterventionResolution::Retry
            }
        );
        assert_eq!(board.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_applies_fallback() {
        let board = InterventionBoard::new();
        let outcome = board
            .await_input("deploy", Duration::from_millis(10), FallbackAction::Ignore)
            .await;
        assert_eq!(
            outcome,
            InterventionOutcome::TimedOut {
                action: FallbackAction::Ignore
            }
        );
        assert!(!board.is_waiting("deploy"));
    }

    #[tokio::test]
    async fn test_cancel_ends_wait() {
        let board = Arc::new(InterventionBoard::new());
        let handle = {
            let board = board.clone();
            tokio::spawn(async move {
                board
                    .await_input("deploy", Duration::from_secs(5), FallbackAction::Abort)
                    .await
            })
        };

        wait_until_waiting(&board, "deploy").await;
        assert!(board.cancel("deploy"));
        assert_eq!(handle.await.unwrap(), InterventionOutcome::Cancelled);
    }

    #[test]
    fn test_submit_without_waiter() {
        let board = InterventionBoard::new();
        assert!(!board.submit("nobody", InterventionResolution::Abort));
    }
}
