//! Barrier state and outcomes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::errors::{FlowError, FlowResult};
use crate::utils::Timestamp;

/// Barrier lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BarrierState {
    /// Collecting arrivals.
    Waiting,
    /// Every participant arrived.
    Released,
    /// Aborted.
    Failed,
    /// Timed out before every participant arrived.
    TimedOut,
}

impl BarrierState {
    /// Returns true once the barrier is decided.
    #[must_use]
    pub fn is_decided(self) -> bool {
        self != Self::Waiting
    }
}

/// Final outcome delivered to every participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BarrierOutcome {
    /// Every participant arrived.
    Released,
    /// The barrier was aborted.
    Failed {
        /// Abort reason.
        reason: String,
    },
    /// The barrier timed out.
    TimedOut,
}

impl BarrierOutcome {
    /// Returns the matching state.
    #[must_use]
    pub fn state(&self) -> BarrierState {
        match self {
            Self::Released => BarrierState::Released,
            Self::Failed { .. } => BarrierState::Failed,
            Self::TimedOut => BarrierState::TimedOut,
        }
    }

    /// Converts to a step result for the participant.
    pub fn into_result(self, barrier_id: &str) -> FlowResult<()> {
        match self {
            Self::Released => Ok(()),
            Self::Failed { reason } => Err(FlowError::BarrierAborted {
                barrier_id: barrier_id.to_string(),
                reason,
            }),
            Self::TimedOut => Err(FlowError::BarrierTimedOut(barrier_id.to_string())),
        }
    }
}

/// Point-in-time view of a barrier; also the audit record of a decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierSnapshot {
    /// Barrier id.
    pub barrier_id: String,
    /// Participants required for release.
    pub expected_count: usize,
    /// Distinct participants arrived.
    pub arrived_count: usize,
    /// Current state.
    pub state: BarrierState,
    /// Participant ids that arrived.
    pub arrivals: BTreeSet<String>,
    /// Abort reason, if aborted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// When the barrier was decided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<Timestamp>,
}
