//! Adviser decisions.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::machine::StepState;
use super::strategy::FallbackAction;

/// What the execution engine should do with a failed step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdviserDecision {
    /// Run the step again after a delay.
    Retry {
        /// Delay before the next attempt, in milliseconds.
        next_delay_ms: u64,
        /// Retries left after this one.
        remaining_attempts: u32,
        /// Node to roll back before retrying, if configured.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rollback_target: Option<String>,
    },
    /// Pause the step until an operator decides or the timeout elapses.
    ManualIntervention {
        /// Wait before the timeout action applies, in milliseconds.
        timeout_ms: u64,
        /// Applied if nobody intervenes in time.
        timeout_action: FallbackAction,
        /// Node to roll back before waiting, if configured.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rollback_target: Option<String>,
    },
    /// Roll back to the given node.
    Rollback {
        /// Rollback target node id.
        target_node_id: String,
    },
    /// Treat the step as succeeded.
    Ignore,
    /// Fail the step and let the failure propagate.
    Propagate,
}

impl AdviserDecision {
    /// Delay before the next attempt, for retries.
    #[must_use]
    pub fn next_delay(&self) -> Option<Duration> {
        match self {
            Self::Retry { next_delay_ms, .. } => Some(Duration::from_millis(*next_delay_ms)),
            _ => None,
        }
    }

    /// Manual intervention timeout.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        match self {
            Self::ManualIntervention { timeout_ms, .. } => Some(Duration::from_millis(*timeout_ms)),
            _ => None,
        }
    }

    /// State the step moves to when this decision is applied.
    #[must_use]
    pub fn target_state(&self) -> StepState {
        match self {
            Self::Retry { .. } => StepState::Retrying,
            Self::ManualIntervention { .. } => StepState::WaitingForInput,
            Self::Rollback { .. } => StepState::RolledBack,
            Self::Ignore => StepState::Succeeded,
            Self::Propagate => StepState::Failed,
        }
    }

    /// Short name for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Retry { .. } => "RETRY",
            Self::ManualIntervention { .. } => "MANUAL_INTERVENTION",
            Self::Rollback { .. } => "ROLLBACK",
            Self::Ignore => "IGNORE",
            Self::Propagate => "PROPAGATE",
        }
    }
}

/// A decision together with the strategy that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advice {
    /// Node the advice is for.
    pub node_id: String,
    /// The decision.
    pub decision: AdviserDecision,
    /// Categories of the matched strategy; empty when nothing matched.
    pub applicable_categories: Vec<String>,
    /// Index of the matched strategy in declaration order.
    pub strategy_index: Option<usize>,
}

impl Advice {
    /// Advice used when no strategy applies.
    #[must_use]
    pub fn unmatched(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            decision: AdviserDecision::Propagate,
            applicable_categories: Vec::new(),
            strategy_index: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_states() {
        let retry = AdviserDecision::Retry {
            next_delay_ms: 10,
            remaining_attempts: 1,
            rollback_target: None,
        };
        assert_eq!(retry.target_state(), StepState::Retrying);
        assert_eq!(retry.next_delay(), Some(Duration::from_millis(10)));
        assert_eq!(AdviserDecision::Ignore.target_state(), StepState::Succeeded);
        assert_eq!(AdviserDecision::Propagate.target_state(), StepState::Failed);
    }

    #[test]
    fn test_decision_serializes_tagged() {
        let decision = AdviserDecision::ManualIntervention {
            timeout_ms: 60_000,
            timeout_action: FallbackAction::Abort,
            rollback_target: None,
        };
        let value = serde_json::to_value(&decision).unwrap();
        assert_eq!(value["decision"], "MANUAL_INTERVENTION");
        assert_eq!(value["timeout_action"], "ABORT");
        assert!(value.get("rollback_target").is_none());
    }
}
