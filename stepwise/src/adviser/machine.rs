//! Per-step failure handling state machine.
//!
//! ```text
//! RUNNING --fail--> ADVISING --retry--> RETRYING --retry started--> RUNNING
//!                       |--manual intervention--> WAITING_FOR_INPUT --input/timeout--> ...
//!                       |--rollback / ignore / propagate--> ROLLED_BACK / SUCCEEDED / FAILED
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use super::decision::AdviserDecision;
use super::strategy::{fallback_decision, FallbackAction};
use crate::errors::InvalidTransitionError;
use crate::utils::Timestamp;

/// Step lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepState {
    /// Executing.
    Running,
    /// Failed; a decision is being made.
    Advising,
    /// Waiting for the retry delay.
    Retrying,
    /// Waiting for an operator.
    WaitingForInput,
    /// Finished successfully (or the failure was ignored).
    Succeeded,
    /// Finished with a propagated failure.
    Failed,
    /// Rolled back.
    RolledBack,
}

impl StepState {
    /// Returns true for states with no outgoing transitions.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::RolledBack)
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Running => "RUNNING",
            Self::Advising => "ADVISING",
            Self::Retrying => "RETRYING",
            Self::WaitingForInput => "WAITING_FOR_INPUT",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::RolledBack => "ROLLED_BACK",
        };
        f.write_str(name)
    }
}

/// Operator input for a step waiting on manual intervention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterventionResolution {
    /// Run the step again.
    Retry,
    /// Skip the failure.
    Ignore,
    /// Record the step as succeeded.
    MarkSuccess,
    /// Fail the step.
    Abort,
    /// Roll the step back.
    Rollback,
}

impl InterventionResolution {
    fn target_state(self) -> StepState {
        match self {
            Self::Retry => StepState::Running,
            Self::Ignore | Self::MarkSuccess => StepState::Succeeded,
            Self::Abort => StepState::Failed,
            Self::Rollback => StepState::RolledBack,
        }
    }
}

/// What caused a transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "trigger", rename_all = "snake_case")]
pub enum Trigger {
    /// The step failed.
    Fail,
    /// The step completed.
    Succeed,
    /// The adviser decided.
    Decide {
        /// The decision.
        decision: AdviserDecision,
    },
    /// The retry delay elapsed and the step runs again.
    RetryStarted,
    /// An operator resolved the intervention.
    InputReceived {
        /// The resolution.
        resolution: InterventionResolution,
    },
    /// Nobody intervened in time.
    InputTimedOut {
        /// The fallback decision applied.
        decision: AdviserDecision,
    },
}

impl Trigger {
    fn label(&self) -> String {
        match self {
            Self::Fail => "fail".to_string(),
            Self::Succeed => "succeed".to_string(),
            Self::Decide { decision } => format!("decide:{}", decision.kind()),
            Self::RetryStarted => "retry_started".to_string(),
            Self::InputReceived { resolution } => format!("input:{resolution:?}"),
            Self::InputTimedOut { decision } => format!("timeout:{}", decision.kind()),
        }
    }
}

/// Audit entry for one transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// State before.
    pub from: StepState,
    /// State after.
    pub to: StepState,
    /// Cause.
    pub trigger: Trigger,
    /// When it happened.
    pub at: Timestamp,
}

/// Failure handling state of one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepStateMachine {
    node_id: String,
    state: StepState,
    retries_made: u32,
    pending_timeout_action: Option<FallbackAction>,
    pending_rollback_target: Option<String>,
    history: Vec<TransitionRecord>,
}

impl StepStateMachine {
    /// Creates a machine in `Running`.
    #[must_use]
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            state: StepState::Running,
            retries_made: 0,
            pending_timeout_action: None,
            pending_rollback_target: None,
            history: Vec::new(),
        }
    }

    /// Returns the node id.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> StepState {
        self.state
    }

    /// Returns the number of retries started.
    #[must_use]
    pub fn retries_made(&self) -> u32 {
        self.retries_made
    }

    /// Returns the action applied if a pending intervention times out.
    #[must_use]
    pub fn pending_timeout_action(&self) -> Option<FallbackAction> {
        self.pending_timeout_action
    }

    /// Returns the rollback target of the strategy that requested the pending intervention.
    #[must_use]
    pub fn pending_rollback_target(&self) -> Option<&str> {
        self.pending_rollback_target.as_deref()
    }

    /// Returns the decision applied if the pending intervention times out.
    #[must_use]
    pub fn pending_timeout_decision(&self) -> Option<AdviserDecision> {
        self.pending_timeout_action
            .map(|action| fallback_decision(action, self.pending_rollback_target.clone()))
    }

    /// Returns the transition history.
    #[must_use]
    pub fn history(&self) -> &[TransitionRecord] {
        &self.history
    }

    /// Applies a trigger, returning the new state.
    pub fn apply(&mut self, trigger: Trigger, at: Timestamp) -> Result<StepState, InvalidTransitionError> {
        let next = match (self.state, &trigger) {
            (StepState::Running, Trigger::Fail) => StepState::Advising,
            (StepState::Running, Trigger::Succeed) => StepState::Succeeded,
            (StepState::Advising, Trigger::Decide { decision }) => decision.target_state(),
            (StepState::Retrying, Trigger::RetryStarted) => StepState::Running,
            (StepState::WaitingForInput, Trigger::InputReceived { resolution }) => resolution.target_state(),
            (StepState::WaitingForInput, Trigger::InputTimedOut { decision }) => match decision.target_state() {
                // A timed out intervention never waits again.
                StepState::WaitingForInput | StepState::Retrying => StepState::Failed,
                other => other,
            },
            (from, trigger) => {
                return Err(InvalidTransitionError::new(&self.node_id, from.to_string(), trigger.label()));
            }
        };

        match &trigger {
            Trigger::Decide {
                decision:
                    AdviserDecision::ManualIntervention {
                        timeout_action,
                        rollback_target,
                        ..
                    },
            } => {
                self.pending_timeout_action = Some(*timeout_action);
                self.pending_rollback_target.clone_from(rollback_target);
            }
            Trigger::RetryStarted => self.retries_made += 1,
            Trigger::InputReceived {
                resolution: InterventionResolution::Retry,
            } => {
                self.clear_pending();
                self.retries_made = 0;
            }
            Trigger::InputReceived { .. } | Trigger::InputTimedOut { .. } => self.clear_pending(),
            _ => {}
        }

        self.history.push(TransitionRecord {
            from: self.state,
            to: next,
            trigger,
            at,
        });
        self.state = next;
        Ok(next)
    }

    fn clear_pending(&mut self) {
        self.pending_timeout_action = None;
        self.pending_rollback_target = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn retry_decision() -> AdviserDecision {
        AdviserDecision::Retry {
            next_delay_ms: 0,
            remaining_attempts: 1,
            rollback_target: None,
        }
    }

    #[test]
    fn test_retry_cycle() {
        let mut machine = StepStateMachine::new("build");
        let now = Utc::now();

        assert_eq!(machine.apply(Trigger::Fail, now).unwrap(), StepState::Advising);
        assert_eq!(
            machine.apply(Trigger::Decide { decision: retry_decision() }, now).unwrap(),
            StepState::Retrying
        );
        assert_eq!(machine.apply(Trigger::RetryStarted, now).unwrap(), StepState::Running);
        assert_eq!(machine.retries_made(), 1);
        assert_eq!(machine.apply(Trigger::Succeed, now).unwrap(), StepState::Succeeded);
        assert!(machine.state().is_terminal());
        assert_eq!(machine.history().len(), 4);
    }

    #[test]
    fn test_manual_intervention_input() {
        let mut machine = StepStateMachine::new("approve");
        let now = Utc::now();
        machine.apply(Trigger::Fail, now).unwrap();
        machine
            .apply(
                Trigger::Decide {
                    decision: AdviserDecision::ManualIntervention {
                        timeout_ms: 60_000,
                        timeout_action: FallbackAction::Ignore,
                        rollback_target: None,
                    },
                },
                now,
            )
            .unwrap();
        assert_eq!(machine.state(), StepState::WaitingForInput);
        assert_eq!(machine.pending_timeout_action(), Some(FallbackAction::Ignore));

        let state = machine
            .apply(
                Trigger::InputReceived {
                    resolution: InterventionResolution::Rollback,
                },
                now,
            )
            .unwrap();
        assert_eq!(state, StepState::RolledBack);
        assert_eq!(machine.pending_timeout_action(), None);
    }

    #[test]
    fn test_pending_timeout_decision_uses_intervention_target() {
        let mut machine = StepStateMachine::new("deploy");
        let now = Utc::now();
        machine.apply(Trigger::Fail, now).unwrap();
        machine
            .apply(
                Trigger::Decide {
                    decision: AdviserDecision::ManualIntervention {
                        timeout_ms: 60_000,
                        timeout_action: FallbackAction::Rollback,
                        rollback_target: Some("provision".into()),
                    },
                },
                now,
            )
            .unwrap();
        assert_eq!(machine.pending_rollback_target(), Some("provision"));
        assert_eq!(
            machine.pending_timeout_decision(),
            Some(AdviserDecision::Rollback {
                target_node_id: "provision".into()
            })
        );

        let decision = machine.pending_timeout_decision().unwrap();
        machine.apply(Trigger::InputTimedOut { decision }, now).unwrap();
        assert_eq!(machine.state(), StepState::RolledBack);
        assert_eq!(machine.pending_rollback_target(), None);
        assert_eq!(machine.pending_timeout_decision(), None);
    }

    #[test]
    fn test_timeout_never_waits_again() {
        let mut machine = StepStateMachine::new("approve");
        let now = Utc::now();
        machine.apply(Trigger::Fail, now).unwrap();
        machine
            .apply(
                Trigger::Decide {
                    decision: AdviserDecision::ManualIntervention {
                        timeout_ms: 60_000,
                        timeout_action: FallbackAction::ManualIntervention,
                        rollback_target: None,
                    },
                },
                now,
            )
            .unwrap();

        let state = machine
            .apply(
                Trigger::InputTimedOut {
                    decision: AdviserDecision::ManualIntervention {
                        timeout_ms: 60_000,
                        timeout_action: FallbackAction::Abort,
                        rollback_target: None,
                    },
                },
                now,
            )
            .unwrap();
        assert_eq!(state, StepState::Failed);
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let mut machine = StepStateMachine::new("build");
        let now = Utc::now();
        machine.apply(Trigger::Succeed, now).unwrap();

        let err = machine.apply(Trigger::Fail, now).unwrap_err();
        assert_eq!(err.from, "SUCCEEDED");
        assert_eq!(err.to, "fail");
        assert_eq!(machine.state(), StepState::Succeeded);
        assert_eq!(machine.history().len(), 1);
    }

    #[test]
    fn test_decision_requires_advising() {
        let mut machine = StepStateMachine::new("build");
        let err = machine
            .apply(Trigger::Decide { decision: retry_decision() }, Utc::now())
            .unwrap_err();
        assert_eq!(err.from, "RUNNING");
    }
}
