//! Failure handling for one plan execution.

use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

use super::decision::{Advice, AdviserDecision};
use super::intervention::{InterventionBoard, InterventionOutcome};
use super::machine::{InterventionResolution, StepState, StepStateMachine, TransitionRecord, Trigger};
use super::strategy::{FailureAdviser, StepFailure};
use crate::errors::{FlowError, FlowResult, InvalidTransitionError};
use crate::events::{emit_record, names, EventSink, NoOpEventSink};
use crate::utils::{Clock, SystemClock};

/// Tracks one [`StepStateMachine`] per node and consults the adviser on failures.
///
/// Safe to share between step-completion callbacks.
pub struct ExecutionAdviser {
    adviser: FailureAdviser,
    machines: DashMap<String, StepStateMachine>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
}

impl ExecutionAdviser {
    /// Creates an adviser for one execution.
    #[must_use]
    pub fn new(adviser: FailureAdviser) -> Self {
        Self {
            adviser,
            machines: DashMap::new(),
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

    /// Sets the clock used for transition timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Returns the underlying adviser.
    #[must_use]
    pub fn adviser(&self) -> &FailureAdviser {
        &self.adviser
    }

    /// Registers a step as running, replacing any earlier machine for the node.
    pub fn start_step(&self, node_id: &str) {
        self.machines
            .insert(node_id.to_string(), StepStateMachine::new(node_id));
    }

    /// Records a successful step.
    pub fn on_success(&self, node_id: &str) -> FlowResult<StepState> {
        self.transition(node_id, Trigger::Succeed)
    }

    /// Handles a step failure and returns the advice applied.
    ///
    /// An unknown node is started implicitly.
    pub fn on_failure<I, S>(&self, node_id: &str, categories: I) -> FlowResult<Advice>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let categories: BTreeSet<String> = categories.into_iter().map(Into::into).collect();
        let now = self.clock.now();
        let mut machine = self
            .machines
            .entry(node_id.to_string())
            .or_insert_with(|| StepStateMachine::new(node_id));

        machine.apply(Trigger::Fail, now)?;
        let failure = StepFailure {
            node_id: node_id.to_string(),
            categories,
            retries_made: machine.retries_made(),
        };
        let advice = self.adviser.advise(&failure);
        let state = machine.apply(
            Trigger::Decide {
                decision: advice.decision.clone(),
            },
            now,
        )?;
        drop(machine);

        info!(
            node_id = %node_id,
            decision = advice.decision.kind(),
            strategy_index = ?advice.strategy_index,
            state = %state,
            "Step failure advised"
        );
        emit_record(self.events.as_ref(), names::ADVISER_DECISION, &advice);
        Ok(advice)
    }

    /// Records that the retry delay elapsed and the step runs again.
    pub fn on_retry_started(&self, node_id: &str) -> FlowResult<StepState> {
        self.transition(node_id, Trigger::RetryStarted)
    }

    /// Applies operator input to a waiting step.
    pub fn on_manual_input(&self, node_id: &str, resolution: InterventionResolution) -> FlowResult<StepState> {
        self.transition(node_id, Trigger::InputReceived { resolution })
    }

    /// Applies the timeout action of a waiting step.
    ///
    /// A rollback goes to the target named by the strategy that asked for the
    /// intervention.
    pub fn on_intervention_timeout(&self, node_id: &str) -> FlowResult<StepState> {
        let decision = self
            .machines
            .get(node_id)
            .and_then(|m| m.pending_timeout_decision())
            .ok_or_else(|| {
                FlowError::from(InvalidTransitionError::new(
                    node_id,
                    self.state(node_id).map_or_else(|| "UNKNOWN".to_string(), |s| s.to_string()),
                    "timeout",
                ))
            })?;
        warn!(node_id = %node_id, decision = decision.kind(), "Manual intervention timed out");
        self.transition(node_id, Trigger::InputTimedOut { decision })
    }

    /// Blocks on the board until input arrives or the decision's timeout elapses,
    /// then applies the outcome.
    pub async fn await_intervention(
        &self,
        board: &InterventionBoard,
        node_id: &str,
        decision: &AdviserDecision,
    ) -> FlowResult<StepState> {
        let AdviserDecision::ManualIntervention {
            timeout_action,
            ..
        } = decision
        else {
            return Err(FlowError::from(InvalidTransitionError::new(
                node_id,
                decision.kind(),
                "await_intervention",
            )));
        };
        let timeout = decision.timeout().unwrap_or_default();

        match board.await_input(node_id, timeout, *timeout_action).await {
            InterventionOutcome::Resolved { resolution } => self.on_manual_input(node_id, resolution),
            InterventionOutcome::TimedOut { .. } => self.on_intervention_timeout(node_id),
            InterventionOutcome::Cancelled => self.on_manual_input(node_id, InterventionResolution::Abort),
        }
    }

    /// Returns the state of a node.
    #[must_use]
    pub fn state(&self, node_id: &str) -> Option<StepState> {
        self.machines.get(node_id).map(|m| m.state())
    }

    /// Returns the transition history of a node.
    #[must_use]
    pub fn history(&self, node_id: &str) -> Vec<TransitionRecord> {
        self.machines
            .get(node_id)
            .map(|m| m.history().to_vec())
            .unwrap_or_default()
    }

    /// Returns the number of tracked nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.machines.len()
    }

    /// Returns true if no node is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    fn transition(&self, node_id: &str, trigger: Trigger) -> FlowResult<StepState> {
        let now = self.clock.now();
        let mut machine = self.machines.get_mut(node_id).ok_or_else(|| {
            FlowError::from(InvalidTransitionError::new(node_id, "UNKNOWN", format!("{trigger:?}")))
        })?;
        Ok(machine.apply(trigger, now)?)
    }
}

impl std::fmt::Debug for ExecutionAdviser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionAdviser")
            .field("strategies", &self.adviser.strategies().len())
            .field("nodes", &self.machines.len())
            .finish_non_exhaustive()
    }
}
