//! Step failure handling.
//!
//! A [`FailureAdviser`] holds the ordered strategy list of a plan and maps a
//! failed step to an [`AdviserDecision`]; the first strategy whose categories
//! intersect the failure's categories wins. [`ExecutionAdviser`] tracks the
//! state machine of each step of one execution.

mod decision;
mod execution;
mod intervention;
mod machine;
mod strategy;

pub use decision::{Advice, AdviserDecision};
pub use execution::ExecutionAdviser;
pub use intervention::{InterventionBoard, InterventionOutcome};
pub use machine::{InterventionResolution, StepState, StepStateMachine, TransitionRecord, Trigger};
pub use strategy::{
    fallback_decision, intervention_timeout, wait_interval, FailureAction, FailureAdviser, FailureStrategy,
    FallbackAction, StepFailure, ALL_ERRORS, DEFAULT_INTERVENTION_TIMEOUT_MS, MIN_INTERVENTION_TIMEOUT_MS,
};
