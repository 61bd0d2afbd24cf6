//! Failure strategies and the adviser that selects among them.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use super::decision::{Advice, AdviserDecision};
use crate::errors::{FlowError, FlowResult};

/// Category matching every failure.
pub const ALL_ERRORS: &str = "ALL_ERRORS";

/// Shortest manual intervention timeout honoured, in milliseconds.
pub const MIN_INTERVENTION_TIMEOUT_MS: u64 = 60_000;

/// Timeout used when none (or a too short one) is configured: 14 days.
pub const DEFAULT_INTERVENTION_TIMEOUT_MS: u64 = 14 * 24 * 60 * 60 * 1000;

/// Action applied when retries run out or an intervention times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FallbackAction {
    /// Fail the step.
    #[default]
    Abort,
    /// Treat the step as succeeded.
    Ignore,
    /// Roll back to the configured target.
    Rollback,
    /// Wait for an operator with the default timeout.
    ManualIntervention,
}

/// Configured reaction to a matching failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureAction {
    /// Retry with per-attempt wait intervals.
    Retry {
        /// Maximum number of retries.
        retry_count: u32,
        /// Wait before retry *k*; the last value is reused past the end.
        #[serde(default)]
        wait_intervals_ms: Vec<u64>,
        /// Applied once retries are exhausted.
        #[serde(default)]
        on_retry_failure: FallbackAction,
    },
    /// Wait for manual input.
    ManualIntervention {
        /// Wait before `on_timeout` applies.
        #[serde(default)]
        timeout_ms: Option<u64>,
        /// Applied if nobody intervenes in time.
        #[serde(default)]
        on_timeout: FallbackAction,
    },
    /// Roll back immediately.
    Rollback,
    /// Ignore the failure.
    Ignore,
    /// Fail the step.
    Abort,
}

/// One entry of the ordered strategy list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureStrategy {
    /// Failure categories this strategy applies to.
    pub applicable_failure_categories: BTreeSet<String>,
    /// What to do.
    pub action: FailureAction,
    /// Rollback target per failing node id.
    #[serde(default)]
    pub rollback_targets_by_node_id: HashMap<String, String>,
}

impl FailureStrategy {
    /// Creates a strategy for the given categories.
    #[must_use]
    pub fn new<I, S>(categories: I, action: FailureAction) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            applicable_failure_categories: categories.into_iter().map(Into::into).collect(),
            action,
            rollback_targets_by_node_id: HashMap::new(),
        }
    }

    /// Adds a rollback target for a node.
    #[must_use]
    pub fn with_rollback_target(mut self, node_id: impl Into<String>, target: impl Into<String>) -> Self {
        self.rollback_targets_by_node_id.insert(node_id.into(), target.into());
        self
    }

    /// Returns true if any failure category is covered.
    #[must_use]
    pub fn applies_to(&self, categories: &BTreeSet<String>) -> bool {
        self.applicable_failure_categories
            .iter()
            .any(|c| c == ALL_ERRORS || categories.contains(c))
    }

    fn validate(&self, index: usize) -> FlowResult<()> {
        if self.applicable_failure_categories.is_empty() {
            return Err(FlowError::Config(format!("strategy {index} has no failure categories")));
        }
        if let FailureAction::ManualIntervention {
            on_timeout: FallbackAction::ManualIntervention,
            ..
        } = self.action
        {
            return Err(FlowError::Config(format!(
                "strategy {index} cannot fall back to manual intervention on timeout"
            )));
        }
        Ok(())
    }
}

/// Wait before retry `attempt` (0-based).
#[must_use]
pub fn wait_interval(intervals_ms: &[u64], attempt: u32) -> Duration {
    let index = (attempt as usize).min(intervals_ms.len().saturating_sub(1));
    Duration::from_millis(intervals_ms.get(index).copied().unwrap_or(0))
}

/// Effective manual intervention timeout.
#[must_use]
pub fn intervention_timeout(configured_ms: Option<u64>) -> Duration {
    match configured_ms {
        Some(ms) if ms >= MIN_INTERVENTION_TIMEOUT_MS => Duration::from_millis(ms),
        _ => Duration::from_millis(DEFAULT_INTERVENTION_TIMEOUT_MS),
    }
}

/// A step failure presented to the adviser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    /// Failing node id.
    pub node_id: String,
    /// Failure categories.
    pub categories: BTreeSet<String>,
    /// Retries already made for this node.
    #[serde(default)]
    pub retries_made: u32,
}

impl StepFailure {
    /// Creates a failure on its first attempt.
    #[must_use]
    pub fn new<I, S>(node_id: impl Into<String>, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            node_id: node_id.into(),
            categories: categories.into_iter().map(Into::into).collect(),
            retries_made: 0,
        }
    }

    /// Sets the number of retries already made.
    #[must_use]
    pub fn with_retries_made(mut self, retries: u32) -> Self {
        self.retries_made = retries;
        self
    }
}

/// Picks the first applicable strategy for a failure and turns it into a decision.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct FailureAdviser {
    strategies: Vec<FailureStrategy>,
}

impl FailureAdviser {
    /// Creates an adviser from an ordered strategy list.
    pub fn new(strategies: Vec<FailureStrategy>) -> FlowResult<Self> {
        for (index, strategy) in strategies.iter().enumerate() {
            strategy.validate(index)?;
        }
        Ok(Self { strategies })
    }

    /// Parses an ordered strategy list from JSON.
    pub fn from_json_str(json: &str) -> FlowResult<Self> {
        let strategies: Vec<FailureStrategy> = serde_json::from_str(json)?;
        Self::new(strategies)
    }

    /// Returns the strategies in declaration order.
    #[must_use]
    pub fn strategies(&self) -> &[FailureStrategy] {
        &self.strategies
    }

    /// Returns the first strategy applying to the categories.
    #[must_use]
    pub fn select(&self, categories: &BTreeSet<String>) -> Option<(usize, &FailureStrategy)> {
        self.strategies.iter().enumerate().find(|(_, s)| s.applies_to(categories))
    }

    /// Decides what to do with a failed step.
    #[must_use]
    pub fn advise(&self, failure: &StepFailure) -> Advice {
        let Some((index, strategy)) = self.select(&failure.categories) else {
            return Advice::unmatched(&failure.node_id);
        };
        let rollback_target = strategy.rollback_targets_by_node_id.get(&failure.node_id).cloned();

        let decision = match &strategy.action {
            FailureAction::Retry {
                retry_count,
                wait_intervals_ms,
                on_retry_failure,
            } => {
                if failure.retries_made < *retry_count {
                    let next_delay = wait_interval(wait_intervals_ms, failure.retries_made);
                    AdviserDecision::Retry {
                        next_delay_ms: u64::try_from(next_delay.as_millis()).unwrap_or(u64::MAX),
                        remaining_attempts: retry_count - failure.retries_made - 1,
                        rollback_target,
                    }
                } else {
                    fallback_decision(*on_retry_failure, rollback_target)
                }
            }
            FailureAction::ManualIntervention { timeout_ms, on_timeout } => AdviserDecision::ManualIntervention {
                timeout_ms: u64::try_from(intervention_timeout(*timeout_ms).as_millis()).unwrap_or(u64::MAX),
                timeout_action: *on_timeout,
                rollback_target,
            },
            FailureAction::Rollback => fallback_decision(FallbackAction::Rollback, rollback_target),
            FailureAction::Ignore => AdviserDecision::Ignore,
            FailureAction::Abort => AdviserDecision::Propagate,
        };

        Advice {
            node_id: failure.node_id.clone(),
            decision,
            applicable_categories: strategy.applicable_failure_categories.iter().cloned().collect(),
            strategy_index: Some(index),
        }
    }
}

/// Maps a fallback action to a decision; a rollback without target propagates.
#[must_use]
pub fn fallback_decision(action: FallbackAction, rollback_target: Option<String>) -> AdviserDecision {
    match action {
        FallbackAction::Abort => AdviserDecision::Propagate,
        FallbackAction::Ignore => AdviserDecision::Ignore,
        FallbackAction::Rollback => match rollback_target {
            Some(target_node_id) => AdviserDecision::Rollback { target_node_id },
            None => AdviserDecision::Propagate,
        },
        FallbackAction::ManualIntervention => AdviserDecision::ManualIntervention {
            timeout_ms: DEFAULT_INTERVENTION_TIMEOUT_MS,
            timeout_action: FallbackAction::Abort,
            rollback_target,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn retry(count: u32, intervals: &[u64], fallback: FallbackAction) -> FailureAction {
        FailureAction::Retry {
            retry_count: count,
            wait_intervals_ms: intervals.to_vec(),
            on_retry_failure: fallback,
        }
    }

    #[test]
    fn test_first_matching_strategy_wins() {
        let adviser = FailureAdviser::new(vec![
            FailureStrategy::new(["TIMEOUT", "CONNECTIVITY"], retry(2, &[1000], FallbackAction::Abort)),
            FailureStrategy::new(["VERIFICATION"], FailureAction::Ignore),
            FailureStrategy::new(["TIMEOUT"], FailureAction::Abort),
        ])
        .unwrap();

        let advice = adviser.advise(&StepFailure::new("deploy", ["TIMEOUT"]));
        assert_eq!(advice.strategy_index, Some(0));
        assert!(matches!(advice.decision, AdviserDecision::Retry { .. }));
        assert_eq!(advice.applicable_categories, vec!["CONNECTIVITY", "TIMEOUT"]);
    }

    #[test]
    fn test_no_match_propagates() {
        let adviser = FailureAdviser::new(vec![FailureStrategy::new(["TIMEOUT"], FailureAction::Ignore)]).unwrap();
        let advice = adviser.advise(&StepFailure::new("deploy", ["AUTHENTICATION"]));
        assert_eq!(advice, Advice::unmatched("deploy"));
    }

    #[test]
    fn test_all_errors_matches_anything() {
        let adviser = FailureAdviser::new(vec![FailureStrategy::new([ALL_ERRORS], FailureAction::Ignore)]).unwrap();
        let advice = adviser.advise(&StepFailure::new("deploy", ["ANYTHING"]));
        assert_eq!(advice.decision, AdviserDecision::Ignore);
    }

    #[test]
    fn test_wait_interval_reuses_last_value() {
        assert_eq!(wait_interval(&[100, 200], 0), Duration::from_millis(100));
        assert_eq!(wait_interval(&[100, 200], 1), Duration::from_millis(200));
        assert_eq!(wait_interval(&[100, 200], 5), Duration::from_millis(200));
        assert_eq!(wait_interval(&[], 3), Duration::ZERO);
    }

    #[test]
    fn test_retry_counts_down_then_falls_back() {
        let adviser = FailureAdviser::new(vec![FailureStrategy::new(
            ["TIMEOUT"],
            retry(2, &[500, 1500], FallbackAction::Ignore),
        )])
        .unwrap();

        let first = adviser.advise(&StepFailure::new("n", ["TIMEOUT"]));
        assert_eq!(
            first.decision,
            AdviserDecision::Retry {
                next_delay_ms: 500,
                remaining_attempts: 1,
                rollback_target: None
            }
        );

        let second = adviser.advise(&StepFailure::new("n", ["TIMEOUT"]).with_retries_made(1));
        assert_eq!(
            second.decision,
            AdviserDecision::Retry {
                next_delay_ms: 1500,
                remaining_attempts: 0,
                rollback_target: None
            }
        );

        let exhausted = adviser.advise(&StepFailure::new("n", ["TIMEOUT"]).with_retries_made(2));
        assert_eq!(exhausted.decision, AdviserDecision::Ignore);
    }

    #[test]
    fn test_short_intervention_timeout_uses_default() {
        assert_eq!(
            intervention_timeout(Some(30_000)),
            Duration::from_millis(DEFAULT_INTERVENTION_TIMEOUT_MS)
        );
        assert_eq!(intervention_timeout(Some(60_000)), Duration::from_secs(60));
        assert_eq!(
            intervention_timeout(None),
            Duration::from_millis(DEFAULT_INTERVENTION_TIMEOUT_MS)
        );
    }

    #[test]
    fn test_manual_intervention_decision() {
        let adviser = FailureAdviser::new(vec![FailureStrategy::new(
            ["APPROVAL"],
            FailureAction::ManualIntervention {
                timeout_ms: Some(120_000),
                on_timeout: FallbackAction::Rollback,
            },
        )
        .with_rollback_target("deploy", "provision")])
        .unwrap();

        let advice = adviser.advise(&StepFailure::new("deploy", ["APPROVAL"]));
        assert_eq!(
            advice.decision,
            AdviserDecision::ManualIntervention {
                timeout_ms: 120_000,
                timeout_action: FallbackAction::Rollback,
                rollback_target: Some("provision".into())
            }
        );
    }

    #[test]
    fn test_rollback_without_target_propagates() {
        let adviser = FailureAdviser::new(vec![
            FailureStrategy::new(["VERIFICATION"], FailureAction::Rollback).with_rollback_target("deploy", "provision"),
        ])
        .unwrap();

        let with_target = adviser.advise(&StepFailure::new("deploy", ["VERIFICATION"]));
        assert_eq!(
            with_target.decision,
            AdviserDecision::Rollback {
                target_node_id: "provision".into()
            }
        );

        let without_target = adviser.advise(&StepFailure::new("smoke-test", ["VERIFICATION"]));
        assert_eq!(without_target.decision, AdviserDecision::Propagate);
    }

    #[test]
    fn test_retry_exhaustion_can_escalate_to_manual_intervention() {
        let adviser = FailureAdviser::new(vec![FailureStrategy::new(
            ["TIMEOUT"],
            retry(0, &[], FallbackAction::ManualIntervention),
        )])
        .unwrap();
        let advice = adviser.advise(&StepFailure::new("n", ["TIMEOUT"]));
        assert_eq!(advice.decision.timeout(), Some(Duration::from_millis(DEFAULT_INTERVENTION_TIMEOUT_MS)));
    }

    #[test]
    fn test_from_json() {
        let adviser = FailureAdviser::from_json_str(
            r#"[
                {"applicable_failure_categories": ["TIMEOUT"],
                 "action": {"type": "RETRY", "retry_count": 3, "wait_intervals_ms": [1000, 5000]}},
                {"applicable_failure_categories": ["ALL_ERRORS"],
                 "action": {"type": "MANUAL_INTERVENTION", "timeout_ms": 3600000, "on_timeout": "IGNORE"},
                 "rollback_targets_by_node_id": {"deploy": "provision"}}
            ]"#,
        )
        .unwrap();

        assert_eq!(adviser.strategies().len(), 2);
        let advice = adviser.advise(&StepFailure::new("deploy", ["UNKNOWN"]));
        assert_eq!(advice.strategy_index, Some(1));
        assert_eq!(advice.decision.timeout(), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_invalid_strategies_rejected() {
        let empty = FailureStrategy::new(Vec::<String>::new(), FailureAction::Abort);
        assert!(FailureAdviser::new(vec![empty]).is_err());

        let looping = FailureStrategy::new(
            ["X"],
            FailureAction::ManualIntervention {
                timeout_ms: None,
                on_timeout: FallbackAction::ManualIntervention,
            },
        );
        assert!(FailureAdviser::new(vec![looping]).is_err());
    }

    #[test]
    fn test_retry_fallback_to_intervention_keeps_rollback_target() {
        let adviser = FailureAdviser::new(vec![FailureStrategy::new(
            ["TIMEOUT"],
            retry(0, &[], FallbackAction::ManualIntervention),
        )
        .with_rollback_target("deploy", "provision")])
        .unwrap();
        let advice = adviser.advise(&StepFailure::new("deploy", ["TIMEOUT"]));
        assert!(matches!(
            advice.decision,
            AdviserDecision::ManualIntervention { rollback_target: Some(ref target), .. } if target == "provision"
        ));
    }
}
