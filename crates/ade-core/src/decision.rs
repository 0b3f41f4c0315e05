//! Decision outcome model: immutable records and their audit traces.
//!
//! Each decision is reproducible from its feature snapshot and versioned
//! policy; a [`DecisionTrace`] records which rules were evaluated, which
//! matched, and which features were read.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use thiserror::Error;

use crate::policy::{ActionType, PolicyType, RuleAction};

/// A decision-result label outside the closed set.
#[derive(Debug, Error)]
#[error("unknown decision result: {0}")]
pub struct UnknownDecisionResult(pub String);

/// The closed set of decision results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionResult {
    /// Proceed; scaling actions and no-match defaults land here.
    Allow,
    /// Refuse; circuit-opening actions land here.
    Deny,
    /// Proceed under throttling.
    Throttle,
    /// A what-if evaluation with no side effects.
    Simulate,
    /// The evaluation itself failed.
    Error,
}

impl DecisionResult {
    /// Stable wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::Throttle => "throttle",
            Self::Simulate => "simulate",
            Self::Error => "error",
        }
    }

    /// The decision result implied by a matched action type; a no-match
    /// yields [`DecisionResult::Allow`] with no actions.
    #[must_use]
    pub const fn for_action(action: Option<ActionType>) -> Self {
        match action {
            Some(ActionType::Throttle) => Self::Throttle,
            Some(ActionType::OpenCircuit) => Self::Deny,
            _ => Self::Allow,
        }
    }
}

impl std::fmt::Display for DecisionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DecisionResult {
    type Err = UnknownDecisionResult;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow" => Ok(Self::Allow),
            "deny" => Ok(Self::Deny),
            "throttle" => Ok(Self::Throttle),
            "simulate" => Ok(Self::Simulate),
            "error" => Ok(Self::Error),
            other => Err(UnknownDecisionResult(other.to_string())),
        }
    }
}

/// An immutable decision outcome.
///
/// At most one record exists per `idempotency_key`; concurrent writers
/// serialize on that constraint and the losing writer observes the winner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    /// Business ID of the decision.
    pub decision_id: String,
    /// Caller-chosen dedup token.
    pub idempotency_key: String,
    /// The service decided about.
    pub service_id: String,
    /// The policy that produced the decision.
    pub policy_id: String,
    /// The exact policy version used.
    pub policy_version: String,
    /// The feature snapshot the decision is reproducible from.
    pub snapshot_id: String,
    /// Policy type carried through as the decision type.
    pub decision_type: PolicyType,
    /// The outcome.
    pub decision_result: DecisionResult,
    /// Actions emitted by the matching rule, if any.
    pub actions: Vec<RuleAction>,
    /// Confidence in `[0, 1]`.
    pub confidence_score: f64,
    /// Simulation run consulted for a what-if, when one was requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simulation_run_id: Option<String>,
    /// Whether execution was suppressed.
    pub dry_run: bool,
    /// When the decision executed.
    pub executed_at: DateTime<Utc>,
}

/// The per-decision audit record, one-to-one with [`DecisionRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTrace {
    /// Business ID of the trace.
    pub trace_id: String,
    /// The decision this trace belongs to.
    pub decision_id: String,
    /// The policy evaluated.
    pub policy_id: String,
    /// The policy version evaluated.
    pub policy_version: String,
    /// The matched result, serialized.
    pub trace_data: serde_json::Value,
    /// Every rule visited, in evaluation order.
    pub rules_evaluated: serde_json::Value,
    /// The rules that matched.
    pub rules_matched: serde_json::Value,
    /// The features record the rules read.
    pub features_used: serde_json::Value,
    /// Wall-clock spent evaluating, in milliseconds.
    pub execution_time_ms: i64,
}

/// Filters for listing stored decisions.
///
/// Fields are inferred from the columns the original store queries against;
/// every filter is optional and filters compose conjunctively.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionFilters {
    /// Restrict to one service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    /// Restrict to one policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
    /// Restrict to one outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_result: Option<DecisionResult>,
    /// Earliest `executed_at` to include.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<DateTime<Utc>>,
    /// Latest `executed_at` to include.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<DateTime<Utc>>,
    /// Maximum rows to return.
    #[serde(default = "default_filter_limit")]
    pub limit: u32,
}

const fn default_filter_limit() -> u32 {
    100
}

impl Default for DecisionFilters {
    fn default() -> Self {
        Self {
            service_id: None,
            policy_id: None,
            decision_result: None,
            from: None,
            to: None,
            limit: default_filter_limit(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_to_result_mapping() {
        assert_eq!(
            DecisionResult::for_action(Some(ActionType::ScaleUp)),
            DecisionResult::Allow
        );
        assert_eq!(
            DecisionResult::for_action(Some(ActionType::ScaleDown)),
            DecisionResult::Allow
        );
        assert_eq!(
            DecisionResult::for_action(Some(ActionType::Throttle)),
            DecisionResult::Throttle
        );
        assert_eq!(
            DecisionResult::for_action(Some(ActionType::OpenCircuit)),
            DecisionResult::Deny
        );
        assert_eq!(DecisionResult::for_action(None), DecisionResult::Allow);
    }

    #[test]
    fn test_result_round_trip() {
        for result in [
            DecisionResult::Allow,
            DecisionResult::Deny,
            DecisionResult::Throttle,
            DecisionResult::Simulate,
            DecisionResult::Error,
        ] {
            assert_eq!(result.as_str().parse::<DecisionResult>().unwrap(), result);
        }
        assert!("granted".parse::<DecisionResult>().is_err());
    }
}
