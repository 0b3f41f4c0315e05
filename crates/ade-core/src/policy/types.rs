//! Policy document model: rules, conditions and the scalar value space.
//!
//! Serde representations follow the policy file format: a condition is
//! tagged by the presence of `all` / `any` / `not` / `fact`, and unknown
//! keys are ignored for forward compatibility.

use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorKind;

/// The closed set of operational action types a rule may emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Add capacity to the target service.
    ScaleUp,
    /// Remove capacity from the target service.
    ScaleDown,
    /// Apply request throttling.
    Throttle,
    /// Lift request throttling.
    Unthrottle,
    /// Open a protective circuit in front of the target.
    OpenCircuit,
    /// Close a previously opened circuit.
    CloseCircuit,
    /// Deliver a bare webhook with no operational semantics.
    Webhook,
}

impl ActionType {
    /// Stable wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ScaleUp => "scale_up",
            Self::ScaleDown => "scale_down",
            Self::Throttle => "throttle",
            Self::Unthrottle => "unthrottle",
            Self::OpenCircuit => "open_circuit",
            Self::CloseCircuit => "close_circuit",
            Self::Webhook => "webhook",
        }
    }

    /// The inverse action used for rollback. Webhooks have no inverse.
    #[must_use]
    pub const fn inverse(self) -> Option<Self> {
        match self {
            Self::ScaleUp => Some(Self::ScaleDown),
            Self::ScaleDown => Some(Self::ScaleUp),
            Self::Throttle => Some(Self::Unthrottle),
            Self::Unthrottle => Some(Self::Throttle),
            Self::OpenCircuit => Some(Self::CloseCircuit),
            Self::CloseCircuit => Some(Self::OpenCircuit),
            Self::Webhook => None,
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scale_up" => Ok(Self::ScaleUp),
            "scale_down" => Ok(Self::ScaleDown),
            "throttle" => Ok(Self::Throttle),
            "unthrottle" => Ok(Self::Unthrottle),
            "open_circuit" => Ok(Self::OpenCircuit),
            "close_circuit" => Ok(Self::CloseCircuit),
            "webhook" => Ok(Self::Webhook),
            other => Err(PolicyError::UnknownActionType(other.to_string())),
        }
    }
}

/// The policy type closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyType {
    /// Capacity scaling policies.
    Autoscale,
    /// Request throttling policies.
    Ratelimit,
    /// Circuit-breaking policies.
    Circuitbreaker,
    /// Anything else.
    Custom,
}

impl PolicyType {
    /// Stable wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Autoscale => "autoscale",
            Self::Ratelimit => "ratelimit",
            Self::Circuitbreaker => "circuitbreaker",
            Self::Custom => "custom",
        }
    }
}

impl std::fmt::Display for PolicyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyType {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "autoscale" => Ok(Self::Autoscale),
            "ratelimit" => Ok(Self::Ratelimit),
            "circuitbreaker" => Ok(Self::Circuitbreaker),
            "custom" => Ok(Self::Custom),
            other => Err(PolicyError::UnknownPolicyType(other.to_string())),
        }
    }
}

/// Comparison operator of a condition leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    /// Strictly greater.
    #[serde(rename = ">")]
    Gt,
    /// Greater or equal.
    #[serde(rename = ">=")]
    Gte,
    /// Strictly less.
    #[serde(rename = "<")]
    Lt,
    /// Less or equal.
    #[serde(rename = "<=")]
    Lte,
    /// Equal.
    #[serde(rename = "==")]
    Eq,
    /// Not equal.
    #[serde(rename = "!=")]
    Ne,
}

/// The closed scalar value space for condition leaves. Parsers coerce file
/// scalars into this sum once at load; evaluation stays monomorphic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    /// A numeric literal (integers widen to floats).
    Number(f64),
    /// A boolean literal.
    Bool(bool),
    /// A string literal.
    Text(String),
}

impl Scalar {
    /// The numeric view of the scalar, when it has one.
    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Bool(_) | Self::Text(_) => None,
        }
    }

    /// Canonical string form, used for `==` / `!=` on non-numeric operands.
    #[must_use]
    pub fn canonical(&self) -> String {
        match self {
            Self::Number(n) => format!("{n}"),
            Self::Bool(b) => b.to_string(),
            Self::Text(s) => s.clone(),
        }
    }
}

/// A recursive rule condition, tagged by the presence of its key.
///
/// An empty condition (or a compound with no children) evaluates to true:
/// the identity for `all`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    /// Logical AND over children; short-circuits on the first false.
    All {
        /// The conjuncts.
        all: Vec<Condition>,
    },
    /// Logical OR over children; short-circuits on the first true.
    Any {
        /// The disjuncts.
        any: Vec<Condition>,
    },
    /// Negation of the single child.
    Not {
        /// The negated condition.
        not: Box<Condition>,
    },
    /// A fact comparison. An unresolved fact makes the leaf false.
    Leaf {
        /// DSL fact name (canonical or aliased).
        fact: String,
        /// The comparison operator.
        op: CompareOp,
        /// The right-hand operand.
        value: Scalar,
    },
    /// No constraint; evaluates to true. Also absorbs forward-compatible
    /// documents whose keys are unknown to this version.
    Empty {},
}

impl Default for Condition {
    fn default() -> Self {
        Self::Empty {}
    }
}

/// The action emitted by a matching rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleAction {
    /// The operational action type.
    #[serde(rename = "type")]
    pub action_type: ActionType,
    /// Target service override; defaults to the evaluated service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Free-form parameters forwarded to the executor.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub params: serde_json::Map<String, serde_json::Value>,
    /// Relative cost of taking the action.
    #[serde(default)]
    pub cost: f64,
    /// Relative risk of taking the action.
    #[serde(default)]
    pub risk: f64,
}

/// A single prioritised rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Rule ID, unique within its policy.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Evaluation priority; higher evaluates first.
    #[serde(default)]
    pub priority: i64,
    /// The guarding condition; absent means always matches.
    #[serde(default)]
    pub when: Condition,
    /// The action taken on match.
    pub action: RuleAction,
    /// Minimum spacing between firings of this rule.
    #[serde(
        default,
        with = "humantime_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub cooldown: Option<Duration>,
}

/// A versioned, priority-ordered ruleset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Business ID of the policy.
    #[serde(rename = "id")]
    pub policy_id: String,
    /// Version label; `(policy_id, version)` is unique.
    pub version: String,
    /// Human-readable name.
    pub name: String,
    /// Optional description.
    #[serde(default)]
    pub description: String,
    /// Policy type from the closed set.
    #[serde(rename = "type")]
    pub policy_type: PolicyType,
    /// The rules, in declaration order.
    pub rules: Vec<Rule>,
    /// Free-form defaults forwarded to executors.
    #[serde(default)]
    pub defaults: BTreeMap<String, String>,
    /// Start of the validity window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_from: Option<DateTime<Utc>>,
    /// End of the validity window; must be after `effective_from`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_until: Option<DateTime<Utc>>,
    /// Whether the policy may be used for live decisions.
    #[serde(default = "default_is_active")]
    pub is_active: bool,
}

const fn default_is_active() -> bool {
    true
}

/// Policy validation failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PolicyError {
    /// A required field is empty.
    #[error("{0} is required")]
    MissingField(&'static str),

    /// A policy carries no rules.
    #[error("policy must have at least one rule")]
    NoRules,

    /// Two rules share an ID.
    #[error("duplicate rule id: {0}")]
    DuplicateRuleId(String),

    /// A rule failed its own validation.
    #[error("invalid rule {rule_id}: {reason}")]
    InvalidRule {
        /// The offending rule.
        rule_id: String,
        /// What was wrong.
        reason: String,
    },

    /// `effective_until` does not follow `effective_from`.
    #[error("effective_until must be after effective_from")]
    EffectiveWindow,

    /// An action type outside the closed set.
    #[error("unknown action type: {0}")]
    UnknownActionType(String),

    /// A policy type outside the closed set.
    #[error("unknown policy type: {0}")]
    UnknownPolicyType(String),
}

impl PolicyError {
    /// Taxonomy classification.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

impl Policy {
    /// Validates the policy document.
    ///
    /// Runs at load and before any evaluation; an invalid policy must never
    /// be used for a live decision.
    ///
    /// # Errors
    ///
    /// Returns the first [`PolicyError`] encountered.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.policy_id.is_empty() {
            return Err(PolicyError::MissingField("policy id"));
        }
        if self.version.is_empty() {
            return Err(PolicyError::MissingField("policy version"));
        }
        if self.rules.is_empty() {
            return Err(PolicyError::NoRules);
        }

        let mut seen = HashSet::new();
        for rule in &self.rules {
            if rule.id.is_empty() {
                return Err(PolicyError::MissingField("rule id"));
            }
            if !seen.insert(rule.id.as_str()) {
                return Err(PolicyError::DuplicateRuleId(rule.id.clone()));
            }
            if rule.name.is_empty() {
                return Err(PolicyError::InvalidRule {
                    rule_id: rule.id.clone(),
                    reason: "rule name is required".to_string(),
                });
            }
        }

        if let (Some(from), Some(until)) = (self.effective_from, self.effective_until) {
            if until <= from {
                return Err(PolicyError::EffectiveWindow);
            }
        }

        Ok(())
    }

    /// Finds a rule by its ID.
    #[must_use]
    pub fn rule_by_id(&self, id: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.id == id)
    }
}

mod humantime_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => serializer.serialize_str(&humantime::format_duration(*d).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn rule(id: &str, priority: i64) -> Rule {
        Rule {
            id: id.to_string(),
            name: format!("rule {id}"),
            priority,
            when: Condition::default(),
            action: RuleAction {
                action_type: ActionType::ScaleUp,
                target: None,
                params: serde_json::Map::new(),
                cost: 0.0,
                risk: 0.0,
            },
            cooldown: None,
        }
    }

    fn policy(rules: Vec<Rule>) -> Policy {
        Policy {
            policy_id: "pol-1".to_string(),
            version: "1".to_string(),
            name: "test".to_string(),
            description: String::new(),
            policy_type: PolicyType::Autoscale,
            rules,
            defaults: BTreeMap::new(),
            effective_from: None,
            effective_until: None,
            is_active: true,
        }
    }

    #[test]
    fn test_condition_tagged_by_presence() {
        let all: Condition = serde_json::from_value(json!({
            "all": [{"fact": "cpu", "op": ">=", "value": 90}]
        }))
        .unwrap();
        assert!(matches!(all, Condition::All { .. }));

        let not: Condition = serde_json::from_value(json!({
            "not": {"fact": "cpu", "op": ">", "value": 50}
        }))
        .unwrap();
        assert!(matches!(not, Condition::Not { .. }));

        let leaf: Condition = serde_json::from_value(json!({
            "fact": "latency", "op": "<", "value": 200.5
        }))
        .unwrap();
        match leaf {
            Condition::Leaf { fact, op, value } => {
                assert_eq!(fact, "latency");
                assert_eq!(op, CompareOp::Lt);
                assert_eq!(value, Scalar::Number(200.5));
            },
            other => panic!("expected leaf, got {other:?}"),
        }

        let empty: Condition = serde_json::from_value(json!({})).unwrap();
        assert!(matches!(empty, Condition::Empty {}));
    }

    #[test]
    fn test_condition_ignores_unknown_keys() {
        // A leaf missing its operator degrades to no constraint rather than
        // a parse failure, matching forward-compatible loading.
        let cond: Condition = serde_json::from_value(json!({"fact": "cpu"})).unwrap();
        assert!(matches!(cond, Condition::Empty {}));

        let cond: Condition =
            serde_json::from_value(json!({"future_combinator": [1, 2, 3]})).unwrap();
        assert!(matches!(cond, Condition::Empty {}));
    }

    #[test]
    fn test_policy_validation() {
        assert!(policy(vec![rule("a", 10)]).validate().is_ok());

        let err = policy(vec![]).validate().unwrap_err();
        assert!(matches!(err, PolicyError::NoRules));

        let err = policy(vec![rule("a", 10), rule("a", 20)])
            .validate()
            .unwrap_err();
        assert!(matches!(err, PolicyError::DuplicateRuleId(_)));

        let mut unnamed = rule("a", 10);
        unnamed.name = String::new();
        let err = policy(vec![unnamed]).validate().unwrap_err();
        assert!(matches!(err, PolicyError::InvalidRule { .. }));

        let mut p = policy(vec![rule("a", 10)]);
        p.policy_id = String::new();
        assert!(matches!(
            p.validate(),
            Err(PolicyError::MissingField("policy id"))
        ));
    }

    #[test]
    fn test_effective_window_ordering() {
        let mut p = policy(vec![rule("a", 10)]);
        p.effective_from = Some(Utc::now());
        p.effective_until = p.effective_from;
        assert!(matches!(p.validate(), Err(PolicyError::EffectiveWindow)));
    }

    #[test]
    fn test_action_type_inverses() {
        assert_eq!(ActionType::ScaleUp.inverse(), Some(ActionType::ScaleDown));
        assert_eq!(ActionType::ScaleDown.inverse(), Some(ActionType::ScaleUp));
        assert_eq!(ActionType::Throttle.inverse(), Some(ActionType::Unthrottle));
        assert_eq!(
            ActionType::OpenCircuit.inverse(),
            Some(ActionType::CloseCircuit)
        );
        assert_eq!(ActionType::Webhook.inverse(), None);
    }

    #[test]
    fn test_rule_cooldown_humantime() {
        let rule: Rule = serde_json::from_value(json!({
            "id": "r1",
            "name": "cooldown rule",
            "priority": 10,
            "when": {"fact": "cpu", "op": ">", "value": 90},
            "action": {"type": "scale_up"},
            "cooldown": "5m"
        }))
        .unwrap();
        assert_eq!(rule.cooldown, Some(Duration::from_secs(300)));
    }
}
