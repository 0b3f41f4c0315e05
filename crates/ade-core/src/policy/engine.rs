//! Rule evaluation: first-match walk, fact resolution and confidence.
//!
//! Facts are resolved through an explicit dispatch table built at startup;
//! the alias map is data. Unknown facts resolve to nothing and make their
//! leaf false; no runtime reflection is involved.

use std::collections::HashMap;
use std::sync::LazyLock;

use serde::Serialize;
use tracing::debug;

use super::types::{CompareOp, Condition, Policy, PolicyError, Rule, RuleAction, Scalar};
use crate::features::ServiceFeatures;

/// Base confidence for a matched rule.
const BASE_CONFIDENCE: f64 = 0.8;
/// Confidence bonus for high-priority rules.
const HIGH_PRIORITY_BONUS: f64 = 0.1;
/// Priority above which the bonus applies.
const HIGH_PRIORITY_THRESHOLD: i64 = 50;
/// Confidence penalty when the service is already unhealthy.
const LOW_HEALTH_PENALTY: f64 = 0.15;
/// Health score below which the penalty applies.
const LOW_HEALTH_THRESHOLD: f64 = 0.3;

/// A resolved fact value: a number, or a string for labels such as trends.
#[derive(Debug, Clone, PartialEq)]
pub enum FactValue {
    /// Numeric fact.
    Number(f64),
    /// String-valued fact (trend labels, flags).
    Text(String),
}

type Accessor = fn(&ServiceFeatures) -> FactValue;

/// Canonical fact table: structural feature names to accessors.
static FACTS: LazyLock<HashMap<&'static str, Accessor>> = LazyLock::new(|| {
    let mut table: HashMap<&'static str, Accessor> = HashMap::new();
    table.insert("CPUCurrent", |f| FactValue::Number(f.cpu_current));
    table.insert("CPUAvg5m", |f| FactValue::Number(f.cpu_avg_5m));
    table.insert("CPUAvg15m", |f| FactValue::Number(f.cpu_avg_15m));
    table.insert("CPUEMA", |f| FactValue::Number(f.cpu_ema));
    table.insert("CPUTrend", |f| FactValue::Text(f.cpu_trend.as_str().to_string()));
    table.insert("LatencyP50", |f| FactValue::Number(f.latency_p50));
    table.insert("LatencyP95", |f| FactValue::Number(f.latency_p95));
    table.insert("LatencyP99", |f| FactValue::Number(f.latency_p99));
    table.insert("LatencyEMA", |f| FactValue::Number(f.latency_ema));
    table.insert("ErrorRate", |f| FactValue::Number(f.error_rate));
    table.insert("ErrorRate5m", |f| FactValue::Number(f.error_rate_5m));
    table.insert("ErrorSpike", |f| FactValue::Text(f.error_spike.to_string()));
    table.insert("RequestsPerSec", |f| FactValue::Number(f.requests_per_sec));
    table.insert("RequestsPerSec5m", |f| {
        FactValue::Number(f.requests_per_sec_5m)
    });
    table.insert("RequestsTrend", |f| {
        FactValue::Text(f.requests_trend.as_str().to_string())
    });
    #[allow(clippy::cast_precision_loss)]
    table.insert("QueueDepth", |f| FactValue::Number(f.queue_depth as f64));
    table.insert("QueueDepthAvg5m", |f| {
        FactValue::Number(f.queue_depth_avg_5m)
    });
    table.insert("QueueSaturation", |f| FactValue::Number(f.queue_saturation));
    table.insert("LoadScore", |f| FactValue::Number(f.load_score));
    table.insert("HealthScore", |f| FactValue::Number(f.health_score));
    table.insert("ThrottlingRisk", |f| FactValue::Number(f.throttling_risk));
    table
});

/// Alias map accepted alongside the canonical fact names.
static ALIASES: &[(&str, &str)] = &[
    ("cpu", "CPUCurrent"),
    ("latency", "LatencyP95"),
    ("error_rate", "ErrorRate"),
    ("rps", "RequestsPerSec"),
    ("queue_depth", "QueueDepth"),
    ("health_score", "HealthScore"),
    ("load_score", "LoadScore"),
];

/// Resolves a DSL fact name against a features record.
#[must_use]
pub fn resolve_fact(features: &ServiceFeatures, fact: &str) -> Option<FactValue> {
    let canonical = ALIASES
        .iter()
        .find(|(alias, _)| *alias == fact)
        .map_or(fact, |(_, canonical)| *canonical);
    FACTS.get(canonical).map(|accessor| accessor(features))
}

/// Outcome of evaluating a policy against a features record.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationResult {
    /// Whether any rule matched.
    pub matched: bool,
    /// The matching rule's ID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    /// The matching rule's action.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<RuleAction>,
    /// Why the evaluation ended the way it did.
    pub reason: String,
    /// Confidence in `[0, 1]`; `1.0` for a clean no-match.
    pub confidence: f64,
}

/// One rule visit, recorded for the decision trace.
#[derive(Debug, Clone, Serialize)]
pub struct RuleEvaluation {
    /// The visited rule.
    pub rule_id: String,
    /// Its priority at evaluation time.
    pub priority: i64,
    /// Whether its condition held.
    pub matched: bool,
}

/// The policy evaluation engine. Stateless; safe to share.
#[derive(Debug, Default, Clone, Copy)]
pub struct Engine;

impl Engine {
    /// Creates an engine.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Evaluates `policy` against `features` with first-match semantics.
    ///
    /// Rules are walked in priority order (stable on declaration order for
    /// ties); evaluation stops at the first match. The second element of the
    /// returned pair lists every rule visited, for the decision trace.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError`] when the policy fails validation; invalid
    /// policies are never evaluated.
    pub fn evaluate(
        &self,
        policy: &Policy,
        features: &ServiceFeatures,
    ) -> Result<(EvaluationResult, Vec<RuleEvaluation>), PolicyError> {
        policy.validate()?;

        let mut ordered: Vec<&Rule> = policy.rules.iter().collect();
        ordered.sort_by_key(|r| std::cmp::Reverse(r.priority));

        let mut visited = Vec::with_capacity(ordered.len());
        for rule in ordered {
            let matched = evaluate_condition(&rule.when, features);
            visited.push(RuleEvaluation {
                rule_id: rule.id.clone(),
                priority: rule.priority,
                matched,
            });

            if matched {
                debug!(
                    policy_id = %policy.policy_id,
                    policy_version = %policy.version,
                    rule_id = %rule.id,
                    action = %rule.action.action_type,
                    "rule matched"
                );
                let result = EvaluationResult {
                    matched: true,
                    rule_id: Some(rule.id.clone()),
                    action: Some(rule.action.clone()),
                    reason: format!("condition matched for rule {}", rule.id),
                    confidence: confidence(rule, features),
                };
                return Ok((result, visited));
            }
        }

        Ok((
            EvaluationResult {
                matched: false,
                rule_id: None,
                action: None,
                reason: "no rules matched".to_string(),
                confidence: 1.0,
            },
            visited,
        ))
    }
}

/// Recursive condition walk.
#[must_use]
pub fn evaluate_condition(cond: &Condition, features: &ServiceFeatures) -> bool {
    match cond {
        // An empty compound is vacuously true, the identity for `all`.
        Condition::All { all } => all.iter().all(|c| evaluate_condition(c, features)),
        Condition::Any { any } => {
            any.is_empty() || any.iter().any(|c| evaluate_condition(c, features))
        },
        Condition::Not { not } => !evaluate_condition(not, features),
        Condition::Leaf { fact, op, value } => match resolve_fact(features, fact) {
            Some(fact_value) => compare(&fact_value, *op, value),
            None => false,
        },
        Condition::Empty {} => true,
    }
}

/// Applies `op` between a resolved fact and a scalar operand.
///
/// Numeric comparison when both operands coerce to numbers; otherwise string
/// equality for `==` / `!=` only.
fn compare(fact: &FactValue, op: CompareOp, value: &Scalar) -> bool {
    if let (FactValue::Number(f), Some(t)) = (fact, value.as_number()) {
        return match op {
            CompareOp::Gt => *f > t,
            CompareOp::Gte => *f >= t,
            CompareOp::Lt => *f < t,
            CompareOp::Lte => *f <= t,
            CompareOp::Eq => (*f - t).abs() < f64::EPSILON,
            CompareOp::Ne => (*f - t).abs() >= f64::EPSILON,
        };
    }

    let fact_str = match fact {
        FactValue::Number(n) => format!("{n}"),
        FactValue::Text(s) => s.clone(),
    };
    let value_str = value.canonical();
    match op {
        CompareOp::Eq => fact_str == value_str,
        CompareOp::Ne => fact_str != value_str,
        _ => false,
    }
}

/// Confidence for a matched rule: `0.8`, plus `0.1` for priority above 50,
/// minus `0.15` when the health score is below `0.3`, clamped to `[0, 1]`.
#[must_use]
pub fn confidence(rule: &Rule, features: &ServiceFeatures) -> f64 {
    let mut score = BASE_CONFIDENCE;
    if rule.priority > HIGH_PRIORITY_THRESHOLD {
        score += HIGH_PRIORITY_BONUS;
    }
    if features.health_score < LOW_HEALTH_THRESHOLD {
        score -= LOW_HEALTH_PENALTY;
    }
    score.clamp(0.0, 1.0)
}
