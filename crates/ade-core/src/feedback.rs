//! Feedback scoring: impact of an executed action, drift detection over its
//! before/after metric vectors, and the rollback gate.
//!
//! Impact is a weighted, normalized sum of relative metric changes in
//! `[-1, 1]`; lower is better for every metric except throughput. Drift is
//! any relative change above 20% (critical above 50%). Drift detection that
//! cannot run (no common metrics) reports no drift rather than an error.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorKind;
use crate::policy::ActionType;

/// Relative change above which a metric counts as drifted.
pub const DRIFT_THRESHOLD: f64 = 0.20;
/// Relative change above which a drifted metric counts as critical.
pub const CRITICAL_THRESHOLD: f64 = 0.50;

/// Impact below which rollback is always recommended.
const ROLLBACK_IMPACT_FLOOR: f64 = -0.7;
/// Impact below which high-severity drift recommends rollback.
const ROLLBACK_HIGH_SEVERITY_FLOOR: f64 = -0.4;

/// The metrics drift detection watches.
const DRIFT_METRICS: &[&str] = &["cpu", "latency", "error_rate", "throughput", "memory"];

/// How the feedback observation was gathered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackType {
    /// Observed right after execution.
    Immediate,
    /// Observed after a delay.
    Delayed,
    /// Observed by a scheduled probe.
    Scheduled,
}

impl FeedbackType {
    /// Stable wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::Delayed => "delayed",
            Self::Scheduled => "scheduled",
        }
    }
}

impl std::fmt::Display for FeedbackType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FeedbackType {
    type Err = FeedbackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "immediate" => Ok(Self::Immediate),
            "delayed" => Ok(Self::Delayed),
            "scheduled" => Ok(Self::Scheduled),
            other => Err(FeedbackError::UnknownFeedbackType(other.to_string())),
        }
    }
}

/// Drift severity closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftSeverity {
    /// A single mildly drifted metric.
    Low,
    /// Two or more drifted metrics.
    Medium,
    /// One critical metric, or a change above 50%.
    High,
    /// Two or more critical metrics, or a change above 80%.
    Critical,
}

/// Drift classification by the metrics involved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftType {
    /// Error rate drifted.
    ErrorDrift,
    /// Latency or throughput drifted.
    PerformanceDrift,
    /// CPU or memory drifted.
    ResourceDrift,
    /// Anything else.
    GeneralDrift,
}

/// Drift in one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDrift {
    /// The metric name.
    pub metric: String,
    /// Value before the action.
    pub before: f64,
    /// Value after the action.
    pub after: f64,
    /// Absolute relative change.
    pub change_pct: f64,
}

/// Full drift report for one observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftDetails {
    /// Classification by the metrics involved.
    pub drift_type: DriftType,
    /// Overall severity.
    pub severity: DriftSeverity,
    /// Every drifted metric.
    pub metrics_drifted: Vec<MetricDrift>,
    /// The largest relative change observed.
    pub threshold_violated: f64,
    /// Human-readable summary.
    pub description: String,
}

/// A persisted feedback observation tied to one action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRecord {
    /// Business ID of the record.
    pub feedback_id: String,
    /// The action observed.
    pub action_id: String,
    /// The decision that produced the action.
    pub decision_id: String,
    /// The service observed.
    pub service_id: String,
    /// How the observation was gathered.
    pub feedback_type: FeedbackType,
    /// Metric vector before the action.
    pub metrics_before: BTreeMap<String, f64>,
    /// Metric vector after the action.
    pub metrics_after: BTreeMap<String, f64>,
    /// Weighted impact in `[-1, 1]`.
    pub impact_score: f64,
    /// Whether any metric drifted.
    pub drift_detected: bool,
    /// Drift report, when drift was detected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drift_details: Option<DriftDetails>,
    /// Whether the gate recommends rollback.
    pub rollback_recommended: bool,
    /// Whether a rollback has been executed for this observation.
    pub rollback_executed: bool,
    /// Minutes between the before and after vectors.
    pub observation_window_minutes: u32,
    /// When the observation was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// Feedback failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FeedbackError {
    /// A required field is empty.
    #[error("{0} is required")]
    MissingField(&'static str),

    /// A metric map is empty.
    #[error("{0} must not be empty")]
    EmptyMetrics(&'static str),

    /// A feedback type outside the closed set.
    #[error("unknown feedback type: {0}")]
    UnknownFeedbackType(String),

    /// The original action has no inverse to deliver.
    #[error("action type {action_type} cannot be rolled back")]
    NotRollbackable {
        /// The non-invertible action type.
        action_type: ActionType,
    },

    /// Rollback was requested but the gate does not recommend it.
    #[error("rollback not recommended for action {action_id}; pass force to override")]
    NotRecommended {
        /// The action whose rollback was refused.
        action_id: String,
    },
}

impl FeedbackError {
    /// Taxonomy classification.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

/// Weight of a metric in the impact score.
#[must_use]
fn impact_weight(metric: &str) -> f64 {
    match metric {
        "cpu" => 0.25,
        "latency" => 0.25,
        "error_rate" => 0.30,
        "throughput" => 0.20,
        _ => 0.10,
    }
}

/// Weighted impact of the before/after change, in `[-1, 1]`.
///
/// For each metric present in both maps the relative change is weighted and
/// negated (a drop in latency or error rate is good), except throughput and
/// rps where an increase is good. The mean is scaled by 5 and clamped.
#[must_use]
pub fn impact_score(
    before: &BTreeMap<String, f64>,
    after: &BTreeMap<String, f64>,
) -> f64 {
    let mut total = 0.0;
    let mut count = 0u32;

    for (metric, before_val) in before {
        let Some(after_val) = after.get(metric) else {
            continue;
        };

        let change = if *before_val != 0.0 {
            (after_val - before_val) / before_val
        } else if *after_val > 0.0 {
            1.0
        } else {
            0.0
        };

        let weight = impact_weight(metric);
        let impact = if metric == "throughput" || metric == "rps" {
            change * weight
        } else {
            -change * weight
        };

        total += impact;
        count += 1;
    }

    if count == 0 {
        return 0.0;
    }

    (total / f64::from(count) * 5.0).clamp(-1.0, 1.0)
}

/// Detects drift across the watched metrics.
///
/// Returns `None` when no metric drifted (including when the maps share no
/// watched metric); drift detection never fails.
#[must_use]
pub fn detect_drift(
    before: &BTreeMap<String, f64>,
    after: &BTreeMap<String, f64>,
) -> Option<DriftDetails> {
    let mut drifted = Vec::new();
    let mut critical_count = 0u32;
    let mut max_change = 0.0f64;

    for metric in DRIFT_METRICS {
        let (Some(before_val), Some(after_val)) = (before.get(*metric), after.get(*metric))
        else {
            continue;
        };

        let mut change = (after_val - before_val).abs();
        if *before_val != 0.0 {
            change /= before_val.abs();
        }

        if change > DRIFT_THRESHOLD {
            if change > CRITICAL_THRESHOLD {
                critical_count += 1;
            }
            max_change = max_change.max(change);
            drifted.push(MetricDrift {
                metric: (*metric).to_string(),
                before: *before_val,
                after: *after_val,
                change_pct: change,
            });
        }
    }

    if drifted.is_empty() {
        return None;
    }

    let severity = if critical_count >= 2 || max_change > 0.8 {
        DriftSeverity::Critical
    } else if critical_count == 1 || max_change > 0.5 {
        DriftSeverity::High
    } else if drifted.len() >= 2 {
        DriftSeverity::Medium
    } else {
        DriftSeverity::Low
    };

    let drift_type = classify_drift(&drifted);
    let description = format!(
        "detected drift in {} metrics, max change {:.1}%, severity {severity:?}",
        drifted.len(),
        max_change * 100.0
    );

    Some(DriftDetails {
        drift_type,
        severity,
        metrics_drifted: drifted,
        threshold_violated: max_change,
        description,
    })
}

fn classify_drift(drifted: &[MetricDrift]) -> DriftType {
    let mut performance = false;
    let mut errors = false;
    let mut resources = false;

    for drift in drifted {
        match drift.metric.as_str() {
            "latency" | "throughput" => performance = true,
            "error_rate" => errors = true,
            "cpu" | "memory" => resources = true,
            _ => {},
        }
    }

    if errors {
        DriftType::ErrorDrift
    } else if performance {
        DriftType::PerformanceDrift
    } else if resources {
        DriftType::ResourceDrift
    } else {
        DriftType::GeneralDrift
    }
}

/// The rollback gate: recommend when the impact is strongly negative, the
/// drift is critical, or high-severity drift coincides with a clearly
/// negative impact.
#[must_use]
pub fn should_rollback(impact: f64, drift: Option<&DriftDetails>) -> bool {
    if impact < ROLLBACK_IMPACT_FLOOR {
        return true;
    }
    match drift {
        Some(details) if details.severity == DriftSeverity::Critical => true,
        Some(details) => {
            details.severity == DriftSeverity::High && impact < ROLLBACK_HIGH_SEVERITY_FLOOR
        },
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), *v)).collect()
    }

    #[test]
    fn test_impact_improvement_is_positive() {
        let before = metrics(&[("latency", 400.0), ("error_rate", 0.10)]);
        let after = metrics(&[("latency", 200.0), ("error_rate", 0.02)]);
        assert!(impact_score(&before, &after) > 0.0);
    }

    #[test]
    fn test_impact_degradation_is_negative() {
        let before = metrics(&[("latency", 200.0), ("error_rate", 0.02)]);
        let after = metrics(&[("latency", 800.0), ("error_rate", 0.20)]);
        assert!(impact_score(&before, &after) < 0.0);
    }

    #[test]
    fn test_throughput_direction_is_reversed() {
        let before = metrics(&[("throughput", 500.0)]);
        let after = metrics(&[("throughput", 1000.0)]);
        assert!(impact_score(&before, &after) > 0.0);

        let after = metrics(&[("throughput", 100.0)]);
        assert!(impact_score(&before, &after) < 0.0);
    }

    #[test]
    fn test_impact_clamped_and_empty_overlap_is_zero() {
        let before = metrics(&[("error_rate", 0.01)]);
        let after = metrics(&[("error_rate", 5.0)]);
        assert!((impact_score(&before, &after) - (-1.0)).abs() < f64::EPSILON);

        let disjoint = metrics(&[("memory", 1.0)]);
        assert!((impact_score(&before, &disjoint)).abs() < f64::EPSILON);
    }

    #[test]
    fn test_zero_baseline_counts_as_full_change() {
        let before = metrics(&[("error_rate", 0.0)]);
        let after = metrics(&[("error_rate", 0.5)]);
        // change = +1.0, weight 0.30, scaled by 5 and clamped.
        assert!((impact_score(&before, &after) - (-1.0)).abs() < f64::EPSILON);
    }

    #[test]
    fn test_drift_threshold() {
        let before = metrics(&[("cpu", 100.0)]);
        let barely = metrics(&[("cpu", 119.0)]);
        assert!(detect_drift(&before, &barely).is_none());

        let over = metrics(&[("cpu", 125.0)]);
        let details = detect_drift(&before, &over).unwrap();
        assert_eq!(details.severity, DriftSeverity::Low);
        assert_eq!(details.drift_type, DriftType::ResourceDrift);
        assert_eq!(details.metrics_drifted.len(), 1);
    }

    #[test]
    fn test_no_common_metrics_is_no_drift() {
        let before = metrics(&[("cpu", 100.0)]);
        let after = metrics(&[("latency", 100.0)]);
        assert!(detect_drift(&before, &after).is_none());
    }

    #[test]
    fn test_severity_ladder() {
        // Two drifted but non-critical metrics: medium.
        let before = metrics(&[("cpu", 100.0), ("latency", 100.0)]);
        let after = metrics(&[("cpu", 130.0), ("latency", 130.0)]);
        let details = detect_drift(&before, &after).unwrap();
        assert_eq!(details.severity, DriftSeverity::Medium);

        // One critical metric (but within 80%): high.
        let after = metrics(&[("cpu", 170.0), ("latency", 100.0)]);
        let details = detect_drift(&before, &after).unwrap();
        assert_eq!(details.severity, DriftSeverity::High);

        // Two critical metrics: critical.
        let after = metrics(&[("cpu", 200.0), ("latency", 200.0)]);
        let details = detect_drift(&before, &after).unwrap();
        assert_eq!(details.severity, DriftSeverity::Critical);
    }

    #[test]
    fn test_error_drift_wins_classification() {
        let before = metrics(&[("error_rate", 0.01), ("latency", 200.0), ("cpu", 50.0)]);
        let after = metrics(&[("error_rate", 0.30), ("latency", 1500.0), ("cpu", 95.0)]);
        let details = detect_drift(&before, &after).unwrap();
        assert_eq!(details.drift_type, DriftType::ErrorDrift);
    }

    #[test]
    fn test_rollback_gate() {
        // Strongly negative impact alone.
        assert!(should_rollback(-0.8, None));
        assert!(!should_rollback(-0.6, None));

        let high = DriftDetails {
            drift_type: DriftType::PerformanceDrift,
            severity: DriftSeverity::High,
            metrics_drifted: vec![],
            threshold_violated: 0.6,
            description: String::new(),
        };
        assert!(should_rollback(-0.5, Some(&high)));
        assert!(!should_rollback(-0.3, Some(&high)));

        let medium = DriftDetails {
            severity: DriftSeverity::Medium,
            ..high.clone()
        };
        assert!(!should_rollback(-0.5, Some(&medium)));

        let critical = DriftDetails {
            severity: DriftSeverity::Critical,
            ..high
        };
        assert!(should_rollback(0.2, Some(&critical)));
    }

    #[test]
    fn test_post_action_regression_recommends_rollback() {
        let before = metrics(&[
            ("cpu", 50.0),
            ("latency", 200.0),
            ("error_rate", 0.01),
            ("throughput", 1000.0),
        ]);
        let after = metrics(&[
            ("cpu", 95.0),
            ("latency", 1500.0),
            ("error_rate", 0.30),
            ("throughput", 400.0),
        ]);

        let impact = impact_score(&before, &after);
        let drift = detect_drift(&before, &after).unwrap();

        assert!(impact < -0.5, "impact {impact}");
        assert_eq!(drift.severity, DriftSeverity::Critical);
        assert!(should_rollback(impact, Some(&drift)));
    }
}
