//! Feedback scenarios: drift-driven rollback recommendation, gated and
//! forced rollback execution, non-invertible actions.

mod common;

use std::collections::BTreeMap;

use ade_core::error::ErrorKind;
use ade_core::feedback::DriftSeverity;
use ade_core::policy::ActionType;
use common::{harness, seed_decision, Harness};

use ade_daemon::action::ActionRequest;
use ade_daemon::feedback::{FeedbackRequest, RollbackRequest};

fn metrics(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
    pairs.iter().map(|(k, v)| ((*k).to_string(), *v)).collect()
}

fn feedback_request(action_id: &str) -> FeedbackRequest {
    FeedbackRequest {
        action_id: action_id.to_string(),
        decision_id: "dec-1".to_string(),
        service_id: "svc-a".to_string(),
        feedback_type: "immediate".to_string(),
        metrics_before: metrics(&[
            ("cpu", 50.0),
            ("latency", 200.0),
            ("error_rate", 0.01),
            ("throughput", 1000.0),
        ]),
        metrics_after: metrics(&[
            ("cpu", 95.0),
            ("latency", 1500.0),
            ("error_rate", 0.30),
            ("throughput", 400.0),
        ]),
        observation_window_minutes: None,
    }
}

/// Executes a scale-up action so there is something to roll back.
async fn executed_action(h: &Harness, action_id: &str) {
    seed_decision(h, "dec-1", "svc-a").await;
    let request = ActionRequest {
        action_id: action_id.to_string(),
        decision_id: "dec-1".to_string(),
        action_type: ActionType::ScaleUp,
        target_service: "svc-a".to_string(),
        payload: serde_json::json!({"replicas": 3}),
        dry_run: false,
        scheduled_at: None,
        webhook_url: None,
    };
    h.runtime.execute(&request).await.unwrap();
}

#[tokio::test]
async fn regression_after_action_recommends_rollback() {
    let h = harness();
    executed_action(&h, "act-1").await;

    let record = h.feedback.record(&feedback_request("act-1")).await.unwrap();

    assert!(record.drift_detected);
    let drift = record.drift_details.as_ref().unwrap();
    assert_eq!(drift.severity, DriftSeverity::Critical);
    assert!(record.impact_score < -0.5, "impact {}", record.impact_score);
    assert!(record.rollback_recommended);
    assert!(!record.rollback_executed);
    assert_eq!(record.observation_window_minutes, 5);
}

#[tokio::test]
async fn improvement_does_not_recommend_rollback() {
    let h = harness();
    executed_action(&h, "act-1").await;

    let mut request = feedback_request("act-1");
    request.metrics_after = metrics(&[
        ("cpu", 45.0),
        ("latency", 180.0),
        ("error_rate", 0.005),
        ("throughput", 1100.0),
    ]);
    let record = h.feedback.record(&request).await.unwrap();

    assert!(!record.drift_detected);
    assert!(record.impact_score > 0.0);
    assert!(!record.rollback_recommended);
}

#[tokio::test]
async fn rollback_delivers_the_inverse_action() {
    let h = harness();
    executed_action(&h, "act-1").await;
    h.feedback.record(&feedback_request("act-1")).await.unwrap();

    let calls_before = h.transport.calls();
    let result = h
        .feedback
        .rollback(&RollbackRequest {
            action_id: "act-1".to_string(),
            reason: "post-action regression".to_string(),
            force: false,
        })
        .await
        .unwrap();

    assert_eq!(result.action_id, "act-1");
    assert_eq!(result.status, "completed");

    // Exactly one additional delivery: the scale-down inverse.
    assert_eq!(h.transport.calls(), calls_before + 1);
    let deliveries = h.transport.deliveries();
    let inverse = deliveries.last().unwrap();
    assert_eq!(inverse.payload["action_type"], "scale_down");
    assert_eq!(inverse.payload["target_service"], "svc-a");

    let inverse_record = h.actions.get(&result.inverse_action_id).await.unwrap();
    assert_eq!(inverse_record.action_type, ActionType::ScaleDown);
}

#[tokio::test]
async fn unrecommended_rollback_requires_force() {
    let h = harness();
    executed_action(&h, "act-1").await;

    // Benign feedback: no recommendation.
    let mut request = feedback_request("act-1");
    request.metrics_after = request.metrics_before.clone();
    h.feedback.record(&request).await.unwrap();

    let refused = h
        .feedback
        .rollback(&RollbackRequest {
            action_id: "act-1".to_string(),
            reason: "operator whim".to_string(),
            force: false,
        })
        .await
        .unwrap_err();
    assert_eq!(refused.kind(), ErrorKind::Validation);

    // Force bypasses the gate.
    let forced = h
        .feedback
        .rollback(&RollbackRequest {
            action_id: "act-1".to_string(),
            reason: "operator override".to_string(),
            force: true,
        })
        .await
        .unwrap();
    assert_eq!(forced.status, "completed");
}

#[tokio::test]
async fn webhook_actions_are_not_rollbackable() {
    let h = harness();
    seed_decision(&h, "dec-1", "svc-a").await;
    let request = ActionRequest {
        action_id: "act-hook".to_string(),
        decision_id: "dec-1".to_string(),
        action_type: ActionType::Webhook,
        target_service: "svc-a".to_string(),
        payload: serde_json::json!({}),
        dry_run: false,
        scheduled_at: None,
        webhook_url: None,
    };
    h.runtime.execute(&request).await.unwrap();

    let err = h
        .feedback
        .rollback(&RollbackRequest {
            action_id: "act-hook".to_string(),
            reason: String::new(),
            force: true,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(err.to_string().contains("cannot be rolled back"));
}

#[tokio::test]
async fn empty_metric_maps_are_validation_errors() {
    let h = harness();
    executed_action(&h, "act-1").await;

    let mut request = feedback_request("act-1");
    request.metrics_before.clear();
    assert_eq!(
        h.feedback.record(&request).await.unwrap_err().kind(),
        ErrorKind::Validation
    );

    let mut request = feedback_request("act-1");
    request.metrics_after.clear();
    assert_eq!(
        h.feedback.record(&request).await.unwrap_err().kind(),
        ErrorKind::Validation
    );
}

#[tokio::test]
async fn disjoint_metrics_report_no_drift() {
    let h = harness();
    executed_action(&h, "act-1").await;

    let mut request = feedback_request("act-1");
    request.metrics_before = metrics(&[("cpu", 50.0)]);
    request.metrics_after = metrics(&[("memory", 512.0)]);

    // Drift detection that cannot run reports no drift, not an error.
    let record = h.feedback.record(&request).await.unwrap();
    assert!(!record.drift_detected);
    assert!(record.drift_details.is_none());
}
