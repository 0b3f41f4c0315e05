//! Action runtime scenarios: dry-run suppression, retry ceiling, terminal
//! 4xx, circuit breaking, scheduling.

mod common;

use std::time::Duration;

use chrono::Utc;

use ade_core::action::ActionStatus;
use ade_core::breaker::BreakerConfig;
use ade_core::error::ErrorKind;
use ade_core::policy::ActionType;
use common::{harness, harness_with, seed_decision};

use ade_daemon::action::ActionRequest;

fn action_request(action_id: &str, decision_id: &str) -> ActionRequest {
    ActionRequest {
        action_id: action_id.to_string(),
        decision_id: decision_id.to_string(),
        action_type: ActionType::ScaleUp,
        target_service: "svc-a".to_string(),
        payload: serde_json::json!({"replicas": 3}),
        dry_run: false,
        scheduled_at: None,
        webhook_url: None,
    }
}

#[tokio::test]
async fn dry_run_records_without_delivery() {
    let h = harness();
    seed_decision(&h, "dec-1", "svc-a").await;

    let mut request = action_request("act-1", "dec-1");
    request.dry_run = true;

    let result = h.runtime.execute(&request).await.unwrap();

    assert_eq!(result.status, ActionStatus::DryRun);
    assert!(result.dry_run);
    let metadata = result.metadata.unwrap();
    assert_eq!(metadata["message"], "action would have been executed");

    // Nothing left the process.
    assert_eq!(h.transport.calls(), 0);

    let record = h.actions.get("act-1").await.unwrap();
    assert_eq!(record.status, ActionStatus::DryRun);
}

#[tokio::test]
async fn successful_delivery_completes_with_envelope() {
    let h = harness();
    seed_decision(&h, "dec-1", "svc-a").await;

    let result = h.runtime.execute(&action_request("act-1", "dec-1")).await.unwrap();

    assert_eq!(result.status, ActionStatus::Completed);
    assert_eq!(result.response_code, Some(200));

    let deliveries = h.transport.deliveries();
    assert_eq!(deliveries.len(), 1);
    let delivery = &deliveries[0];
    assert_eq!(delivery.webhook_id, "act-1");
    assert_eq!(delivery.payload["action_id"], "act-1");
    assert_eq!(delivery.payload["decision_id"], "dec-1");
    assert_eq!(delivery.payload["action_type"], "scale_up");
    assert_eq!(delivery.payload["target_service"], "svc-a");
    assert!(delivery
        .headers
        .iter()
        .any(|(name, value)| name == "X-Action-Type" && value == "scale_up"));
    assert!(delivery
        .headers
        .iter()
        .any(|(name, value)| name == "X-Service-ID" && value == "svc-a"));
}

#[tokio::test]
async fn persistent_503_is_attempted_retries_plus_one_then_failed() {
    let h = harness_with(vec![503], 3, BreakerConfig::default());
    seed_decision(&h, "dec-1", "svc-a").await;

    let err = h
        .runtime
        .execute(&action_request("act-1", "dec-1"))
        .await
        .unwrap_err();

    assert_eq!(h.transport.calls(), 4);
    assert_eq!(err.kind(), ErrorKind::Upstream);

    let record = h.actions.get("act-1").await.unwrap();
    assert_eq!(record.status, ActionStatus::Failed);
    assert_eq!(record.retry_count, 3);
    assert!(record.error_message.is_some());
}

#[tokio::test]
async fn terminal_400_is_attempted_once() {
    let h = harness_with(vec![400], 3, BreakerConfig::default());
    seed_decision(&h, "dec-1", "svc-a").await;

    let err = h
        .runtime
        .execute(&action_request("act-1", "dec-1"))
        .await
        .unwrap_err();

    assert_eq!(h.transport.calls(), 1);
    assert_eq!(err.kind(), ErrorKind::Upstream);

    let record = h.actions.get("act-1").await.unwrap();
    assert_eq!(record.status, ActionStatus::Failed);
    assert_eq!(record.retry_count, 0);
}

#[tokio::test]
async fn breaker_opens_then_rejects_without_delivery() {
    let h = harness_with(
        vec![500],
        0,
        BreakerConfig {
            max_failures: 2,
            reset_timeout: Duration::from_secs(3600),
            half_open_max_calls: 3,
        },
    );
    seed_decision(&h, "dec-1", "svc-a").await;

    assert!(h.runtime.execute(&action_request("act-1", "dec-1")).await.is_err());
    assert!(h.runtime.execute(&action_request("act-2", "dec-1")).await.is_err());
    assert_eq!(h.transport.calls(), 2);

    // Third call: rejected by the open breaker, no request issued.
    let err = h
        .runtime
        .execute(&action_request("act-3", "dec-1"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CircuitOpen);
    assert_eq!(h.transport.calls(), 2);

    let record = h.actions.get("act-3").await.unwrap();
    assert_eq!(record.status, ActionStatus::Failed);
}

#[tokio::test]
async fn batch_failures_do_not_abort_the_batch() {
    // First delivery exhausts against 503s (one attempt), the second
    // succeeds.
    let h = harness_with(vec![503, 200], 0, BreakerConfig::default());
    seed_decision(&h, "dec-1", "svc-a").await;

    let results = h
        .runtime
        .execute_batch(&[
            action_request("act-1", "dec-1"),
            action_request("act-2", "dec-1"),
        ])
        .await;

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].action_id, "act-1");
    assert_eq!(results[0].status, ActionStatus::Failed);
    assert!(results[0].error_message.is_some());
    assert_eq!(results[1].action_id, "act-2");
    assert_eq!(results[1].status, ActionStatus::Completed);
}

#[tokio::test]
async fn schedule_requires_due_instant_and_executes_when_due() {
    let h = harness();
    seed_decision(&h, "dec-1", "svc-a").await;

    // Missing scheduled_at is a validation error.
    let err = h
        .runtime
        .schedule(&action_request("act-1", "dec-1"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    // Wire the dispatch loop the way the daemon does.
    let runtime = std::sync::Arc::downgrade(&h.runtime);
    h.scheduler.start(move |job| {
        let runtime = runtime.clone();
        async move {
            if let Some(runtime) = runtime.upgrade() {
                runtime.handle_due_job(job).await;
            }
        }
    });

    let mut request = action_request("act-2", "dec-1");
    request.scheduled_at = Some(Utc::now());
    let result = h.runtime.schedule(&request).await.unwrap();
    assert_eq!(result.status, ActionStatus::Scheduled);

    let record = h.actions.get("act-2").await.unwrap();
    assert_eq!(record.status, ActionStatus::Scheduled);

    // The 10ms-tick scheduler picks it up almost immediately.
    let mut status = ActionStatus::Scheduled;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        status = h.actions.get("act-2").await.unwrap().status;
        if status == ActionStatus::Completed {
            break;
        }
    }
    assert_eq!(status, ActionStatus::Completed);
    assert_eq!(h.transport.calls(), 1);

    h.scheduler.stop().await;
}

#[tokio::test]
async fn cancel_removes_scheduled_action() {
    let h = harness();
    seed_decision(&h, "dec-1", "svc-a").await;

    let mut request = action_request("act-1", "dec-1");
    request.scheduled_at = Some(Utc::now() + chrono::Duration::hours(1));
    h.runtime.schedule(&request).await.unwrap();

    assert!(h.runtime.cancel("act-1").await.unwrap());
    let record = h.actions.get("act-1").await.unwrap();
    assert_eq!(record.status, ActionStatus::Cancelled);
    assert_eq!(h.scheduler.pending(), 0);
}

#[tokio::test]
async fn missing_fields_are_validation_errors() {
    let h = harness();

    let mut request = action_request("", "dec-1");
    request.action_id = String::new();
    assert_eq!(
        h.runtime.execute(&request).await.unwrap_err().kind(),
        ErrorKind::Validation
    );

    let mut request = action_request("act-1", "dec-1");
    request.target_service = String::new();
    assert_eq!(
        h.runtime.execute(&request).await.unwrap_err().kind(),
        ErrorKind::Validation
    );
}
