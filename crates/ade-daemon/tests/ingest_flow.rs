//! Ingestion contract: idempotency, validation closure, batch partial
//! success.

mod common;

use ade_core::error::ErrorKind;
use common::{harness, metrics_request};

#[tokio::test]
async fn ingest_is_idempotent_on_key() {
    let h = harness();

    // Same idempotency key, different event IDs.
    let mut first = metrics_request("svc-a", "key-1", 50.0, 100.0, 0.01, 500.0);
    let mut second = metrics_request("svc-a", "key-1", 60.0, 120.0, 0.02, 600.0);
    first.event_id = "evt-first".to_string();
    second.event_id = "evt-second".to_string();

    let r1 = h.ingest.ingest(&first).await.unwrap();
    let r2 = h.ingest.ingest(&second).await.unwrap();

    assert!(r1.stored);
    assert!(!r1.duplicate);
    assert!(r2.stored);
    assert!(r2.duplicate);

    // Exactly one row was admitted.
    assert_eq!(h.events.count_for_service("svc-a").await.unwrap(), 1);
    // The stored row is the first writer's.
    let stored = h.events.get_by_event_id("evt-first").await.unwrap();
    assert_eq!(stored.idempotency_key, "key-1");
    assert!(h.events.get_by_event_id("evt-second").await.is_err());
}

#[tokio::test]
async fn unknown_event_type_is_validation_error() {
    let h = harness();
    let mut request = metrics_request("svc-a", "key-1", 50.0, 100.0, 0.01, 500.0);

    for bad in ["log", "metric", "ALERT", ""] {
        request.event_type = bad.to_string();
        let err = h.ingest.ingest(&request).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation, "{bad}");
    }
}

#[tokio::test]
async fn out_of_range_metrics_are_validation_errors() {
    let h = harness();

    let cases = [
        ("cpu-high", 150.0, 100.0, 0.01, 500.0),
        ("cpu-low", -5.0, 100.0, 0.01, 500.0),
        ("latency-neg", 50.0, -1.0, 0.01, 500.0),
        ("error-high", 50.0, 100.0, 1.5, 500.0),
        ("rps-neg", 50.0, 100.0, 0.01, -10.0),
    ];
    for (key, cpu, latency, error_rate, rps) in cases {
        let request = metrics_request("svc-a", key, cpu, latency, error_rate, rps);
        let err = h.ingest.ingest(&request).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation, "{key}");
    }

    assert_eq!(h.events.count_for_service("svc-a").await.unwrap(), 0);
}

#[tokio::test]
async fn missing_fields_are_validation_errors() {
    let h = harness();

    let mut request = metrics_request("svc-a", "key-1", 50.0, 100.0, 0.01, 500.0);
    request.event_id = String::new();
    assert_eq!(
        h.ingest.ingest(&request).await.unwrap_err().kind(),
        ErrorKind::Validation
    );

    let mut request = metrics_request("svc-a", "key-2", 50.0, 100.0, 0.01, 500.0);
    request.service_id = String::new();
    assert_eq!(
        h.ingest.ingest(&request).await.unwrap_err().kind(),
        ErrorKind::Validation
    );
}

#[tokio::test]
async fn batch_has_partial_success_in_order() {
    let h = harness();

    let good_a = metrics_request("svc-a", "key-a", 50.0, 100.0, 0.01, 500.0);
    let mut bad = metrics_request("svc-a", "key-b", 150.0, 100.0, 0.01, 500.0);
    bad.event_id = "evt-bad".to_string();
    let good_c = metrics_request("svc-a", "key-c", 60.0, 110.0, 0.02, 600.0);

    let responses = h
        .ingest
        .ingest_batch(&[good_a.clone(), bad.clone(), good_c.clone()])
        .await;

    assert_eq!(responses.len(), 3);
    assert_eq!(responses[0].event_id, good_a.event_id);
    assert_eq!(responses[1].event_id, bad.event_id);
    assert_eq!(responses[2].event_id, good_c.event_id);

    assert!(responses[0].stored);
    assert!(!responses[1].stored);
    assert_eq!(responses[1].status, "error");
    assert!(responses[1].error.is_some());
    assert!(responses[2].stored);

    // The failed item never aborted its successors.
    assert_eq!(h.events.count_for_service("svc-a").await.unwrap(), 2);
}

#[tokio::test]
async fn alert_events_are_admitted_with_known_severity() {
    let h = harness();

    let mut request = metrics_request("svc-a", "key-alert", 0.0, 0.0, 0.0, 0.0);
    request.event_type = "alert".to_string();
    request.payload = serde_json::json!({
        "alert_type": "latency_budget",
        "severity": "critical",
        "message": "p99 over budget"
    });

    let response = h.ingest.ingest(&request).await.unwrap();
    assert!(response.stored);
    assert!(!response.duplicate);

    request.idempotency_key = "key-alert-2".to_string();
    request.event_id = "evt-alert-2".to_string();
    request.payload = serde_json::json!({
        "alert_type": "latency_budget",
        "severity": "apocalyptic"
    });
    assert_eq!(
        h.ingest.ingest(&request).await.unwrap_err().kind(),
        ErrorKind::Validation
    );
}
