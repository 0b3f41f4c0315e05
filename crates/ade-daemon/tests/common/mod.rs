//! Shared test harness: in-memory storage, a scripted webhook transport,
//! and the full service graph wired the way the daemon wires it.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;

use ade_core::breaker::BreakerConfig;
use ade_core::decision::{DecisionRecord, DecisionResult};
use ade_core::policy::{Policy, PolicyType};
use ade_core::scheduler::Scheduler;
use ade_core::webhook::{
    DeliveryRequest, Transport, TransportError, TransportResponse, WebhookClient, WebhookConfig,
};

use ade_daemon::action::ActionRuntime;
use ade_daemon::decision::DecisionService;
use ade_daemon::feedback::FeedbackService;
use ade_daemon::ingest::{IngestService, LogPublisher};
use ade_daemon::policy_cache::PolicyCache;
use ade_daemon::simulation::SimulationService;
use ade_daemon::state::FeatureService;
use ade_daemon::storage::{
    ActionStore, Database, DecisionStore, EventStore, FeatureStore, FeedbackStore, PolicyStore,
    SimulationStore,
};

/// Webhook transport that replays a scripted status sequence, repeating the
/// final entry once exhausted, and records every delivery it sees.
pub struct MockTransport {
    script: Mutex<VecDeque<u16>>,
    last: u16,
    calls: AtomicU32,
    seen: Mutex<Vec<DeliveryRequest>>,
}

impl MockTransport {
    pub fn returning(script: Vec<u16>) -> Arc<Self> {
        let last = *script.last().unwrap_or(&200);
        Arc::new(Self {
            script: Mutex::new(script.into()),
            last,
            calls: AtomicU32::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn deliveries(&self) -> Vec<DeliveryRequest> {
        self.seen.lock().unwrap().clone()
    }
}

impl Transport for MockTransport {
    fn send<'a>(
        &'a self,
        request: &'a DeliveryRequest,
        _timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<TransportResponse, TransportError>> + Send + 'a>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(request.clone());
            let status = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(self.last);
            Ok(TransportResponse {
                status,
                body: format!("status {status}"),
            })
        })
    }
}

/// The wired service graph over an in-memory database.
pub struct Harness {
    pub db: Database,
    pub events: EventStore,
    pub decisions: DecisionStore,
    pub actions: ActionStore,
    pub policy_store: PolicyStore,
    pub ingest: Arc<IngestService>,
    pub features: Arc<FeatureService>,
    pub decision_service: Arc<DecisionService>,
    pub runtime: Arc<ActionRuntime>,
    pub feedback: Arc<FeedbackService>,
    pub simulations: Arc<SimulationService>,
    pub policy_cache: Arc<PolicyCache>,
    pub scheduler: Arc<Scheduler>,
    pub transport: Arc<MockTransport>,
}

/// Builds a harness with a default webhook destination, fast retries and
/// the given transport script / breaker settings.
pub fn harness_with(script: Vec<u16>, max_retries: u32, breaker: BreakerConfig) -> Harness {
    let db = Database::open_in_memory().expect("in-memory database");

    let events = EventStore::new(db.clone());
    let snapshots = FeatureStore::new(db.clone());
    let policy_store = PolicyStore::new(db.clone());
    let decisions = DecisionStore::new(db.clone());
    let actions = ActionStore::new(db.clone());
    let feedback_store = FeedbackStore::new(db.clone());
    let simulation_store = SimulationStore::new(db.clone());

    let ingest = Arc::new(IngestService::new(events.clone(), Arc::new(LogPublisher)));
    let window = Duration::from_secs(5 * 60);
    let features = Arc::new(FeatureService::new(
        events.clone(),
        snapshots,
        window,
        1000,
    ));

    let policy_cache = Arc::new(PolicyCache::new());
    let decision_service = Arc::new(DecisionService::new(
        decisions.clone(),
        policy_store.clone(),
        Arc::clone(&policy_cache),
        Arc::clone(&features),
        events.clone(),
        window,
    ));

    let transport = MockTransport::returning(script);
    let webhook = WebhookClient::new(
        Arc::clone(&transport) as Arc<dyn Transport>,
        WebhookConfig {
            timeout: Duration::from_secs(1),
            max_retries,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        },
        breaker,
    );

    let scheduler = Arc::new(Scheduler::with_tick(Duration::from_millis(10)));
    let runtime = Arc::new(ActionRuntime::new(
        actions.clone(),
        webhook,
        Arc::clone(&scheduler),
        Some("http://orchestrator.internal/hooks".to_string()),
    ));
    let feedback = Arc::new(FeedbackService::new(feedback_store, Arc::clone(&runtime)));
    let simulations = Arc::new(SimulationService::new(simulation_store, 10_000));

    Harness {
        db,
        events,
        decisions,
        actions,
        policy_store,
        ingest,
        features,
        decision_service,
        runtime,
        feedback,
        simulations,
        policy_cache,
        scheduler,
        transport,
    }
}

/// Harness with an always-200 destination.
pub fn harness() -> Harness {
    harness_with(vec![200], 3, BreakerConfig::default())
}

/// The autoscale policy used by the decision scenarios.
pub fn autoscale_policy() -> Policy {
    serde_json::from_value(serde_json::json!({
        "id": "pol-autoscale",
        "version": "1",
        "name": "autoscale baseline",
        "type": "autoscale",
        "rules": [
            {
                "id": "emergency_scale_up",
                "name": "Emergency scale up",
                "priority": 100,
                "when": {"all": [{"fact": "cpu", "op": ">=", "value": 90}]},
                "action": {"type": "scale_up"}
            },
            {
                "id": "drain_idle",
                "name": "Scale down when idle",
                "priority": 10,
                "when": {"all": [{"fact": "cpu", "op": "<", "value": 20}]},
                "action": {"type": "scale_down"}
            }
        ]
    }))
    .expect("policy document")
}

/// Seeds a decision row so action records can reference it.
pub async fn seed_decision(harness: &Harness, decision_id: &str, service_id: &str) {
    let record = DecisionRecord {
        decision_id: decision_id.to_string(),
        idempotency_key: format!("seed-{decision_id}"),
        service_id: service_id.to_string(),
        policy_id: "pol-autoscale".to_string(),
        policy_version: "1".to_string(),
        snapshot_id: format!("snap-{service_id}-seed"),
        decision_type: PolicyType::Autoscale,
        decision_result: DecisionResult::Allow,
        actions: Vec::new(),
        confidence_score: 0.9,
        simulation_run_id: None,
        dry_run: false,
        executed_at: Utc::now(),
    };
    harness
        .decisions
        .insert(&record)
        .await
        .expect("seed decision");
}

/// A metrics ingest request for `service_id`.
pub fn metrics_request(
    service_id: &str,
    key: &str,
    cpu: f64,
    latency_ms: f64,
    error_rate: f64,
    rps: f64,
) -> ade_daemon::ingest::IngestRequest {
    ade_daemon::ingest::IngestRequest {
        event_id: format!("evt-{key}"),
        idempotency_key: key.to_string(),
        service_id: service_id.to_string(),
        event_type: "metrics".to_string(),
        payload: serde_json::json!({
            "cpu": cpu,
            "latency_ms": latency_ms,
            "error_rate": error_rate,
            "requests_per_second": rps,
            "queue_depth": 5
        }),
        timestamp: Some(Utc::now()),
    }
}
