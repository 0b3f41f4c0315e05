//! The HTTP API surface.
//!
//! Thin axum handlers over the services; every error carries its taxonomy
//! kind and maps to the documented status code at this boundary. Handlers
//! never leak internal detail for `Internal` failures.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::error;

use ade_core::decision::DecisionFilters;
use ade_core::error::ErrorKind;
use ade_core::policy::Policy;
use ade_core::simulation::SimulationRequest;

use crate::action::{ActionError, ActionRequest, ActionRuntime};
use crate::decision::{DecisionError, DecisionRequest, DecisionService};
use crate::feedback::{FeedbackRequest, FeedbackService, FeedbackServiceError, RollbackRequest};
use crate::ingest::{IngestError, IngestRequest, IngestService};
use crate::policy_cache::PolicyCache;
use crate::simulation::{SimulationService, SimulationServiceError};
use crate::state::{FeatureService, StateError};
use crate::storage::{Database, PolicyStore, StorageError};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// Event ingestion.
    pub ingest: Arc<IngestService>,
    /// Feature derivation and state lookup.
    pub features: Arc<FeatureService>,
    /// Decision evaluation and replay.
    pub decisions: Arc<DecisionService>,
    /// Action execution and scheduling.
    pub actions: Arc<ActionRuntime>,
    /// Feedback and rollback.
    pub feedback: Arc<FeedbackService>,
    /// Monte Carlo simulation.
    pub simulations: Arc<SimulationService>,
    /// In-memory policy cache.
    pub policies: Arc<PolicyCache>,
    /// Policy persistence.
    pub policy_store: PolicyStore,
    /// Readiness probe target.
    pub db: Database,
}

/// Builds the full API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ingest", post(ingest_one))
        .route("/ingest/batch", post(ingest_batch))
        .route(
            "/services/{id}/features/calculate",
            post(calculate_features),
        )
        .route("/services/{id}/state", get(service_state))
        .route("/evaluate", post(evaluate))
        .route("/decisions", get(list_decisions))
        .route("/decisions/{id}/replay", post(replay_decision))
        .route("/simulations/run", post(run_simulation))
        .route("/simulations/{id}", get(get_simulation))
        .route("/actions/execute", post(execute_action))
        .route("/actions/schedule", post(schedule_action))
        .route("/actions/batch", post(execute_action_batch))
        .route("/feedback", post(record_feedback))
        .route("/rollback", post(rollback))
        .route("/policies", put(put_policy))
        .route("/policies/{id}", get(get_policy))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .with_state(state)
}

/// API-boundary error: a taxonomy kind plus a caller-safe message.
#[derive(Debug)]
pub struct ApiError {
    kind: ErrorKind,
    message: String,
}

impl ApiError {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    const fn status(&self) -> StatusCode {
        match self.kind {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            // Duplicates are idempotent successes by contract.
            ErrorKind::Duplicate => StatusCode::OK,
            ErrorKind::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Upstream => StatusCode::BAD_GATEWAY,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    kind: ErrorKind,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if self.kind == ErrorKind::Internal {
            // Full context goes to the log, not the caller.
            error!(error = %self.message, "internal error");
            "internal error".to_string()
        } else {
            self.message
        };
        (
            status,
            Json(ErrorBody {
                error: message,
                kind: self.kind,
            }),
        )
            .into_response()
    }
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

impl From<StateError> for ApiError {
    fn from(e: StateError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

impl From<DecisionError> for ApiError {
    fn from(e: DecisionError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

impl From<ActionError> for ApiError {
    fn from(e: ActionError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

impl From<FeedbackServiceError> for ApiError {
    fn from(e: FeedbackServiceError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

impl From<SimulationServiceError> for ApiError {
    fn from(e: SimulationServiceError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

async fn ingest_one(
    State(state): State<AppState>,
    Json(request): Json<IngestRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let response = state.ingest.ingest(&request).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

async fn ingest_batch(
    State(state): State<AppState>,
    Json(requests): Json<Vec<IngestRequest>>,
) -> impl IntoResponse {
    let responses = state.ingest.ingest_batch(&requests).await;
    (StatusCode::ACCEPTED, Json(responses))
}

#[derive(Deserialize)]
struct WindowParams {
    window: Option<String>,
}

async fn calculate_features(
    State(state): State<AppState>,
    Path(service_id): Path<String>,
    Query(params): Query<WindowParams>,
) -> Result<impl IntoResponse, ApiError> {
    let window = params
        .window
        .map(|raw| {
            humantime::parse_duration(&raw).map_err(|e| {
                ApiError::new(ErrorKind::Validation, format!("invalid window {raw:?}: {e}"))
            })
        })
        .transpose()?;
    let calculated = state.features.calculate(&service_id, window).await?;
    Ok(Json(calculated))
}

async fn service_state(
    State(state): State<AppState>,
    Path(service_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state.features.current_state(&service_id).await?;
    Ok(Json(snapshot))
}

async fn evaluate(
    State(state): State<AppState>,
    Json(request): Json<DecisionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let response = state.decisions.evaluate(&request).await?;
    Ok(Json(response))
}

async fn list_decisions(
    State(state): State<AppState>,
    Query(filters): Query<DecisionFilters>,
) -> Result<impl IntoResponse, ApiError> {
    let records = state.decisions.list(&filters).await?;
    Ok(Json(records))
}

#[derive(Default, Deserialize)]
struct ReplayBody {
    policy_id: Option<String>,
    policy_version: Option<String>,
}

async fn replay_decision(
    State(state): State<AppState>,
    Path(decision_id): Path<String>,
    body: Option<Json<ReplayBody>>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(body) = body.unwrap_or_default();
    let result = state
        .decisions
        .replay(
            &decision_id,
            body.policy_id.as_deref(),
            body.policy_version.as_deref(),
        )
        .await?;
    Ok(Json(result))
}

async fn run_simulation(
    State(state): State<AppState>,
    Json(request): Json<SimulationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let response = state.simulations.run(&request).await?;
    Ok(Json(response))
}

async fn get_simulation(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state.simulations.get(&run_id).await?;
    Ok(Json(run))
}

async fn execute_action(
    State(state): State<AppState>,
    Json(request): Json<ActionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let dry_run = request.dry_run;
    let result = state.actions.execute(&request).await?;
    let status = if dry_run {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(result)))
}

async fn schedule_action(
    State(state): State<AppState>,
    Json(request): Json<ActionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let result = state.actions.schedule(&request).await?;
    Ok((StatusCode::ACCEPTED, Json(result)))
}

async fn execute_action_batch(
    State(state): State<AppState>,
    Json(requests): Json<Vec<ActionRequest>>,
) -> impl IntoResponse {
    let results = state.actions.execute_batch(&requests).await;
    Json(results)
}

async fn record_feedback(
    State(state): State<AppState>,
    Json(request): Json<FeedbackRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state.feedback.record(&request).await?;
    Ok(Json(record))
}

async fn rollback(
    State(state): State<AppState>,
    Json(request): Json<RollbackRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let result = state.feedback.rollback(&request).await?;
    Ok(Json(result))
}

async fn put_policy(
    State(state): State<AppState>,
    Json(policy): Json<Policy>,
) -> Result<impl IntoResponse, ApiError> {
    policy
        .validate()
        .map_err(|e| ApiError::new(e.kind(), e.to_string()))?;
    state.policy_store.upsert(&policy).await?;
    state
        .policies
        .put(policy.clone())
        .map_err(|e| ApiError::new(e.kind(), e.to_string()))?;
    Ok(Json(policy))
}

async fn get_policy(
    State(state): State<AppState>,
    Path(policy_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(policy) = state.policies.get(&policy_id) {
        return Ok(Json((*policy).clone()));
    }
    let policy = state.policy_store.get(&policy_id, None).await?;
    Ok(Json(policy))
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
}

async fn health() -> impl IntoResponse {
    Json(HealthBody { status: "ok" })
}

async fn ready(State(state): State<AppState>) -> Response {
    match state.db.ping().await {
        Ok(()) => (StatusCode::OK, Json(HealthBody { status: "ready" })).into_response(),
        Err(e) => {
            error!(error = %e, "readiness probe failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthBody {
                    status: "degraded",
                }),
            )
                .into_response()
        },
    }
}
