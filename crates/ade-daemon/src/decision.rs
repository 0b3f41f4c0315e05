//! The decision service: policy resolution, evaluation, idempotent
//! persistence and audit traces, plus decision replay.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use ade_core::decision::{DecisionRecord, DecisionResult, DecisionTrace};
use ade_core::error::ErrorKind;
use ade_core::features::{self, ServiceFeatures};
use ade_core::policy::{Engine, Policy, PolicyError, RuleAction};

use crate::policy_cache::PolicyCache;
use crate::state::{FeatureService, StateError};
use crate::storage::{DecisionInsert, DecisionStore, EventStore, PolicyStore, StorageError};

/// A decision request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRequest {
    /// The service to decide about.
    pub service_id: String,
    /// Policy to evaluate; the most recently stored active policy when
    /// absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
    /// Specific policy version; the active version when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_version: Option<String>,
    /// Features to evaluate against; derived from the live window when
    /// absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<ServiceFeatures>,
    /// Snapshot the supplied features came from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    /// Whether resulting actions must be suppressed.
    #[serde(default)]
    pub dry_run: bool,
    /// Caller-chosen dedup token; at most one record per key.
    pub idempotency_key: String,
}

/// A decision response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionResponse {
    /// Business ID of the decision.
    pub decision_id: String,
    /// The outcome.
    #[serde(rename = "result")]
    pub decision_result: DecisionResult,
    /// Actions emitted by the matching rule; empty on no-match.
    pub actions: Vec<RuleAction>,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Trace ID; absent when this response replays an earlier winner.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// Whether execution was suppressed.
    pub dry_run: bool,
    /// Whether an earlier record with the same idempotency key won.
    pub duplicate: bool,
    /// When the response was produced.
    pub timestamp: DateTime<Utc>,
}

/// Outcome of replaying one stored decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayResult {
    /// The decision replayed.
    pub original_decision_id: String,
    /// ID assigned to the replay evaluation (not persisted).
    pub replay_decision_id: String,
    /// The service decided about.
    pub service_id: String,
    /// The stored outcome.
    pub original_result: DecisionResult,
    /// The re-evaluated outcome.
    pub replay_result: DecisionResult,
    /// Whether the two outcomes agree.
    #[serde(rename = "match")]
    pub matches: bool,
    /// Human-readable differences when they do not.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub differences: Vec<String>,
    /// When the replay ran.
    pub replayed_at: DateTime<Utc>,
}

/// Decision service failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DecisionError {
    /// A required field is empty.
    #[error("{0} is required")]
    MissingField(&'static str),

    /// Policy resolution or validation failed.
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// Feature derivation failed.
    #[error(transparent)]
    State(#[from] StateError),

    /// Persistence failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// No active policy exists for the request.
    #[error("no active policy for service {service_id}")]
    NoActivePolicy {
        /// The service whose decision was requested.
        service_id: String,
    },
}

impl DecisionError {
    /// Taxonomy classification.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingField(_) => ErrorKind::Validation,
            Self::Policy(e) => e.kind(),
            Self::State(e) => e.kind(),
            Self::Storage(e) => e.kind(),
            Self::NoActivePolicy { .. } => ErrorKind::NotFound,
        }
    }
}

/// The decision service.
pub struct DecisionService {
    engine: Engine,
    decisions: DecisionStore,
    policies: PolicyStore,
    policy_cache: Arc<PolicyCache>,
    features: Arc<FeatureService>,
    events: EventStore,
    feature_window: Duration,
}

impl DecisionService {
    /// Creates the service.
    #[must_use]
    pub fn new(
        decisions: DecisionStore,
        policies: PolicyStore,
        policy_cache: Arc<PolicyCache>,
        features: Arc<FeatureService>,
        events: EventStore,
        feature_window: Duration,
    ) -> Self {
        Self {
            engine: Engine::new(),
            decisions,
            policies,
            policy_cache,
            features,
            events,
            feature_window,
        }
    }

    /// Evaluates a decision request, persisting the record and its trace.
    ///
    /// Races on the same idempotency key serialize on the unique constraint;
    /// the losing writer returns the winning record marked `duplicate`.
    ///
    /// # Errors
    ///
    /// Returns [`DecisionError`] for validation, policy-resolution, feature
    /// or storage failures.
    pub async fn evaluate(
        &self,
        request: &DecisionRequest,
    ) -> Result<DecisionResponse, DecisionError> {
        if request.service_id.is_empty() {
            return Err(DecisionError::MissingField("service_id"));
        }
        if request.idempotency_key.is_empty() {
            return Err(DecisionError::MissingField("idempotency_key"));
        }

        let started = std::time::Instant::now();
        let policy = self.resolve_policy(request).await?;

        let (features, snapshot_id) = match &request.features {
            Some(features) => (
                features.clone(),
                request
                    .snapshot_id
                    .clone()
                    .unwrap_or_else(|| format!("snap-{}-inline", request.service_id)),
            ),
            None => {
                let calculated = self
                    .features
                    .calculate(&request.service_id, Some(self.feature_window))
                    .await?;
                (calculated.features, calculated.snapshot_id)
            },
        };

        let (result, visited) = self.engine.evaluate(&policy, &features)?;

        let actions: Vec<RuleAction> = result
            .action
            .clone()
            .map(|mut action| {
                if action.target.is_none() {
                    action.target = Some(request.service_id.clone());
                }
                vec![action]
            })
            .unwrap_or_default();

        let decision_result =
            DecisionResult::for_action(actions.first().map(|a| a.action_type));

        let decision_id = format!("dec-{}", uuid::Uuid::new_v4());
        let trace_id = format!("trace-{}", uuid::Uuid::new_v4());
        let now = Utc::now();

        let record = DecisionRecord {
            decision_id: decision_id.clone(),
            idempotency_key: request.idempotency_key.clone(),
            service_id: request.service_id.clone(),
            policy_id: policy.policy_id.clone(),
            policy_version: policy.version.clone(),
            snapshot_id,
            decision_type: policy.policy_type,
            decision_result,
            actions: actions.clone(),
            confidence_score: result.confidence,
            simulation_run_id: None,
            dry_run: request.dry_run,
            executed_at: now,
        };

        match self.decisions.insert(&record).await? {
            DecisionInsert::Inserted => {},
            DecisionInsert::Duplicate(winner) => {
                info!(
                    idempotency_key = %request.idempotency_key,
                    winner = %winner.decision_id,
                    "duplicate decision request; returning winning record"
                );
                return Ok(response_from_record(&winner, true));
            },
        }

        let execution_time_ms =
            i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
        let trace = DecisionTrace {
            trace_id: trace_id.clone(),
            decision_id: decision_id.clone(),
            policy_id: policy.policy_id.clone(),
            policy_version: policy.version.clone(),
            trace_data: serde_json::to_value(&result).unwrap_or_default(),
            rules_evaluated: serde_json::to_value(&visited).unwrap_or_default(),
            rules_matched: serde_json::to_value(
                result.rule_id.as_deref().map_or(Vec::new(), |id| vec![id]),
            )
            .unwrap_or_default(),
            features_used: serde_json::to_value(&features).unwrap_or_default(),
            execution_time_ms,
        };
        if let Err(e) = self.decisions.insert_trace(&trace).await {
            warn!(decision_id = %decision_id, error = %e, "failed to store decision trace");
        }

        info!(
            decision_id = %decision_id,
            service_id = %request.service_id,
            result = %decision_result,
            matched = result.matched,
            duration_ms = execution_time_ms,
            "decision made"
        );

        Ok(DecisionResponse {
            decision_id,
            decision_result,
            actions,
            confidence: result.confidence,
            trace_id: Some(trace_id),
            dry_run: request.dry_run,
            duplicate: false,
            timestamp: now,
        })
    }

    /// Fetches a stored decision.
    ///
    /// # Errors
    ///
    /// Returns [`DecisionError`] with kind `NotFound` for unknown IDs.
    pub async fn get(&self, decision_id: &str) -> Result<DecisionRecord, DecisionError> {
        Ok(self.decisions.get(decision_id).await?)
    }

    /// Lists stored decisions by filters.
    ///
    /// # Errors
    ///
    /// Returns [`DecisionError`] on storage failure.
    pub async fn list(
        &self,
        filters: &ade_core::decision::DecisionFilters,
    ) -> Result<Vec<DecisionRecord>, DecisionError> {
        Ok(self.decisions.list_by_filters(filters).await?)
    }

    /// Replays a stored decision: re-derives features from the events that
    /// preceded it and re-evaluates the (optionally overridden) policy.
    ///
    /// # Errors
    ///
    /// Returns [`DecisionError`] when the decision, its events or the policy
    /// cannot be loaded.
    pub async fn replay(
        &self,
        decision_id: &str,
        override_policy_id: Option<&str>,
        override_policy_version: Option<&str>,
    ) -> Result<ReplayResult, DecisionError> {
        let original = self.decisions.get(decision_id).await?;

        let window = chrono::Duration::from_std(self.feature_window)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        let from = original.executed_at - window;
        let mut events = self
            .events
            .list_by_service(&original.service_id, from, original.executed_at, 1000)
            .await?;
        events.reverse();

        let replay_features =
            features::build_features(&original.service_id, &events, original.executed_at)
                .map_err(StateError::from)?;

        let policy_id = override_policy_id.unwrap_or(&original.policy_id);
        let policy_version = match override_policy_id {
            // An override without a version means that policy's active
            // version, not the original's.
            Some(_) => override_policy_version,
            None => Some(original.policy_version.as_str()),
        };
        let policy = self.policies.get(policy_id, policy_version).await?;

        let (result, _) = self.engine.evaluate(&policy, &replay_features)?;
        let replay_actions: Vec<RuleAction> =
            result.action.clone().map(|a| vec![a]).unwrap_or_default();
        let replay_result =
            DecisionResult::for_action(replay_actions.first().map(|a| a.action_type));

        let mut differences = Vec::new();
        if original.decision_result != replay_result {
            differences.push(format!(
                "result: {} vs {}",
                original.decision_result, replay_result
            ));
        }
        if original.policy_version != policy.version {
            differences.push(format!(
                "policy_version: {} vs {}",
                original.policy_version, policy.version
            ));
        }
        if original.actions.len() != replay_actions.len() {
            differences.push(format!(
                "action_count: {} vs {}",
                original.actions.len(),
                replay_actions.len()
            ));
        }

        Ok(ReplayResult {
            original_decision_id: original.decision_id,
            replay_decision_id: format!("replay-{}", uuid::Uuid::new_v4()),
            service_id: original.service_id,
            original_result: original.decision_result,
            replay_result,
            matches: differences.is_empty(),
            differences,
            replayed_at: Utc::now(),
        })
    }

    async fn resolve_policy(&self, request: &DecisionRequest) -> Result<Policy, DecisionError> {
        if let Some(policy_id) = &request.policy_id {
            if request.policy_version.is_none() {
                if let Some(cached) = self.policy_cache.get(policy_id) {
                    return Ok((*cached).clone());
                }
            }
            let policy = self
                .policies
                .get(policy_id, request.policy_version.as_deref())
                .await?;
            if request.policy_version.is_none() {
                let _ = self.policy_cache.put(policy.clone());
            }
            return Ok(policy);
        }

        // No policy named: the most recently stored active one.
        self.policies
            .list_active()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| DecisionError::NoActivePolicy {
                service_id: request.service_id.clone(),
            })
    }
}

fn response_from_record(record: &DecisionRecord, duplicate: bool) -> DecisionResponse {
    DecisionResponse {
        decision_id: record.decision_id.clone(),
        decision_result: record.decision_result,
        actions: record.actions.clone(),
        confidence: record.confidence_score,
        trace_id: None,
        dry_run: record.dry_run,
        duplicate,
        timestamp: record.executed_at,
    }
}
