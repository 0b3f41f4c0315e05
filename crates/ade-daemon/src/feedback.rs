//! The feedback service: records impact observations, classifies drift, and
//! executes gated rollbacks.
//!
//! Rollback is fire-and-record: the original action's inverse is delivered
//! through the action runtime and a rollback record links the two. Webhook
//! actions have no inverse and are never rollbackable. `force` bypasses the
//! recommendation gate, nothing else.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use ade_core::error::ErrorKind;
use ade_core::feedback::{
    detect_drift, impact_score, should_rollback, FeedbackError, FeedbackRecord, FeedbackType,
};

use crate::action::{ActionError, ActionRequest, ActionRuntime};
use crate::storage::{FeedbackStore, RollbackRecord, StorageError};

/// Default observation window in minutes.
const DEFAULT_OBSERVATION_WINDOW_MINUTES: u32 = 5;

/// A feedback submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRequest {
    /// The action observed.
    pub action_id: String,
    /// The decision that produced it.
    pub decision_id: String,
    /// The service observed.
    pub service_id: String,
    /// How the observation was gathered.
    pub feedback_type: String,
    /// Metric vector before the action.
    pub metrics_before: BTreeMap<String, f64>,
    /// Metric vector after the action.
    pub metrics_after: BTreeMap<String, f64>,
    /// Minutes between the vectors; defaults to 5.
    #[serde(default)]
    pub observation_window_minutes: Option<u32>,
}

/// A rollback submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackRequest {
    /// The action to roll back.
    pub action_id: String,
    /// Caller-supplied reason.
    #[serde(default)]
    pub reason: String,
    /// Bypass the recommendation gate.
    #[serde(default)]
    pub force: bool,
}

/// The outcome of a rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackResult {
    /// Business ID of the rollback.
    pub rollback_id: String,
    /// The action rolled back.
    pub action_id: String,
    /// The inverse action delivered.
    pub inverse_action_id: String,
    /// Terminal status of the inverse delivery.
    pub status: String,
    /// Caller-supplied reason.
    pub reason: String,
    /// When the rollback executed.
    pub executed_at: chrono::DateTime<Utc>,
}

/// Feedback service failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FeedbackServiceError {
    /// Scoring or gating failed validation.
    #[error(transparent)]
    Feedback(#[from] FeedbackError),

    /// Persistence failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Delivering the inverse action failed.
    #[error(transparent)]
    Action(#[from] ActionError),
}

impl FeedbackServiceError {
    /// Taxonomy classification.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Feedback(e) => e.kind(),
            Self::Storage(e) => e.kind(),
            Self::Action(e) => e.kind(),
        }
    }
}

/// The feedback service.
pub struct FeedbackService {
    store: FeedbackStore,
    actions: Arc<ActionRuntime>,
}

impl FeedbackService {
    /// Creates the service.
    #[must_use]
    pub fn new(store: FeedbackStore, actions: Arc<ActionRuntime>) -> Self {
        Self { store, actions }
    }

    /// Records and scores one observation.
    ///
    /// # Errors
    ///
    /// Returns [`FeedbackServiceError`] for validation or storage failures.
    /// Drift detection itself never fails: no common metrics simply reports
    /// `drift_detected = false`.
    pub async fn record(
        &self,
        request: &FeedbackRequest,
    ) -> Result<FeedbackRecord, FeedbackServiceError> {
        if request.action_id.is_empty() {
            return Err(FeedbackError::MissingField("action_id").into());
        }
        if request.decision_id.is_empty() {
            return Err(FeedbackError::MissingField("decision_id").into());
        }
        if request.service_id.is_empty() {
            return Err(FeedbackError::MissingField("service_id").into());
        }
        if request.metrics_before.is_empty() {
            return Err(FeedbackError::EmptyMetrics("metrics_before").into());
        }
        if request.metrics_after.is_empty() {
            return Err(FeedbackError::EmptyMetrics("metrics_after").into());
        }
        let feedback_type = FeedbackType::from_str(&request.feedback_type)?;

        let impact = impact_score(&request.metrics_before, &request.metrics_after);
        let drift = detect_drift(&request.metrics_before, &request.metrics_after);
        let rollback_recommended = should_rollback(impact, drift.as_ref());

        let record = FeedbackRecord {
            feedback_id: format!("fbk-{}", uuid::Uuid::new_v4()),
            action_id: request.action_id.clone(),
            decision_id: request.decision_id.clone(),
            service_id: request.service_id.clone(),
            feedback_type,
            metrics_before: request.metrics_before.clone(),
            metrics_after: request.metrics_after.clone(),
            impact_score: impact,
            drift_detected: drift.is_some(),
            drift_details: drift,
            rollback_recommended,
            rollback_executed: false,
            observation_window_minutes: request
                .observation_window_minutes
                .filter(|w| *w > 0)
                .unwrap_or(DEFAULT_OBSERVATION_WINDOW_MINUTES),
            recorded_at: Utc::now(),
        };

        self.store.insert(&record).await?;

        info!(
            feedback_id = %record.feedback_id,
            action_id = %record.action_id,
            impact_score = record.impact_score,
            drift_detected = record.drift_detected,
            rollback_recommended = record.rollback_recommended,
            "feedback recorded"
        );

        Ok(record)
    }

    /// Executes a rollback: delivers the inverse of the original action and
    /// records the pair.
    ///
    /// # Errors
    ///
    /// Returns [`FeedbackServiceError`] when the action is unknown, has no
    /// inverse, or the gate refuses an unforced request. Delivery failures
    /// of the inverse are recorded on the rollback as `failed` but still
    /// returned as errors.
    pub async fn rollback(
        &self,
        request: &RollbackRequest,
    ) -> Result<RollbackResult, FeedbackServiceError> {
        if request.action_id.is_empty() {
            return Err(FeedbackError::MissingField("action_id").into());
        }

        let original = self.actions.get(&request.action_id).await?;

        let latest_feedback = self.store.latest_for_action(&request.action_id).await?;
        if !request.force {
            let recommended = latest_feedback
                .as_ref()
                .is_some_and(|f| f.rollback_recommended);
            if !recommended {
                return Err(FeedbackError::NotRecommended {
                    action_id: request.action_id.clone(),
                }
                .into());
            }
        }

        let Some(inverse_type) = original.action_type.inverse() else {
            return Err(FeedbackError::NotRollbackable {
                action_type: original.action_type,
            }
            .into());
        };

        let rollback_id = format!("rbk-{}", uuid::Uuid::new_v4());
        let inverse_action_id = format!("act-{}", uuid::Uuid::new_v4());
        let inverse = ActionRequest {
            action_id: inverse_action_id.clone(),
            decision_id: original.decision_id.clone(),
            action_type: inverse_type,
            target_service: original.target_service.clone(),
            payload: original.payload.clone(),
            dry_run: false,
            scheduled_at: None,
            webhook_url: original.webhook_url.clone(),
        };

        info!(
            rollback_id = %rollback_id,
            action_id = %request.action_id,
            inverse_action = %inverse_type,
            force = request.force,
            "executing rollback"
        );

        let executed_at = Utc::now();
        let delivery = self.actions.execute(&inverse).await;
        let status = match &delivery {
            Ok(result) => result.status.to_string(),
            Err(_) => "failed".to_string(),
        };

        self.store
            .insert_rollback(&RollbackRecord {
                rollback_id: rollback_id.clone(),
                action_id: request.action_id.clone(),
                inverse_action_id: inverse_action_id.clone(),
                service_id: original.target_service.clone(),
                status: status.clone(),
                reason: request.reason.clone(),
                forced: request.force,
                executed_at,
            })
            .await?;

        if let Some(feedback) = &latest_feedback {
            if let Err(e) = self.store.mark_rollback_executed(&feedback.feedback_id).await {
                warn!(
                    feedback_id = %feedback.feedback_id,
                    error = %e,
                    "failed to stamp rollback on feedback record"
                );
            }
        }

        delivery?;

        Ok(RollbackResult {
            rollback_id,
            action_id: request.action_id.clone(),
            inverse_action_id,
            status,
            reason: request.reason.clone(),
            executed_at,
        })
    }
}
