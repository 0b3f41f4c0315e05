//! The action runtime: executes, schedules and batches operational actions.
//!
//! Delivery rides the core webhook client (retry, backoff, per-destination
//! circuit breakers). Dry-run actions are recorded but never leave the
//! process. Scheduled actions persist as `scheduled` rows and are handed to
//! the in-process scheduler; when due they re-enter the same delivery path.
//!
//! Failure semantics: every terminal failure is first recorded on the action
//! row, then surfaced to the caller with its taxonomy kind (so a circuit
//! rejection becomes 503 at the API boundary while the row reads `failed`).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use ade_core::action::{delivery_envelope, ActionRecord, ActionStatus};
use ade_core::error::ErrorKind;
use ade_core::policy::ActionType;
use ade_core::scheduler::{Job, Scheduler};
use ade_core::webhook::{DeliveryRequest, WebhookClient, WebhookError};

use crate::storage::{ActionStore, StorageError};

/// A request to execute or schedule one action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    /// Business ID of the action.
    pub action_id: String,
    /// The owning decision.
    pub decision_id: String,
    /// Operational action type.
    pub action_type: ActionType,
    /// The service acted upon.
    pub target_service: String,
    /// Executor parameters.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Whether to suppress delivery.
    #[serde(default)]
    pub dry_run: bool,
    /// Due instant; required for scheduling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Destination override; the configured default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

impl ActionRequest {
    fn validate(&self) -> Result<(), ActionError> {
        if self.action_id.is_empty() {
            return Err(ActionError::MissingField("action_id"));
        }
        if self.decision_id.is_empty() {
            return Err(ActionError::MissingField("decision_id"));
        }
        if self.target_service.is_empty() {
            return Err(ActionError::MissingField("target_service"));
        }
        Ok(())
    }
}

/// The outcome of executing or scheduling one action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    /// The action acted upon.
    pub action_id: String,
    /// Resulting lifecycle state.
    pub status: ActionStatus,
    /// Whether delivery was suppressed.
    pub dry_run: bool,
    /// When execution began.
    pub executed_at: DateTime<Utc>,
    /// When execution finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Destination used, when one applied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    /// Final HTTP status on delivery.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_code: Option<u16>,
    /// Truncated response body on delivery.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    /// Failure detail on terminal failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Extra detail (dry-run intent, scheduling info).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Action runtime failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ActionError {
    /// A required field is empty.
    #[error("{0} is required")]
    MissingField(&'static str),

    /// `scheduled_at` is required for scheduling.
    #[error("scheduled_at is required for scheduling")]
    MissingSchedule,

    /// Persistence failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Delivery failed; the action row already reads `failed`.
    #[error("delivery failed for action {action_id}: {source}")]
    Delivery {
        /// The failed action.
        action_id: String,
        /// The underlying webhook failure.
        #[source]
        source: WebhookError,
    },

    /// The destination answered 4xx; terminal, never retried.
    #[error("destination rejected action {action_id} with status {status}")]
    Rejected {
        /// The failed action.
        action_id: String,
        /// The 4xx status observed.
        status: u16,
    },
}

impl ActionError {
    /// Taxonomy classification.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingField(_) | Self::MissingSchedule => ErrorKind::Validation,
            Self::Storage(e) => e.kind(),
            Self::Delivery { source, .. } => source.kind(),
            Self::Rejected { .. } => ErrorKind::Upstream,
        }
    }
}

/// The action runtime.
pub struct ActionRuntime {
    store: ActionStore,
    webhook: WebhookClient,
    scheduler: Arc<Scheduler>,
    default_webhook_url: Option<String>,
}

impl ActionRuntime {
    /// Creates the runtime.
    #[must_use]
    pub fn new(
        store: ActionStore,
        webhook: WebhookClient,
        scheduler: Arc<Scheduler>,
        default_webhook_url: Option<String>,
    ) -> Self {
        Self {
            store,
            webhook,
            scheduler,
            default_webhook_url,
        }
    }

    /// Executes one action now.
    ///
    /// # Errors
    ///
    /// Returns [`ActionError`] on validation, storage or delivery failure.
    /// Delivery failures are recorded on the action row before surfacing.
    pub async fn execute(&self, request: &ActionRequest) -> Result<ActionResult, ActionError> {
        request.validate()?;
        let now = Utc::now();

        if request.dry_run {
            let record = record_from_request(request, ActionStatus::DryRun, now);
            self.store.insert(&record).await?;
            info!(
                action_id = %request.action_id,
                action_type = %request.action_type,
                target = %request.target_service,
                "action dry run"
            );
            return Ok(ActionResult {
                action_id: request.action_id.clone(),
                status: ActionStatus::DryRun,
                dry_run: true,
                executed_at: now,
                completed_at: None,
                webhook_url: None,
                response_code: None,
                response_body: None,
                error_message: None,
                metadata: Some(serde_json::json!({
                    "action_type": request.action_type,
                    "target_service": request.target_service,
                    "payload": request.payload,
                    "message": "action would have been executed",
                })),
            });
        }

        let record = record_from_request(request, ActionStatus::Executing, now);
        self.store.insert(&record).await?;
        self.deliver(request, now).await
    }

    /// Schedules one action for later execution.
    ///
    /// # Errors
    ///
    /// Returns [`ActionError::MissingSchedule`] without a due instant, and
    /// [`ActionError`] on storage failure.
    pub async fn schedule(&self, request: &ActionRequest) -> Result<ActionResult, ActionError> {
        request.validate()?;
        let Some(scheduled_at) = request.scheduled_at else {
            return Err(ActionError::MissingSchedule);
        };

        let now = Utc::now();
        let record = record_from_request(request, ActionStatus::Scheduled, now);
        self.store.insert(&record).await?;

        self.scheduler.schedule(Job {
            job_id: request.action_id.clone(),
            execute_at: scheduled_at,
            payload: serde_json::to_value(request).unwrap_or_default(),
        });

        info!(
            action_id = %request.action_id,
            action_type = %request.action_type,
            scheduled_for = %scheduled_at,
            "action scheduled"
        );

        Ok(ActionResult {
            action_id: request.action_id.clone(),
            status: ActionStatus::Scheduled,
            dry_run: request.dry_run,
            executed_at: now,
            completed_at: None,
            webhook_url: None,
            response_code: None,
            response_body: None,
            error_message: None,
            metadata: Some(serde_json::json!({
                "action_type": request.action_type,
                "target_service": request.target_service,
                "scheduled_for": scheduled_at,
            })),
        })
    }

    /// Executes a batch in order with partial-success semantics: one failed
    /// item never aborts the rest.
    pub async fn execute_batch(&self, requests: &[ActionRequest]) -> Vec<ActionResult> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            match self.execute(request).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    error!(action_id = %request.action_id, error = %e, "batch action failed");
                    results.push(ActionResult {
                        action_id: request.action_id.clone(),
                        status: ActionStatus::Failed,
                        dry_run: request.dry_run,
                        executed_at: Utc::now(),
                        completed_at: None,
                        webhook_url: None,
                        response_code: None,
                        response_body: None,
                        error_message: Some(e.to_string()),
                        metadata: None,
                    });
                },
            }
        }
        results
    }

    /// Cancels a pending or scheduled action.
    ///
    /// # Errors
    ///
    /// Returns [`ActionError`] on storage failure.
    pub async fn cancel(&self, action_id: &str) -> Result<bool, ActionError> {
        self.scheduler.cancel(action_id);
        Ok(self.store.cancel(action_id).await?)
    }

    /// Fetches an action record.
    ///
    /// # Errors
    ///
    /// Returns [`ActionError`] with kind `NotFound` for unknown IDs.
    pub async fn get(&self, action_id: &str) -> Result<ActionRecord, ActionError> {
        Ok(self.store.get(action_id).await?)
    }

    /// Scheduler entry point: runs a due job's action through the normal
    /// delivery path. Errors are recorded and logged, never propagated into
    /// the scheduler.
    pub async fn handle_due_job(&self, job: Job) {
        let request: ActionRequest = match serde_json::from_value(job.payload) {
            Ok(request) => request,
            Err(e) => {
                error!(job_id = %job.job_id, error = %e, "scheduled job payload unreadable");
                return;
            },
        };

        let now = Utc::now();
        if let Err(e) = self.store.mark_executing(&request.action_id, now).await {
            error!(action_id = %request.action_id, error = %e, "failed to mark action executing");
            return;
        }

        match self.deliver(&request, now).await {
            Ok(result) => info!(
                action_id = %request.action_id,
                status = %result.status,
                "scheduled action executed"
            ),
            Err(e) => warn!(
                action_id = %request.action_id,
                error = %e,
                "scheduled action failed"
            ),
        }
    }

    /// Delivers an already-recorded action and updates its row.
    async fn deliver(
        &self,
        request: &ActionRequest,
        executed_at: DateTime<Utc>,
    ) -> Result<ActionResult, ActionError> {
        let url = request
            .webhook_url
            .clone()
            .or_else(|| self.default_webhook_url.clone());

        let Some(url) = url else {
            // No destination configured: the action is considered applied
            // locally with nothing to send.
            let completed_at = Utc::now();
            self.store
                .mark_completed(&request.action_id, completed_at, 0, None)
                .await?;
            return Ok(ActionResult {
                action_id: request.action_id.clone(),
                status: ActionStatus::Completed,
                dry_run: false,
                executed_at,
                completed_at: Some(completed_at),
                webhook_url: None,
                response_code: None,
                response_body: None,
                error_message: None,
                metadata: Some(serde_json::json!({
                    "message": "no webhook destination configured",
                })),
            });
        };

        let envelope = delivery_envelope(
            &request.action_id,
            &request.decision_id,
            request.action_type,
            &request.target_service,
            &request.payload,
            Utc::now(),
        );
        let delivery = DeliveryRequest {
            url: url.clone(),
            webhook_id: request.action_id.clone(),
            headers: vec![
                (
                    "X-Action-Type".to_string(),
                    request.action_type.as_str().to_string(),
                ),
                ("X-Service-ID".to_string(), request.target_service.clone()),
            ],
            payload: envelope,
        };

        match self.webhook.send(&delivery).await {
            Ok(response) if response.status < 400 => {
                let completed_at = Utc::now();
                self.store
                    .mark_completed(
                        &request.action_id,
                        completed_at,
                        response.attempts.saturating_sub(1),
                        Some(response.body.clone()),
                    )
                    .await?;
                info!(
                    action_id = %request.action_id,
                    action_type = %request.action_type,
                    target = %request.target_service,
                    status = response.status,
                    attempts = response.attempts,
                    "action executed"
                );
                Ok(ActionResult {
                    action_id: request.action_id.clone(),
                    status: ActionStatus::Completed,
                    dry_run: false,
                    executed_at,
                    completed_at: Some(completed_at),
                    webhook_url: Some(url),
                    response_code: Some(response.status),
                    response_body: Some(response.body),
                    error_message: None,
                    metadata: None,
                })
            },
            Ok(response) => {
                // 4xx: terminal by contract, exactly one attempt was made.
                let message = format!("webhook returned status {}", response.status);
                self.store
                    .mark_failed(&request.action_id, Utc::now(), 0, &message)
                    .await?;
                error!(
                    action_id = %request.action_id,
                    status = response.status,
                    "action rejected by destination"
                );
                Err(ActionError::Rejected {
                    action_id: request.action_id.clone(),
                    status: response.status,
                })
            },
            Err(source) => {
                let retry_count = match &source {
                    WebhookError::Exhausted { attempts, .. }
                    | WebhookError::TimedOut { attempts } => attempts.saturating_sub(1),
                    _ => 0,
                };
                self.store
                    .mark_failed(
                        &request.action_id,
                        Utc::now(),
                        retry_count,
                        &source.to_string(),
                    )
                    .await?;
                error!(
                    action_id = %request.action_id,
                    error = %source,
                    "action delivery failed"
                );
                Err(ActionError::Delivery {
                    action_id: request.action_id.clone(),
                    source,
                })
            },
        }
    }
}

fn record_from_request(
    request: &ActionRequest,
    status: ActionStatus,
    now: DateTime<Utc>,
) -> ActionRecord {
    ActionRecord {
        action_id: request.action_id.clone(),
        decision_id: request.decision_id.clone(),
        action_type: request.action_type,
        payload: request.payload.clone(),
        target_service: request.target_service.clone(),
        status,
        dry_run: request.dry_run,
        scheduled_at: request.scheduled_at,
        executed_at: match status {
            ActionStatus::Scheduled => None,
            _ => Some(now),
        },
        completed_at: None,
        retry_count: 0,
        webhook_url: request.webhook_url.clone(),
        webhook_response: None,
        error_message: None,
    }
}
