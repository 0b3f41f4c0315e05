//! Action records: the persisted execution state of one operational action.
//!
//! Every action is owned by exactly one decision. The delivery envelope sent
//! to webhook targets is built here so that execution, scheduling and
//! rollback all ship the same canonical shape.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::policy::ActionType;

/// Action lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Created but not yet picked up.
    Pending,
    /// Waiting on the scheduler.
    Scheduled,
    /// Delivery in flight.
    Executing,
    /// Delivered successfully.
    Completed,
    /// Delivery failed terminally.
    Failed,
    /// Cancelled before execution.
    Cancelled,
    /// Suppressed by dry-run; nothing was sent.
    DryRun,
}

impl ActionStatus {
    /// Stable wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::DryRun => "dry_run",
        }
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An action-status label outside the closed set.
#[derive(Debug, Error)]
#[error("unknown action status: {0}")]
pub struct UnknownActionStatus(pub String);

impl FromStr for ActionStatus {
    type Err = UnknownActionStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "scheduled" => Ok(Self::Scheduled),
            "executing" => Ok(Self::Executing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "dry_run" => Ok(Self::DryRun),
            other => Err(UnknownActionStatus(other.to_string())),
        }
    }
}

/// The persisted state of one action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    /// Business ID of the action.
    pub action_id: String,
    /// The owning decision.
    pub decision_id: String,
    /// Operational action type.
    pub action_type: ActionType,
    /// Executor parameters.
    pub payload: serde_json::Value,
    /// The service acted upon.
    pub target_service: String,
    /// Lifecycle state.
    pub status: ActionStatus,
    /// Whether execution was suppressed.
    pub dry_run: bool,
    /// When the action is due, for scheduled actions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    /// When execution began.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
    /// When execution finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Retries spent beyond the first attempt.
    pub retry_count: u32,
    /// Destination override used for delivery.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    /// Truncated response recorded on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_response: Option<String>,
    /// Failure detail recorded on terminal failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Builds the canonical delivery envelope for an action.
#[must_use]
pub fn delivery_envelope(
    action_id: &str,
    decision_id: &str,
    action_type: ActionType,
    target_service: &str,
    payload: &serde_json::Value,
    timestamp: DateTime<Utc>,
) -> serde_json::Value {
    serde_json::json!({
        "action_id": action_id,
        "decision_id": decision_id,
        "action_type": action_type,
        "target_service": target_service,
        "payload": payload,
        "timestamp": timestamp,
    })
}
