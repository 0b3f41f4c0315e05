//! Feedback and rollback persistence. Each feedback row is owned by exactly
//! one action and cascades on delete.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use ade_core::feedback::{FeedbackRecord, FeedbackType};

use super::{from_ms, new_row_id, to_ms, Database, StorageError};

/// A persisted rollback, linking an action to its delivered inverse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackRecord {
    /// Business ID of the rollback.
    pub rollback_id: String,
    /// The action rolled back.
    pub action_id: String,
    /// The inverse action that was delivered.
    pub inverse_action_id: String,
    /// The service acted upon.
    pub service_id: String,
    /// Terminal status of the inverse delivery.
    pub status: String,
    /// Caller-supplied reason.
    pub reason: String,
    /// Whether the recommendation gate was bypassed.
    pub forced: bool,
    /// When the rollback executed.
    pub executed_at: DateTime<Utc>,
}

/// Store for `feedback_records` and `rollback_records`.
#[derive(Clone)]
pub struct FeedbackStore {
    db: Database,
}

impl FeedbackStore {
    /// Creates the store.
    #[must_use]
    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persists a feedback record.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on database failure.
    pub async fn insert(&self, record: &FeedbackRecord) -> Result<(), StorageError> {
        let record = record.clone();
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO feedback_records
                     (id, feedback_id, action_id, decision_id, service_id,
                      feedback_type, metrics_before, metrics_after, impact_score,
                      drift_detected, drift_details, rollback_recommended,
                      rollback_executed, observation_window_minutes, created_at_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                             ?13, ?14, ?15)",
                    params![
                        new_row_id(),
                        record.feedback_id,
                        record.action_id,
                        record.decision_id,
                        record.service_id,
                        record.feedback_type.as_str(),
                        serde_json::to_string(&record.metrics_before)?,
                        serde_json::to_string(&record.metrics_after)?,
                        record.impact_score,
                        record.drift_detected,
                        record
                            .drift_details
                            .as_ref()
                            .map(serde_json::to_string)
                            .transpose()?,
                        record.rollback_recommended,
                        record.rollback_executed,
                        record.observation_window_minutes,
                        to_ms(record.recorded_at),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// The most recent feedback record for an action.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on database failure.
    pub async fn latest_for_action(
        &self,
        action_id: &str,
    ) -> Result<Option<FeedbackRecord>, StorageError> {
        let action_id = action_id.to_string();
        self.db
            .call(move |conn| {
                conn.query_row(
                    &format!(
                        "{SELECT_FEEDBACK} WHERE action_id = ?1
                         ORDER BY created_at_ms DESC LIMIT 1"
                    ),
                    params![action_id],
                    row_to_feedback,
                )
                .optional()?
                .transpose()
            })
            .await
    }

    /// Marks the feedback row as having had its rollback executed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on database failure.
    pub async fn mark_rollback_executed(&self, feedback_id: &str) -> Result<(), StorageError> {
        let feedback_id = feedback_id.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE feedback_records SET rollback_executed = 1
                     WHERE feedback_id = ?1",
                    params![feedback_id],
                )?;
                Ok(())
            })
            .await
    }

    /// Persists a rollback record.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on database failure.
    pub async fn insert_rollback(&self, record: &RollbackRecord) -> Result<(), StorageError> {
        let record = record.clone();
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO rollback_records
                     (id, rollback_id, action_id, inverse_action_id, service_id,
                      status, reason, forced, executed_at_ms, created_at_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        new_row_id(),
                        record.rollback_id,
                        record.action_id,
                        record.inverse_action_id,
                        record.service_id,
                        record.status,
                        record.reason,
                        record.forced,
                        to_ms(record.executed_at),
                        to_ms(Utc::now()),
                    ],
                )?;
                Ok(())
            })
            .await
    }
}

const SELECT_FEEDBACK: &str = "SELECT feedback_id, action_id, decision_id, service_id, feedback_type,
        metrics_before, metrics_after, impact_score, drift_detected,
        drift_details, rollback_recommended, rollback_executed,
        observation_window_minutes, created_at_ms
 FROM feedback_records";

fn row_to_feedback(row: &Row<'_>) -> rusqlite::Result<Result<FeedbackRecord, StorageError>> {
    let feedback_type_raw: String = row.get(4)?;
    let before_raw: String = row.get(5)?;
    let after_raw: String = row.get(6)?;
    let drift_raw: Option<String> = row.get(9)?;

    Ok((|| {
        let feedback_type =
            FeedbackType::from_str(&feedback_type_raw).map_err(|e| StorageError::Corrupt {
                entity: "feedback",
                reason: e.to_string(),
            })?;
        Ok(FeedbackRecord {
            feedback_id: row.get(0)?,
            action_id: row.get(1)?,
            decision_id: row.get(2)?,
            service_id: row.get(3)?,
            feedback_type,
            metrics_before: serde_json::from_str(&before_raw)?,
            metrics_after: serde_json::from_str(&after_raw)?,
            impact_score: row.get(7)?,
            drift_detected: row.get(8)?,
            drift_details: drift_raw
                .map(|raw| serde_json::from_str(&raw))
                .transpose()?,
            rollback_recommended: row.get(10)?,
            rollback_executed: row.get(11)?,
            observation_window_minutes: row.get(12)?,
            recorded_at: from_ms(row.get(13)?),
        })
    })())
}
