//! Action record persistence. Each action row is owned by exactly one
//! decision and cascades on delete.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use ade_core::action::{ActionRecord, ActionStatus};
use ade_core::policy::ActionType;

use super::{from_ms_opt, new_row_id, to_ms, Database, StorageError};

/// Store for the `action_records` table.
#[derive(Clone)]
pub struct ActionStore {
    db: Database,
}

impl ActionStore {
    /// Creates the store.
    #[must_use]
    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persists a new action record.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on database failure (including an unknown
    /// owning decision, rejected by the foreign key).
    pub async fn insert(&self, record: &ActionRecord) -> Result<(), StorageError> {
        let record = record.clone();
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO action_records
                     (id, action_id, decision_id, action_type, payload,
                      target_service, status, dry_run, scheduled_at_ms,
                      executed_at_ms, completed_at_ms, retry_count, webhook_url,
                      webhook_response, error_message, created_at_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                             ?13, ?14, ?15, ?16)",
                    params![
                        new_row_id(),
                        record.action_id,
                        record.decision_id,
                        record.action_type.as_str(),
                        serde_json::to_string(&record.payload)?,
                        record.target_service,
                        record.status.as_str(),
                        record.dry_run,
                        record.scheduled_at.map(to_ms),
                        record.executed_at.map(to_ms),
                        record.completed_at.map(to_ms),
                        record.retry_count,
                        record.webhook_url,
                        record.webhook_response,
                        record.error_message,
                        to_ms(Utc::now()),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Marks an action completed with its delivery response.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on database failure.
    pub async fn mark_completed(
        &self,
        action_id: &str,
        completed_at: DateTime<Utc>,
        retry_count: u32,
        webhook_response: Option<String>,
    ) -> Result<(), StorageError> {
        let action_id = action_id.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE action_records
                     SET status = 'completed', completed_at_ms = ?1,
                         retry_count = ?2, webhook_response = ?3,
                         error_message = NULL
                     WHERE action_id = ?4",
                    params![to_ms(completed_at), retry_count, webhook_response, action_id],
                )?;
                Ok(())
            })
            .await
    }

    /// Marks an action terminally failed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on database failure.
    pub async fn mark_failed(
        &self,
        action_id: &str,
        completed_at: DateTime<Utc>,
        retry_count: u32,
        error_message: &str,
    ) -> Result<(), StorageError> {
        let action_id = action_id.to_string();
        let error_message = error_message.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE action_records
                     SET status = 'failed', completed_at_ms = ?1,
                         retry_count = ?2, error_message = ?3
                     WHERE action_id = ?4",
                    params![to_ms(completed_at), retry_count, error_message, action_id],
                )?;
                Ok(())
            })
            .await
    }

    /// Moves a scheduled action into the executing state.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on database failure.
    pub async fn mark_executing(
        &self,
        action_id: &str,
        executed_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let action_id = action_id.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE action_records
                     SET status = 'executing', executed_at_ms = ?1
                     WHERE action_id = ?2",
                    params![to_ms(executed_at), action_id],
                )?;
                Ok(())
            })
            .await
    }

    /// Cancels a pending or scheduled action.
    ///
    /// Returns `true` when a row transitioned.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on database failure.
    pub async fn cancel(&self, action_id: &str) -> Result<bool, StorageError> {
        let action_id = action_id.to_string();
        self.db
            .call(move |conn| {
                let updated = conn.execute(
                    "UPDATE action_records SET status = 'cancelled'
                     WHERE action_id = ?1 AND status IN ('pending', 'scheduled')",
                    params![action_id],
                )?;
                Ok(updated > 0)
            })
            .await
    }

    /// Fetches an action by business ID.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] when no row matches.
    pub async fn get(&self, action_id: &str) -> Result<ActionRecord, StorageError> {
        let action_id = action_id.to_string();
        self.db
            .call(move |conn| {
                conn.query_row(
                    &format!("{SELECT_ACTION} WHERE action_id = ?1"),
                    params![action_id],
                    row_to_action,
                )
                .optional()?
                .transpose()?
                .ok_or(StorageError::NotFound {
                    entity: "action",
                    id: action_id,
                })
            })
            .await
    }

    /// Lists the actions owned by a decision, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on database failure.
    pub async fn list_by_decision(
        &self,
        decision_id: &str,
    ) -> Result<Vec<ActionRecord>, StorageError> {
        let decision_id = decision_id.to_string();
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{SELECT_ACTION} WHERE decision_id = ?1 ORDER BY created_at_ms ASC"
                ))?;
                let rows = stmt.query_map(params![decision_id], row_to_action)?;
                let mut actions = Vec::new();
                for row in rows {
                    actions.push(row??);
                }
                Ok(actions)
            })
            .await
    }
}

const SELECT_ACTION: &str = "SELECT action_id, decision_id, action_type, payload, target_service,
        status, dry_run, scheduled_at_ms, executed_at_ms, completed_at_ms,
        retry_count, webhook_url, webhook_response, error_message
 FROM action_records";

fn row_to_action(row: &Row<'_>) -> rusqlite::Result<Result<ActionRecord, StorageError>> {
    let action_type_raw: String = row.get(2)?;
    let payload_raw: String = row.get(3)?;
    let status_raw: String = row.get(5)?;
    let scheduled_at: Option<i64> = row.get(7)?;
    let executed_at: Option<i64> = row.get(8)?;
    let completed_at: Option<i64> = row.get(9)?;

    Ok((|| {
        let action_type =
            ActionType::from_str(&action_type_raw).map_err(|e| StorageError::Corrupt {
                entity: "action",
                reason: e.to_string(),
            })?;
        let status = ActionStatus::from_str(&status_raw).map_err(|e| StorageError::Corrupt {
            entity: "action",
            reason: e.to_string(),
        })?;
        Ok(ActionRecord {
            action_id: row.get(0)?,
            decision_id: row.get(1)?,
            action_type,
            payload: serde_json::from_str(&payload_raw)?,
            target_service: row.get(4)?,
            status,
            dry_run: row.get(6)?,
            scheduled_at: from_ms_opt(scheduled_at),
            executed_at: from_ms_opt(executed_at),
            completed_at: from_ms_opt(completed_at),
            retry_count: row.get(10)?,
            webhook_url: row.get(11)?,
            webhook_response: row.get(12)?,
            error_message: row.get(13)?,
        })
    })())
}
