//! Versioned policy persistence.
//!
//! The full policy document is stored as JSON alongside the columns the
//! store filters on. `(policy_id, version)` is unique; upserting an existing
//! pair replaces the stored document.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use ade_core::policy::Policy;

use super::{new_row_id, to_ms, Database, StorageError};

/// Store for the `policies` table.
#[derive(Clone)]
pub struct PolicyStore {
    db: Database,
}

impl PolicyStore {
    /// Creates the store.
    #[must_use]
    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    /// Inserts or replaces a policy version. Callers validate before
    /// storing; the store never accepts a policy the engine would reject.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on database failure and propagates
    /// validation failures as [`StorageError::Corrupt`].
    pub async fn upsert(&self, policy: &Policy) -> Result<(), StorageError> {
        policy.validate().map_err(|e| StorageError::Corrupt {
            entity: "policy",
            reason: e.to_string(),
        })?;

        let policy = policy.clone();
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO policies
                     (id, policy_id, version, name, description, policy_type,
                      document, effective_from_ms, effective_until_ms, is_active,
                      created_at_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                     ON CONFLICT (policy_id, version) DO UPDATE SET
                        name = excluded.name,
                        description = excluded.description,
                        policy_type = excluded.policy_type,
                        document = excluded.document,
                        effective_from_ms = excluded.effective_from_ms,
                        effective_until_ms = excluded.effective_until_ms,
                        is_active = excluded.is_active",
                    params![
                        new_row_id(),
                        policy.policy_id,
                        policy.version,
                        policy.name,
                        policy.description,
                        policy.policy_type.as_str(),
                        serde_json::to_string(&policy)?,
                        policy.effective_from.map(to_ms),
                        policy.effective_until.map(to_ms),
                        policy.is_active,
                        to_ms(Utc::now()),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Fetches one policy version, or the most recently stored active
    /// version when `version` is `None`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] when nothing matches.
    pub async fn get(
        &self,
        policy_id: &str,
        version: Option<&str>,
    ) -> Result<Policy, StorageError> {
        let policy_id = policy_id.to_string();
        let version = version.map(str::to_string);
        self.db
            .call(move |conn| {
                let found = match &version {
                    Some(version) => conn
                        .query_row(
                            "SELECT document FROM policies
                             WHERE policy_id = ?1 AND version = ?2",
                            params![policy_id, version],
                            row_to_policy,
                        )
                        .optional()?,
                    None => conn
                        .query_row(
                            "SELECT document FROM policies
                             WHERE policy_id = ?1 AND is_active = 1
                             ORDER BY created_at_ms DESC
                             LIMIT 1",
                            params![policy_id],
                            row_to_policy,
                        )
                        .optional()?,
                };
                found.transpose()?.ok_or(StorageError::NotFound {
                    entity: "policy",
                    id: policy_id,
                })
            })
            .await
    }

    /// Lists every active policy, most recently stored first.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on database failure.
    pub async fn list_active(&self) -> Result<Vec<Policy>, StorageError> {
        self.db
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT document FROM policies
                     WHERE is_active = 1
                     ORDER BY created_at_ms DESC",
                )?;
                let rows = stmt.query_map([], row_to_policy)?;
                let mut policies = Vec::new();
                for row in rows {
                    policies.push(row??);
                }
                Ok(policies)
            })
            .await
    }

    /// Deactivates every version of a policy.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on database failure.
    pub async fn deactivate(&self, policy_id: &str) -> Result<(), StorageError> {
        let policy_id = policy_id.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE policies SET is_active = 0 WHERE policy_id = ?1",
                    params![policy_id],
                )?;
                Ok(())
            })
            .await
    }
}

fn row_to_policy(row: &Row<'_>) -> rusqlite::Result<Result<Policy, StorageError>> {
    let document: String = row.get(0)?;
    Ok(serde_json::from_str(&document).map_err(StorageError::from))
}
