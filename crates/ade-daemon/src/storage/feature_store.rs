//! Feature snapshot persistence.
//!
//! Snapshots are immutable once written; invalidation shrinks `valid_until`
//! to the invalidation instant rather than deleting the row.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use ade_core::features::FeatureSnapshot;

use super::{new_row_id, to_ms, Database, StorageError};

/// Store for the `feature_snapshots` table.
#[derive(Clone)]
pub struct FeatureStore {
    db: Database,
}

impl FeatureStore {
    /// Creates the store.
    #[must_use]
    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persists a snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on database failure.
    pub async fn insert(&self, snapshot: &FeatureSnapshot) -> Result<(), StorageError> {
        let snapshot = snapshot.clone();
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO feature_snapshots
                     (id, snapshot_id, service_id, features, calculated_at_ms,
                      valid_until_ms, event_ids, created_at_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        new_row_id(),
                        snapshot.snapshot_id,
                        snapshot.service_id,
                        serde_json::to_string(&snapshot.features)?,
                        to_ms(snapshot.calculated_at),
                        to_ms(snapshot.valid_until),
                        serde_json::to_string(&snapshot.event_ids)?,
                        to_ms(Utc::now()),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Fetches a snapshot by business ID.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] when no row matches.
    pub async fn get(&self, snapshot_id: &str) -> Result<FeatureSnapshot, StorageError> {
        let snapshot_id = snapshot_id.to_string();
        self.db
            .call(move |conn| {
                conn.query_row(
                    "SELECT snapshot_id, service_id, features, calculated_at_ms,
                            valid_until_ms, event_ids
                     FROM feature_snapshots WHERE snapshot_id = ?1",
                    params![snapshot_id],
                    row_to_snapshot,
                )
                .optional()?
                .transpose()?
                .ok_or(StorageError::NotFound {
                    entity: "feature snapshot",
                    id: snapshot_id,
                })
            })
            .await
    }

    /// The most recent snapshot for a service still valid at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on database failure.
    pub async fn latest_valid(
        &self,
        service_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<FeatureSnapshot>, StorageError> {
        let service_id = service_id.to_string();
        self.db
            .call(move |conn| {
                conn.query_row(
                    "SELECT snapshot_id, service_id, features, calculated_at_ms,
                            valid_until_ms, event_ids
                     FROM feature_snapshots
                     WHERE service_id = ?1 AND valid_until_ms > ?2
                     ORDER BY calculated_at_ms DESC
                     LIMIT 1",
                    params![service_id, to_ms(now)],
                    row_to_snapshot,
                )
                .optional()?
                .transpose()
            })
            .await
    }

    /// Invalidates a snapshot by setting `valid_until` to `now`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] when no row matches.
    pub async fn invalidate(
        &self,
        snapshot_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let snapshot_id = snapshot_id.to_string();
        self.db
            .call(move |conn| {
                let updated = conn.execute(
                    "UPDATE feature_snapshots SET valid_until_ms = ?1
                     WHERE snapshot_id = ?2 AND valid_until_ms > ?1",
                    params![to_ms(now), snapshot_id],
                )?;
                if updated == 0 {
                    return Err(StorageError::NotFound {
                        entity: "feature snapshot",
                        id: snapshot_id,
                    });
                }
                Ok(())
            })
            .await
    }
}

fn row_to_snapshot(row: &Row<'_>) -> rusqlite::Result<Result<FeatureSnapshot, StorageError>> {
    let features_raw: String = row.get(2)?;
    let event_ids_raw: String = row.get(5)?;

    Ok((|| {
        Ok(FeatureSnapshot {
            snapshot_id: row.get(0)?,
            service_id: row.get(1)?,
            features: serde_json::from_str(&features_raw)?,
            calculated_at: super::from_ms(row.get(3)?),
            valid_until: super::from_ms(row.get(4)?),
            event_ids: serde_json::from_str(&event_ids_raw)?,
        })
    })())
}
