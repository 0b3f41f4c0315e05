//! Event persistence: the durable log head.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use ade_core::event::{Event, EventType};

use super::{from_ms_opt, new_row_id, to_ms, Database, StorageError};

/// Store for the `events` table.
#[derive(Clone)]
pub struct EventStore {
    db: Database,
}

impl EventStore {
    /// Creates the store.
    #[must_use]
    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persists an event, deduplicating on `idempotency_key`.
    ///
    /// Returns `true` when a new row was written and `false` on an
    /// idempotency-key collision (a no-op by design).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on database failure.
    pub async fn insert(&self, event: &Event) -> Result<bool, StorageError> {
        let event = event.clone();
        self.db
            .call(move |conn| {
                let payload = serde_json::to_string(&event.payload)?;
                let inserted = conn.execute(
                    "INSERT OR IGNORE INTO events
                     (id, event_id, idempotency_key, service_id, event_type,
                      payload, timestamp_ms, processed_at_ms, created_at_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        new_row_id(),
                        event.event_id,
                        event.idempotency_key,
                        event.service_id,
                        event.event_type.as_str(),
                        payload,
                        to_ms(event.timestamp),
                        event.processed_at.map(to_ms),
                        to_ms(Utc::now()),
                    ],
                )?;
                Ok(inserted > 0)
            })
            .await
    }

    /// Fetches an event by its business ID.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] when no row matches.
    pub async fn get_by_event_id(&self, event_id: &str) -> Result<Event, StorageError> {
        let event_id = event_id.to_string();
        self.db
            .call(move |conn| {
                conn.query_row(
                    "SELECT event_id, idempotency_key, service_id, event_type,
                            payload, timestamp_ms, processed_at_ms
                     FROM events WHERE event_id = ?1",
                    params![event_id],
                    row_to_event,
                )
                .optional()?
                .transpose()?
                .ok_or(StorageError::NotFound {
                    entity: "event",
                    id: event_id,
                })
            })
            .await
    }

    /// Lists a service's events in `[from, to]`, most recent first, capped
    /// at `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on database failure.
    pub async fn list_by_service(
        &self,
        service_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Event>, StorageError> {
        let service_id = service_id.to_string();
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT event_id, idempotency_key, service_id, event_type,
                            payload, timestamp_ms, processed_at_ms
                     FROM events
                     WHERE service_id = ?1 AND timestamp_ms >= ?2 AND timestamp_ms <= ?3
                     ORDER BY timestamp_ms DESC, created_at_ms DESC
                     LIMIT ?4",
                )?;
                let rows = stmt.query_map(
                    params![service_id, to_ms(from), to_ms(to), i64::from(limit)],
                    row_to_event,
                )?;
                let mut events = Vec::new();
                for row in rows {
                    events.push(row??);
                }
                Ok(events)
            })
            .await
    }

    /// Stamps `processed_at` on an event.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on database failure.
    pub async fn mark_processed(
        &self,
        event_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let event_id = event_id.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE events SET processed_at_ms = ?1 WHERE event_id = ?2",
                    params![to_ms(at), event_id],
                )?;
                Ok(())
            })
            .await
    }

    /// Counts stored events for a service, for diagnostics.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on database failure.
    pub async fn count_for_service(&self, service_id: &str) -> Result<i64, StorageError> {
        let service_id = service_id.to_string();
        self.db
            .call(move |conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM events WHERE service_id = ?1",
                    params![service_id],
                    |row| row.get(0),
                )?)
            })
            .await
    }
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<Result<Event, StorageError>> {
    let event_type_raw: String = row.get(3)?;
    let payload_raw: String = row.get(4)?;
    let processed_at_ms: Option<i64> = row.get(6)?;

    Ok((|| {
        let event_type =
            EventType::from_str(&event_type_raw).map_err(|e| StorageError::Corrupt {
                entity: "event",
                reason: e.to_string(),
            })?;
        let payload = serde_json::from_str(&payload_raw)?;
        Ok(Event {
            event_id: row.get(0)?,
            idempotency_key: row.get(1)?,
            service_id: row.get(2)?,
            event_type,
            payload,
            timestamp: super::from_ms(row.get(5)?),
            processed_at: from_ms_opt(processed_at_ms),
        })
    })())
}
