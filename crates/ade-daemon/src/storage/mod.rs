//! SQLite persistence.
//!
//! A single [`Database`] handle wraps the connection behind a mutex; every
//! store call runs on the blocking pool via `spawn_blocking` so SQLite I/O
//! never stalls the async runtime. The schema is created idempotently at
//! open time. Timestamps are stored as unix milliseconds; JSON columns hold
//! `serde_json` blobs.

mod action_store;
mod decision_store;
mod event_store;
mod feature_store;
mod feedback_store;
mod policy_store;
mod simulation_store;

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use thiserror::Error;

use ade_core::error::ErrorKind;

pub use action_store::ActionStore;
pub use decision_store::{DecisionInsert, DecisionStore};
pub use event_store::EventStore;
pub use feature_store::FeatureStore;
pub use feedback_store::{FeedbackStore, RollbackRecord};
pub use policy_store::PolicyStore;
pub use simulation_store::{SimulationRun, SimulationStore};

/// Full schema, applied idempotently at open.
const SCHEMA_SQL: &str = r"
    PRAGMA foreign_keys = ON;

    CREATE TABLE IF NOT EXISTS events (
        id TEXT PRIMARY KEY,
        event_id TEXT NOT NULL UNIQUE,
        idempotency_key TEXT NOT NULL UNIQUE,
        service_id TEXT NOT NULL,
        event_type TEXT NOT NULL
            CHECK (event_type IN ('metrics', 'alert', 'custom')),
        payload TEXT NOT NULL,
        timestamp_ms INTEGER NOT NULL,
        processed_at_ms INTEGER,
        created_at_ms INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_events_service_ts
        ON events(service_id, timestamp_ms);

    CREATE TABLE IF NOT EXISTS feature_snapshots (
        id TEXT PRIMARY KEY,
        snapshot_id TEXT NOT NULL UNIQUE,
        service_id TEXT NOT NULL,
        features TEXT NOT NULL,
        calculated_at_ms INTEGER NOT NULL,
        valid_until_ms INTEGER NOT NULL,
        event_ids TEXT NOT NULL,
        created_at_ms INTEGER NOT NULL,
        CHECK (valid_until_ms > calculated_at_ms)
    );

    CREATE INDEX IF NOT EXISTS idx_snapshots_service
        ON feature_snapshots(service_id, calculated_at_ms);

    CREATE TABLE IF NOT EXISTS policies (
        id TEXT PRIMARY KEY,
        policy_id TEXT NOT NULL,
        version TEXT NOT NULL,
        name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        policy_type TEXT NOT NULL
            CHECK (policy_type IN ('autoscale', 'ratelimit', 'circuitbreaker', 'custom')),
        document TEXT NOT NULL,
        effective_from_ms INTEGER,
        effective_until_ms INTEGER,
        is_active INTEGER NOT NULL DEFAULT 1,
        created_at_ms INTEGER NOT NULL,
        UNIQUE (policy_id, version),
        CHECK (
            effective_from_ms IS NULL
            OR effective_until_ms IS NULL
            OR effective_until_ms > effective_from_ms
        )
    );

    CREATE TABLE IF NOT EXISTS decision_records (
        id TEXT PRIMARY KEY,
        decision_id TEXT NOT NULL UNIQUE,
        idempotency_key TEXT NOT NULL UNIQUE,
        service_id TEXT NOT NULL,
        policy_id TEXT NOT NULL,
        policy_version TEXT NOT NULL,
        snapshot_id TEXT NOT NULL,
        decision_type TEXT NOT NULL
            CHECK (decision_type IN ('autoscale', 'ratelimit', 'circuitbreaker', 'custom')),
        decision_result TEXT NOT NULL
            CHECK (decision_result IN ('allow', 'deny', 'throttle', 'simulate', 'error')),
        actions TEXT NOT NULL,
        confidence_score REAL NOT NULL
            CHECK (confidence_score >= 0.0 AND confidence_score <= 1.0),
        simulation_run_id TEXT,
        dry_run INTEGER NOT NULL DEFAULT 0,
        executed_at_ms INTEGER NOT NULL,
        created_at_ms INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_decisions_service
        ON decision_records(service_id, executed_at_ms);

    CREATE TABLE IF NOT EXISTS decision_traces (
        id TEXT PRIMARY KEY,
        trace_id TEXT NOT NULL UNIQUE,
        decision_id TEXT NOT NULL
            REFERENCES decision_records(decision_id) ON DELETE CASCADE,
        policy_id TEXT NOT NULL,
        policy_version TEXT NOT NULL,
        trace_data TEXT NOT NULL,
        rules_evaluated TEXT NOT NULL,
        rules_matched TEXT NOT NULL,
        features_used TEXT NOT NULL,
        execution_time_ms INTEGER NOT NULL,
        created_at_ms INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS simulation_runs (
        id TEXT PRIMARY KEY,
        run_id TEXT NOT NULL UNIQUE,
        service_id TEXT NOT NULL,
        policy_id TEXT,
        policy_version TEXT,
        snapshot_id TEXT,
        scenario TEXT NOT NULL
            CHECK (scenario IN ('normal', 'high_load', 'failure', 'recovery')),
        horizon_minutes INTEGER NOT NULL
            CHECK (horizon_minutes >= 5 AND horizon_minutes <= 15),
        iterations INTEGER NOT NULL CHECK (iterations > 0),
        results TEXT,
        cost_projection REAL,
        risk_score REAL
            CHECK (risk_score IS NULL OR (risk_score >= 0.0 AND risk_score <= 1.0)),
        recommendation TEXT,
        status TEXT NOT NULL
            CHECK (status IN ('running', 'completed', 'failed', 'timeout')),
        error_message TEXT,
        created_at_ms INTEGER NOT NULL,
        completed_at_ms INTEGER
    );

    CREATE TABLE IF NOT EXISTS action_records (
        id TEXT PRIMARY KEY,
        action_id TEXT NOT NULL UNIQUE,
        decision_id TEXT NOT NULL
            REFERENCES decision_records(decision_id) ON DELETE CASCADE,
        action_type TEXT NOT NULL
            CHECK (action_type IN (
                'scale_up', 'scale_down', 'throttle', 'unthrottle',
                'open_circuit', 'close_circuit', 'webhook'
            )),
        payload TEXT NOT NULL,
        target_service TEXT NOT NULL,
        status TEXT NOT NULL
            CHECK (status IN (
                'pending', 'scheduled', 'executing', 'completed',
                'failed', 'cancelled', 'dry_run'
            )),
        dry_run INTEGER NOT NULL DEFAULT 0,
        scheduled_at_ms INTEGER,
        executed_at_ms INTEGER,
        completed_at_ms INTEGER,
        retry_count INTEGER NOT NULL DEFAULT 0,
        webhook_url TEXT,
        webhook_response TEXT,
        error_message TEXT,
        created_at_ms INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_actions_decision
        ON action_records(decision_id);

    CREATE TABLE IF NOT EXISTS feedback_records (
        id TEXT PRIMARY KEY,
        feedback_id TEXT NOT NULL UNIQUE,
        action_id TEXT NOT NULL
            REFERENCES action_records(action_id) ON DELETE CASCADE,
        decision_id TEXT NOT NULL,
        service_id TEXT NOT NULL,
        feedback_type TEXT NOT NULL
            CHECK (feedback_type IN ('immediate', 'delayed', 'scheduled')),
        metrics_before TEXT NOT NULL,
        metrics_after TEXT NOT NULL,
        impact_score REAL NOT NULL
            CHECK (impact_score >= -1.0 AND impact_score <= 1.0),
        drift_detected INTEGER NOT NULL DEFAULT 0,
        drift_details TEXT,
        rollback_recommended INTEGER NOT NULL DEFAULT 0,
        rollback_executed INTEGER NOT NULL DEFAULT 0,
        observation_window_minutes INTEGER NOT NULL,
        created_at_ms INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_feedback_action
        ON feedback_records(action_id, created_at_ms);

    CREATE TABLE IF NOT EXISTS rollback_records (
        id TEXT PRIMARY KEY,
        rollback_id TEXT NOT NULL UNIQUE,
        action_id TEXT NOT NULL
            REFERENCES action_records(action_id) ON DELETE CASCADE,
        inverse_action_id TEXT NOT NULL,
        service_id TEXT NOT NULL,
        status TEXT NOT NULL,
        reason TEXT NOT NULL DEFAULT '',
        forced INTEGER NOT NULL DEFAULT 0,
        executed_at_ms INTEGER NOT NULL,
        created_at_ms INTEGER NOT NULL
    );
";

/// Storage failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// Underlying SQLite failure.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON (de)serialization of a column failed.
    #[error("column serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The connection mutex was poisoned by a panicking writer.
    #[error("database mutex poisoned")]
    Poisoned,

    /// The blocking task was cancelled or panicked.
    #[error("blocking task failed: {0}")]
    Join(String),

    /// Lookup by business ID found nothing.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind.
        entity: &'static str,
        /// The business ID queried.
        id: String,
    },

    /// A stored enum label no longer parses; the row is corrupt.
    #[error("corrupt {entity} row: {reason}")]
    Corrupt {
        /// Entity kind.
        entity: &'static str,
        /// What failed to parse.
        reason: String,
    },
}

impl StorageError {
    /// Taxonomy classification.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            _ => ErrorKind::Internal,
        }
    }
}

/// Shared connection handle. Clones share one connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens (creating if needed) a file-backed database and applies the
    /// schema.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when the file cannot be opened or the schema
    /// fails to apply.
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::from_connection(conn)
    }

    /// Opens an in-memory database, for tests.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when the schema fails to apply.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` against the connection on the blocking pool.
    ///
    /// # Errors
    ///
    /// Propagates the closure's error, or [`StorageError::Join`] /
    /// [`StorageError::Poisoned`] for pool and lock failures.
    pub async fn call<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Connection) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| StorageError::Poisoned)?;
            f(&guard)
        })
        .await
        .map_err(|e| StorageError::Join(e.to_string()))?
    }

    /// Cheap connectivity probe for readiness checks.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when the probe query fails.
    pub async fn ping(&self) -> Result<(), StorageError> {
        self.call(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
        .await
    }
}

/// New surrogate row ID.
pub(crate) fn new_row_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Unix milliseconds for storage.
pub(crate) fn to_ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Instant from stored unix milliseconds; clamps out-of-range values.
pub(crate) fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

/// Optional instant from an optional stored value.
pub(crate) fn from_ms_opt(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(from_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_schema_applies_and_pings() {
        let db = Database::open_in_memory().unwrap();
        db.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_schema_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.call(|conn| {
            conn.execute_batch(SCHEMA_SQL)?;
            Ok(())
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_timestamp_round_trip() {
        let now = Utc::now();
        let restored = from_ms(to_ms(now));
        assert_eq!(restored.timestamp_millis(), now.timestamp_millis());
    }
}
