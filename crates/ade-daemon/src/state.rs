//! Service state: feature calculation over the event window and snapshot
//! lookup.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use ade_core::error::ErrorKind;
use ade_core::features::{self, FeatureError, FeatureSnapshot, ServiceFeatures};

use crate::storage::{EventStore, FeatureStore, StorageError};

/// Feature calculation outcome: the derived features plus the persisted
/// snapshot they were recorded under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalculatedFeatures {
    /// The derived features.
    pub features: ServiceFeatures,
    /// Business ID of the persisted snapshot.
    pub snapshot_id: String,
    /// Number of events that fed the derivation.
    pub event_count: usize,
}

/// Feature service failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StateError {
    /// The derivation could not run.
    #[error(transparent)]
    Features(#[from] FeatureError),

    /// Persistence failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl StateError {
    /// Taxonomy classification.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Features(e) => e.kind(),
            Self::Storage(e) => e.kind(),
        }
    }
}

/// Derives and serves per-service features.
pub struct FeatureService {
    events: EventStore,
    snapshots: FeatureStore,
    default_window: Duration,
    max_events: u32,
}

impl FeatureService {
    /// Creates the service.
    #[must_use]
    pub const fn new(
        events: EventStore,
        snapshots: FeatureStore,
        default_window: Duration,
        max_events: u32,
    ) -> Self {
        Self {
            events,
            snapshots,
            default_window,
            max_events,
        }
    }

    /// Derives features for `service_id` over `[now - window, now]` and
    /// persists an immutable snapshot covering the events used.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] when the window holds no usable events or
    /// persistence fails.
    pub async fn calculate(
        &self,
        service_id: &str,
        window: Option<Duration>,
    ) -> Result<CalculatedFeatures, StateError> {
        let window = window.unwrap_or(self.default_window);
        let window_chrono = chrono::Duration::from_std(window)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        let now = Utc::now();
        let from = now - window_chrono;

        // Most recent first from storage, chronological for the builder.
        let mut events = self
            .events
            .list_by_service(service_id, from, now, self.max_events)
            .await?;
        events.reverse();

        let derived = features::build_features(service_id, &events, now)?;
        let event_ids: Vec<String> = events.iter().map(|e| e.event_id.clone()).collect();
        let event_count = event_ids.len();

        let snapshot = FeatureSnapshot::new(derived.clone(), event_ids, now, window_chrono);
        self.snapshots.insert(&snapshot).await?;

        info!(
            service_id = %service_id,
            snapshot_id = %snapshot.snapshot_id,
            event_count,
            cpu_current = derived.cpu_current,
            health_score = derived.health_score,
            "features calculated"
        );

        Ok(CalculatedFeatures {
            features: derived,
            snapshot_id: snapshot.snapshot_id,
            event_count,
        })
    }

    /// The most recent still-valid snapshot for a service.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] with kind `NotFound` when no valid snapshot
    /// exists.
    pub async fn current_state(&self, service_id: &str) -> Result<FeatureSnapshot, StateError> {
        match self.snapshots.latest_valid(service_id, Utc::now()).await? {
            Some(snapshot) => Ok(snapshot),
            None => Err(StateError::Storage(StorageError::NotFound {
                entity: "feature snapshot",
                id: service_id.to_string(),
            })),
        }
    }

    /// Invalidates a snapshot, forcing the next decision to re-derive.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] when the snapshot is unknown.
    pub async fn invalidate(&self, snapshot_id: &str) -> Result<(), StateError> {
        self.snapshots.invalidate(snapshot_id, Utc::now()).await?;
        Ok(())
    }
}
