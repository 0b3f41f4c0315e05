//! Simulation run persistence: rows transition running -> completed/failed.

use std::str::FromStr;

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use ade_core::simulation::{
    Scenario, SimulationRequest, SimulationResult, SimulationStatus,
};

use super::{from_ms_opt, new_row_id, to_ms, Database, StorageError};

/// A stored simulation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationRun {
    /// Business ID of the run.
    pub run_id: String,
    /// The service projected.
    pub service_id: String,
    /// Policy reference recorded on the run.
    pub policy_id: Option<String>,
    /// Policy version recorded on the run.
    pub policy_version: Option<String>,
    /// Snapshot the starting state came from.
    pub snapshot_id: Option<String>,
    /// Scenario projected.
    pub scenario: Scenario,
    /// Horizon used.
    pub horizon_minutes: u32,
    /// Iterations used.
    pub iterations: u32,
    /// Full result document once completed.
    pub results: Option<SimulationResult>,
    /// Cost projection once completed.
    pub cost_projection: Option<f64>,
    /// Risk score once completed.
    pub risk_score: Option<f64>,
    /// Recommendation label once completed.
    pub recommendation: Option<String>,
    /// Lifecycle state.
    pub status: SimulationStatus,
    /// Failure detail for failed runs.
    pub error_message: Option<String>,
    /// Completion instant.
    pub completed_at: Option<chrono::DateTime<Utc>>,
}

/// Store for the `simulation_runs` table.
#[derive(Clone)]
pub struct SimulationStore {
    db: Database,
}

impl SimulationStore {
    /// Creates the store.
    #[must_use]
    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    /// Records a run in the `running` state.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on database failure.
    pub async fn insert_running(
        &self,
        run_id: &str,
        request: &SimulationRequest,
    ) -> Result<(), StorageError> {
        let run_id = run_id.to_string();
        let request = request.clone();
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO simulation_runs
                     (id, run_id, service_id, policy_id, policy_version,
                      snapshot_id, scenario, horizon_minutes, iterations,
                      status, created_at_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'running', ?10)",
                    params![
                        new_row_id(),
                        run_id,
                        request.service_id,
                        request.policy_id,
                        request.policy_version,
                        request.snapshot_id,
                        request.scenario.as_str(),
                        request.horizon_minutes,
                        request.iterations,
                        to_ms(Utc::now()),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Marks a run completed with its full result.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on database failure.
    pub async fn mark_completed(&self, result: &SimulationResult) -> Result<(), StorageError> {
        let result = result.clone();
        self.db
            .call(move |conn| {
                let recommendation = serde_json::to_value(result.recommendation)?
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                conn.execute(
                    "UPDATE simulation_runs
                     SET status = 'completed', results = ?1, cost_projection = ?2,
                         risk_score = ?3, recommendation = ?4, completed_at_ms = ?5
                     WHERE run_id = ?6",
                    params![
                        serde_json::to_string(&result)?,
                        result.cost_projection,
                        result.risk_score,
                        recommendation,
                        to_ms(result.completed_at),
                        result.run_id,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Marks a run failed. A failed run reports no partial results.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on database failure.
    pub async fn mark_failed(&self, run_id: &str, error: &str) -> Result<(), StorageError> {
        let run_id = run_id.to_string();
        let error = error.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE simulation_runs
                     SET status = 'failed', error_message = ?1, completed_at_ms = ?2
                     WHERE run_id = ?3",
                    params![error, to_ms(Utc::now()), run_id],
                )?;
                Ok(())
            })
            .await
    }

    /// Fetches a run by business ID.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] when no row matches.
    pub async fn get(&self, run_id: &str) -> Result<SimulationRun, StorageError> {
        let run_id = run_id.to_string();
        self.db
            .call(move |conn| {
                conn.query_row(
                    "SELECT run_id, service_id, policy_id, policy_version,
                            snapshot_id, scenario, horizon_minutes, iterations,
                            results, cost_projection, risk_score, recommendation,
                            status, error_message, completed_at_ms
                     FROM simulation_runs WHERE run_id = ?1",
                    params![run_id],
                    row_to_run,
                )
                .optional()?
                .transpose()?
                .ok_or(StorageError::NotFound {
                    entity: "simulation run",
                    id: run_id,
                })
            })
            .await
    }
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<Result<SimulationRun, StorageError>> {
    let scenario_raw: String = row.get(5)?;
    let results_raw: Option<String> = row.get(8)?;
    let status_raw: String = row.get(12)?;
    let completed_at: Option<i64> = row.get(14)?;

    Ok((|| {
        let scenario =
            Scenario::from_str(&scenario_raw).map_err(|e| StorageError::Corrupt {
                entity: "simulation run",
                reason: e.to_string(),
            })?;
        let status = match status_raw.as_str() {
            "running" => SimulationStatus::Running,
            "completed" => SimulationStatus::Completed,
            "failed" => SimulationStatus::Failed,
            "timeout" => SimulationStatus::Timeout,
            other => {
                return Err(StorageError::Corrupt {
                    entity: "simulation run",
                    reason: format!("unknown status: {other}"),
                })
            },
        };
        Ok(SimulationRun {
            run_id: row.get(0)?,
            service_id: row.get(1)?,
            policy_id: row.get(2)?,
            policy_version: row.get(3)?,
            snapshot_id: row.get(4)?,
            scenario,
            horizon_minutes: row.get(6)?,
            iterations: row.get(7)?,
            results: results_raw
                .map(|raw| serde_json::from_str(&raw))
                .transpose()?,
            cost_projection: row.get(9)?,
            risk_score: row.get(10)?,
            recommendation: row.get(11)?,
            status,
            error_message: row.get(13)?,
            completed_at: from_ms_opt(completed_at),
        })
    })())
}
