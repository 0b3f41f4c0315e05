//! The simulation service: normalizes requests, runs the Monte Carlo
//! projection, and persists run lifecycle.
//!
//! A run never partially completes: any failure marks the stored row
//! `failed` and no partial aggregates are reported.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

use ade_core::error::ErrorKind;
use ade_core::simulation::{
    SimulationError, SimulationRequest, SimulationResult, Simulator,
};

use crate::storage::{SimulationRun, SimulationStore, StorageError};

/// Simulation service failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SimulationServiceError {
    /// The request shape is invalid.
    #[error(transparent)]
    Simulation(#[from] SimulationError),

    /// Persistence failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SimulationServiceError {
    /// Taxonomy classification.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Simulation(e) => e.kind(),
            Self::Storage(e) => e.kind(),
        }
    }
}

/// A simulation response: the run result, echoing the stored run ID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationResponse {
    /// The full result document.
    #[serde(flatten)]
    pub result: SimulationResult,
}

/// The simulation service.
pub struct SimulationService {
    store: SimulationStore,
    simulator: Simulator,
    max_iterations: u32,
}

impl SimulationService {
    /// Creates the service.
    #[must_use]
    pub const fn new(store: SimulationStore, max_iterations: u32) -> Self {
        Self {
            store,
            simulator: Simulator::new(),
            max_iterations,
        }
    }

    /// Runs a simulation, recording its lifecycle.
    ///
    /// # Errors
    ///
    /// Returns [`SimulationServiceError`] on validation or storage failure;
    /// a failed projection marks the stored run `failed` before surfacing.
    pub async fn run(
        &self,
        request: &SimulationRequest,
    ) -> Result<SimulationResponse, SimulationServiceError> {
        let mut request = request.clone();
        request.validate()?;
        request.normalize(self.max_iterations);

        // The run row is created up front in `running` so a crashed or
        // failed projection leaves an auditable trace.
        let provisional_run_id = format!("sim-{}", uuid::Uuid::new_v4());
        self.store.insert_running(&provisional_run_id, &request).await?;

        // The projection is CPU-bound; keep it off the async workers.
        let simulator = self.simulator;
        let run_request = request.clone();
        let projected = tokio::task::spawn_blocking(move || simulator.run(&run_request)).await;

        let mut result = match projected {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                self.store
                    .mark_failed(&provisional_run_id, &e.to_string())
                    .await?;
                return Err(e.into());
            },
            Err(join_error) => {
                let message = format!("simulation task failed: {join_error}");
                error!(run_id = %provisional_run_id, error = %message, "simulation aborted");
                self.store.mark_failed(&provisional_run_id, &message).await?;
                return Err(StorageError::Join(message).into());
            },
        };

        // The simulator mints its own ID; rewrite it to the stored row's.
        result.run_id = provisional_run_id;
        self.store.mark_completed(&result).await?;

        Ok(SimulationResponse { result })
    }

    /// Fetches a stored run.
    ///
    /// # Errors
    ///
    /// Returns [`SimulationServiceError`] with kind `NotFound` for unknown
    /// IDs.
    pub async fn get(&self, run_id: &str) -> Result<SimulationRun, SimulationServiceError> {
        Ok(self.store.get(run_id).await?)
    }
}
