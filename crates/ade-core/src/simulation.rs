//! Monte Carlo projection of near-future service state.
//!
//! Each run rolls the current features forward over discrete minute steps,
//! once per iteration, under scenario-specific drift and noise. Aggregates
//! are the fraction of iterations that crossed the overload, latency and
//! error thresholds anywhere in their horizon, plus a cost envelope.
//!
//! Numeric reproducibility: a run seeds exactly one PRNG from the
//! caller-supplied seed; there is no global randomness.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::error::ErrorKind;
use crate::features::ServiceFeatures;

/// Horizon bounds in minutes.
pub const MIN_HORIZON_MINUTES: u32 = 5;
/// Upper horizon bound in minutes.
pub const MAX_HORIZON_MINUTES: u32 = 15;
/// Horizon applied when the requested one is out of bounds.
pub const DEFAULT_HORIZON_MINUTES: u32 = 10;
/// Iteration floor below which the default applies.
pub const MIN_ITERATIONS: u32 = 100;
/// Iterations applied when the requested count is below the floor.
pub const DEFAULT_ITERATIONS: u32 = 1000;

/// CPU level counted as overload.
const OVERLOAD_CPU: f64 = 90.0;
/// Latency level counted as high latency, in milliseconds.
const HIGH_LATENCY_MS: f64 = 1000.0;
/// Error rate counted as a spike.
const ERROR_SPIKE_RATE: f64 = 0.1;

/// Simulation scenario closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    /// Steady state.
    #[default]
    Normal,
    /// Sustained upward CPU pressure.
    HighLoad,
    /// Error rate creep.
    Failure,
    /// Load draining away.
    Recovery,
}

/// Per-scenario drift and noise parameters.
#[derive(Debug, Clone, Copy)]
pub struct ScenarioParams {
    /// Multiplicative CPU drift per minute.
    pub cpu_trend: f64,
    /// Multiplicative error-rate drift per minute.
    pub error_trend: f64,
    /// Width of the uniform noise band.
    pub noise: f64,
}

impl Scenario {
    /// Stable wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::HighLoad => "high_load",
            Self::Failure => "failure",
            Self::Recovery => "recovery",
        }
    }

    /// The scenario's drift/noise parameters.
    #[must_use]
    pub const fn params(self) -> ScenarioParams {
        match self {
            Self::Normal => ScenarioParams {
                cpu_trend: 0.0,
                error_trend: 0.0,
                noise: 0.10,
            },
            Self::HighLoad => ScenarioParams {
                cpu_trend: 0.03,
                error_trend: 0.0,
                noise: 0.15,
            },
            Self::Failure => ScenarioParams {
                cpu_trend: 0.0,
                error_trend: 0.02,
                noise: 0.20,
            },
            Self::Recovery => ScenarioParams {
                cpu_trend: -0.02,
                error_trend: 0.0,
                noise: 0.08,
            },
        }
    }

    /// Cost multiplier applied to the expected cost for the projection.
    #[must_use]
    pub const fn cost_multiplier(self) -> f64 {
        match self {
            Self::Normal => 1.0,
            Self::HighLoad => 1.5,
            Self::Failure => 2.0,
            Self::Recovery => 0.8,
        }
    }
}

impl std::fmt::Display for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Scenario {
    type Err = SimulationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Self::Normal),
            "high_load" => Ok(Self::HighLoad),
            "failure" => Ok(Self::Failure),
            "recovery" => Ok(Self::Recovery),
            other => Err(SimulationError::UnknownScenario(other.to_string())),
        }
    }
}

/// Run lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulationStatus {
    /// The run is in progress.
    Running,
    /// The run finished and its aggregates are valid.
    Completed,
    /// The run failed; no partial results are reported.
    Failed,
    /// The run exceeded its caller budget.
    Timeout,
}

impl SimulationStatus {
    /// Stable wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for SimulationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operational recommendation derived from the risk score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    /// Risk above 0.7.
    ScaleUpImmediate,
    /// Risk above 0.5.
    ScaleUpPrepare,
    /// Risk above 0.3.
    MonitorClosely,
    /// Risk at or below 0.3.
    Maintain,
}

impl Recommendation {
    /// The recommendation for a risk score.
    #[must_use]
    pub fn for_risk(risk: f64) -> Self {
        if risk > 0.7 {
            Self::ScaleUpImmediate
        } else if risk > 0.5 {
            Self::ScaleUpPrepare
        } else if risk > 0.3 {
            Self::MonitorClosely
        } else {
            Self::Maintain
        }
    }
}

/// A simulation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationRequest {
    /// The service projected.
    pub service_id: String,
    /// Policy consulted by the caller, recorded on the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
    /// Policy version, recorded on the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_version: Option<String>,
    /// Feature snapshot the starting state came from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    /// Scenario to project under.
    #[serde(default)]
    pub scenario: Scenario,
    /// Forward minutes per iteration, clamped to `[5, 15]`.
    #[serde(default)]
    pub horizon_minutes: u32,
    /// Iterations, raised to the default when below the floor.
    #[serde(default)]
    pub iterations: u32,
    /// PRNG seed; supply one for reproducible runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// The starting state.
    pub current_state: ServiceFeatures,
}

impl SimulationRequest {
    /// Normalizes bounds: out-of-range horizons fall back to the default,
    /// undersized iteration counts are raised, and oversized ones clamp to
    /// `max_iterations`.
    pub fn normalize(&mut self, max_iterations: u32) {
        if !(MIN_HORIZON_MINUTES..=MAX_HORIZON_MINUTES).contains(&self.horizon_minutes) {
            self.horizon_minutes = DEFAULT_HORIZON_MINUTES;
        }
        if self.iterations < MIN_ITERATIONS {
            self.iterations = DEFAULT_ITERATIONS;
        }
        if self.iterations > max_iterations {
            self.iterations = max_iterations;
        }
    }

    /// Validates the request shape.
    ///
    /// # Errors
    ///
    /// Returns [`SimulationError`] when the service ID is empty.
    pub fn validate(&self) -> Result<(), SimulationError> {
        if self.service_id.is_empty() {
            return Err(SimulationError::MissingField("service_id"));
        }
        Ok(())
    }
}

/// One projected minute, aggregated across iterations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectedState {
    /// Minute offset from now, starting at 1.
    pub minute: u32,
    /// Mean CPU across iterations.
    pub cpu_avg: f64,
    /// Mean of the per-iteration p50 CPU draws.
    pub cpu_p50: f64,
    /// Mean of the per-iteration p95 CPU draws.
    pub cpu_p95: f64,
    /// Mean latency across iterations.
    pub latency_avg: f64,
    /// Mean error rate across iterations.
    pub error_rate: f64,
}

/// Aggregate statistics over all iterations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationAggregates {
    /// Fraction of iterations whose CPU crossed 90 anywhere.
    pub probability_overload: f64,
    /// Fraction of iterations whose latency crossed 1000 ms anywhere.
    pub probability_high_latency: f64,
    /// Fraction of iterations whose error rate crossed 0.1 anywhere.
    pub probability_error_spike: f64,
    /// Mean per-iteration cost.
    pub expected_cost: f64,
    /// Highest per-iteration cost.
    pub worst_case_cost: f64,
    /// Lowest per-iteration cost.
    pub best_case_cost: f64,
}

/// The outcome of a simulation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationResult {
    /// Business ID of the run.
    pub run_id: String,
    /// Run lifecycle state.
    pub status: SimulationStatus,
    /// Scenario projected.
    pub scenario: Scenario,
    /// Horizon actually used.
    pub horizon_minutes: u32,
    /// Iterations actually used.
    pub iterations: u32,
    /// Seed the PRNG was seeded with, when supplied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Per-minute aggregated projection.
    pub projected_states: Vec<ProjectedState>,
    /// Aggregate statistics.
    pub aggregates: SimulationAggregates,
    /// Expected cost scaled by the scenario multiplier.
    pub cost_projection: f64,
    /// Composite risk in `[0, 1]`.
    pub risk_score: f64,
    /// Operational recommendation for the risk.
    pub recommendation: Recommendation,
    /// Confidence in the aggregates, grown by iteration count.
    pub confidence: f64,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run completed.
    pub completed_at: DateTime<Utc>,
}

/// Simulation failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SimulationError {
    /// A required field is empty.
    #[error("{0} is required")]
    MissingField(&'static str),

    /// A scenario label outside the closed set.
    #[error("unknown scenario: {0}")]
    UnknownScenario(String),
}

impl SimulationError {
    /// Taxonomy classification.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

/// The Monte Carlo simulator. Stateless; one PRNG is created per run.
#[derive(Debug, Default, Clone, Copy)]
pub struct Simulator;

impl Simulator {
    /// Creates a simulator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Executes a normalized request.
    ///
    /// # Errors
    ///
    /// Returns [`SimulationError`] when the request shape is invalid. A run
    /// never partially completes: any failure fails the whole run.
    pub fn run(&self, request: &SimulationRequest) -> Result<SimulationResult, SimulationError> {
        request.validate()?;

        let started_at = Utc::now();
        let run_id = format!("sim-{}", uuid::Uuid::new_v4());
        let horizon = request.horizon_minutes as usize;

        let mut rng = match request.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        info!(
            run_id = %run_id,
            service_id = %request.service_id,
            scenario = %request.scenario,
            horizon = request.horizon_minutes,
            iterations = request.iterations,
            "starting simulation"
        );

        let mut projections = Vec::with_capacity(request.iterations as usize);
        for _ in 0..request.iterations {
            projections.push(project_iteration(
                &request.current_state,
                horizon,
                request.scenario.params(),
                &mut rng,
            ));
        }

        let aggregates = aggregate(&projections);
        let risk = risk_score(&aggregates);
        let result = SimulationResult {
            run_id: run_id.clone(),
            status: SimulationStatus::Completed,
            scenario: request.scenario,
            horizon_minutes: request.horizon_minutes,
            iterations: request.iterations,
            seed: request.seed,
            projected_states: aggregate_minutes(&projections, horizon),
            cost_projection: aggregates.expected_cost * request.scenario.cost_multiplier(),
            aggregates,
            risk_score: risk,
            recommendation: Recommendation::for_risk(risk),
            confidence: confidence(request.iterations),
            started_at,
            completed_at: Utc::now(),
        };

        info!(
            run_id = %run_id,
            risk_score = result.risk_score,
            recommendation = ?result.recommendation,
            "simulation completed"
        );

        Ok(result)
    }
}

/// One iteration's per-minute path.
#[derive(Debug, Clone)]
struct MinuteState {
    cpu: f64,
    cpu_p50: f64,
    cpu_p95: f64,
    latency: f64,
    error_rate: f64,
}

fn project_iteration(
    current: &ServiceFeatures,
    horizon: usize,
    params: ScenarioParams,
    rng: &mut StdRng,
) -> Vec<MinuteState> {
    let mut cpu = current.cpu_current;
    let mut latency = current.latency_p95;
    let mut error_rate = current.error_rate;

    let mut states = Vec::with_capacity(horizon);
    for _ in 0..horizon {
        let u: f64 = rng.random();
        cpu *= 1.0 + params.cpu_trend + params.noise * (u - 0.5);
        let u: f64 = rng.random();
        error_rate *= 1.0 + params.error_trend + params.noise * (u - 0.5);
        let u: f64 = rng.random();
        latency *= 1.0 + (cpu - 50.0) / 200.0 + params.noise * (u - 0.5);

        cpu = cpu.clamp(0.0, 100.0);
        error_rate = error_rate.clamp(0.0, 1.0);
        latency = latency.max(0.0);

        let p50: f64 = cpu * (0.9 + 0.2 * rng.random::<f64>());
        let p95: f64 = cpu * (1.1 + 0.3 * rng.random::<f64>());
        states.push(MinuteState {
            cpu,
            cpu_p50: p50,
            cpu_p95: p95,
            latency,
            error_rate,
        });
    }
    states
}

fn aggregate_minutes(projections: &[Vec<MinuteState>], horizon: usize) -> Vec<ProjectedState> {
    let n = projections.len() as f64;
    (0..horizon)
        .map(|minute| {
            let mut cpu = 0.0;
            let mut p50 = 0.0;
            let mut p95 = 0.0;
            let mut latency = 0.0;
            let mut error_rate = 0.0;
            for path in projections {
                cpu += path[minute].cpu;
                p50 += path[minute].cpu_p50;
                p95 += path[minute].cpu_p95;
                latency += path[minute].latency;
                error_rate += path[minute].error_rate;
            }
            ProjectedState {
                minute: u32::try_from(minute + 1).unwrap_or(u32::MAX),
                cpu_avg: cpu / n,
                cpu_p50: p50 / n,
                cpu_p95: p95 / n,
                latency_avg: latency / n,
                error_rate: error_rate / n,
            }
        })
        .collect()
}

fn aggregate(projections: &[Vec<MinuteState>]) -> SimulationAggregates {
    let mut overload = 0u32;
    let mut high_latency = 0u32;
    let mut error_spike = 0u32;
    let mut total_cost = 0.0;
    let mut best_cost = f64::MAX;
    let mut worst_cost = 0.0f64;

    for path in projections {
        let mut hit_overload = false;
        let mut hit_latency = false;
        let mut hit_errors = false;
        let mut cost = 0.0;

        for state in path {
            if state.cpu > OVERLOAD_CPU {
                hit_overload = true;
            }
            if state.latency > HIGH_LATENCY_MS {
                hit_latency = true;
            }
            if state.error_rate > ERROR_SPIKE_RATE {
                hit_errors = true;
            }
            cost += 0.1 + state.cpu / 100.0 * 0.5;
        }

        overload += u32::from(hit_overload);
        high_latency += u32::from(hit_latency);
        error_spike += u32::from(hit_errors);
        total_cost += cost;
        best_cost = best_cost.min(cost);
        worst_cost = worst_cost.max(cost);
    }

    let n = projections.len() as f64;
    SimulationAggregates {
        probability_overload: f64::from(overload) / n,
        probability_high_latency: f64::from(high_latency) / n,
        probability_error_spike: f64::from(error_spike) / n,
        expected_cost: total_cost / n,
        worst_case_cost: worst_cost,
        best_case_cost: best_cost,
    }
}

/// Composite risk: `clamp(P(overload)*0.4 + P(highLatency)*0.3 +
/// P(errorSpike)*0.3, 0, 1)`.
#[must_use]
pub fn risk_score(aggregates: &SimulationAggregates) -> f64 {
    (aggregates.probability_overload * 0.4
        + aggregates.probability_high_latency * 0.3
        + aggregates.probability_error_spike * 0.3)
        .clamp(0.0, 1.0)
}

/// Confidence grows with iteration count, saturating at 0.95.
#[must_use]
pub fn confidence(iterations: u32) -> f64 {
    (0.5 + f64::from(iterations) / 20000.0).min(0.95)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::Trend;

    fn state(cpu: f64, latency: f64, error_rate: f64) -> ServiceFeatures {
        ServiceFeatures {
            service_id: "svc-a".to_string(),
            timestamp: Utc::now(),
            cpu_current: cpu,
            cpu_avg_5m: cpu,
            cpu_avg_15m: cpu,
            cpu_ema: cpu,
            cpu_trend: Trend::Stable,
            latency_p50: latency / 2.0,
            latency_p95: latency,
            latency_p99: latency * 1.2,
            latency_ema: latency,
            error_rate,
            error_rate_5m: error_rate,
            error_spike: false,
            requests_per_sec: 500.0,
            requests_per_sec_5m: 500.0,
            requests_trend: Trend::Stable,
            queue_depth: 5,
            queue_depth_avg_5m: 5.0,
            queue_saturation: 0.05,
            load_score: 0.5,
            health_score: 0.8,
            throttling_risk: 0.0,
        }
    }

    fn request(scenario: Scenario, cpu: f64, latency: f64, error_rate: f64) -> SimulationRequest {
        let mut req = SimulationRequest {
            service_id: "svc-a".to_string(),
            policy_id: None,
            policy_version: None,
            snapshot_id: None,
            scenario,
            horizon_minutes: 10,
            iterations: 1000,
            seed: Some(42),
            current_state: state(cpu, latency, error_rate),
        };
        req.normalize(10_000);
        req
    }

    #[test]
    fn test_risk_monotonicity() {
        let base = SimulationAggregates {
            probability_overload: 0.2,
            probability_high_latency: 0.3,
            probability_error_spike: 0.1,
            expected_cost: 1.0,
            worst_case_cost: 2.0,
            best_case_cost: 0.5,
        };
        let base_risk = risk_score(&base);

        for bump in [0.05, 0.2, 0.5] {
            let mut a = base.clone();
            a.probability_overload += bump;
            assert!(risk_score(&a) >= base_risk);

            let mut b = base.clone();
            b.probability_high_latency += bump;
            assert!(risk_score(&b) >= base_risk);

            let mut c = base.clone();
            c.probability_error_spike += bump;
            assert!(risk_score(&c) >= base_risk);
        }

        let saturated = SimulationAggregates {
            probability_overload: 1.0,
            probability_high_latency: 1.0,
            probability_error_spike: 1.0,
            expected_cost: 1.0,
            worst_case_cost: 1.0,
            best_case_cost: 1.0,
        };
        assert!((risk_score(&saturated) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_recommendation_thresholds() {
        assert_eq!(Recommendation::for_risk(0.71), Recommendation::ScaleUpImmediate);
        assert_eq!(Recommendation::for_risk(0.6), Recommendation::ScaleUpPrepare);
        assert_eq!(Recommendation::for_risk(0.4), Recommendation::MonitorClosely);
        assert_eq!(Recommendation::for_risk(0.3), Recommendation::Maintain);
        assert_eq!(Recommendation::for_risk(0.0), Recommendation::Maintain);
    }

    #[test]
    fn test_seeded_runs_reproduce() {
        let req = request(Scenario::HighLoad, 60.0, 300.0, 0.02);
        let a = Simulator::new().run(&req).unwrap();
        let b = Simulator::new().run(&req).unwrap();

        assert_eq!(
            serde_json::to_string(&a.aggregates).unwrap(),
            serde_json::to_string(&b.aggregates).unwrap()
        );
        assert!((a.risk_score - b.risk_score).abs() < f64::EPSILON);
        assert_eq!(a.recommendation, b.recommendation);
    }

    #[test]
    fn test_failure_scenario_routes_to_scale_up() {
        let req = request(Scenario::Failure, 88.0, 450.0, 0.05);
        let result = Simulator::new().run(&req).unwrap();

        assert!(result.risk_score > 0.3, "risk {}", result.risk_score);
        assert!(
            matches!(
                result.recommendation,
                Recommendation::ScaleUpPrepare | Recommendation::ScaleUpImmediate
            ),
            "recommendation {:?} at risk {}",
            result.recommendation,
            result.risk_score
        );
        assert_eq!(result.status, SimulationStatus::Completed);
    }

    #[test]
    fn test_recovery_scenario_is_calm() {
        let req = request(Scenario::Recovery, 40.0, 150.0, 0.01);
        let result = Simulator::new().run(&req).unwrap();

        assert!(result.risk_score < 0.3);
        assert_eq!(result.recommendation, Recommendation::Maintain);
    }

    #[test]
    fn test_projection_stays_in_bounds() {
        let req = request(Scenario::HighLoad, 95.0, 900.0, 0.5);
        let result = Simulator::new().run(&req).unwrap();

        for state in &result.projected_states {
            assert!((0.0..=100.0).contains(&state.cpu_avg));
            assert!((0.0..=1.0).contains(&state.error_rate));
            assert!(state.latency_avg >= 0.0);
        }
        assert_eq!(result.projected_states.len(), 10);
        assert!(result.aggregates.best_case_cost <= result.aggregates.expected_cost);
        assert!(result.aggregates.expected_cost <= result.aggregates.worst_case_cost);
    }

    #[test]
    fn test_normalize_clamps_bounds() {
        let mut req = request(Scenario::Normal, 50.0, 100.0, 0.0);
        req.horizon_minutes = 60;
        req.iterations = 3;
        req.normalize(10_000);
        assert_eq!(req.horizon_minutes, DEFAULT_HORIZON_MINUTES);
        assert_eq!(req.iterations, DEFAULT_ITERATIONS);

        req.iterations = 50_000;
        req.normalize(10_000);
        assert_eq!(req.iterations, 10_000);
    }

    #[test]
    fn test_confidence_saturates() {
        assert!((confidence(1000) - 0.55).abs() < 1e-9);
        assert!((confidence(9000) - 0.95).abs() < 1e-9);
        assert!((confidence(100_000) - 0.95).abs() < f64::EPSILON);
    }

    #[test]
    fn test_missing_service_id_rejected() {
        let mut req = request(Scenario::Normal, 50.0, 100.0, 0.0);
        req.service_id = String::new();
        let err = Simulator::new().run(&req).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
