//! Feature derivation over a per-service event window.
//!
//! The builder is a pure function of its input window: given the same events
//! and reference instant it produces byte-identical features. Percentiles use
//! linear interpolation on the sorted sample (the "type 7" definition), EMAs
//! use `alpha = 0.3` seeded on the first sample, and trends compare the mean
//! of the first 20% of samples against the mean of the last 20%.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorKind;
use crate::event::{Event, EventType, MetricsPayload};

/// Smoothing factor for the CPU and latency EMAs.
pub const EMA_ALPHA: f64 = 0.3;

/// Relative difference beyond which a trend is labelled as moving.
const TREND_THRESHOLD: f64 = 0.1;

/// Nominal queue capacity implied by the load-score weighting.
const QUEUE_NOMINAL_CAPACITY: f64 = 100.0;

/// Direction label for a windowed series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    /// Last fifth of the window runs more than 10% above the first fifth.
    Increasing,
    /// Last fifth runs more than 10% below the first fifth.
    Decreasing,
    /// Neither bound crossed.
    Stable,
}

impl Trend {
    /// Stable wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Increasing => "increasing",
            Self::Decreasing => "decreasing",
            Self::Stable => "stable",
        }
    }
}

impl std::fmt::Display for Trend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derived per-service features, the input to every decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceFeatures {
    /// The service the window describes.
    pub service_id: String,
    /// Reference instant the window ends at.
    pub timestamp: DateTime<Utc>,

    /// CPU of the most recent sample.
    pub cpu_current: f64,
    /// Mean CPU over the window.
    pub cpu_avg_5m: f64,
    /// Mean CPU over the trailing 15 minutes of the window.
    pub cpu_avg_15m: f64,
    /// Exponential moving average of CPU (`alpha = 0.3`).
    pub cpu_ema: f64,
    /// CPU direction over the window.
    pub cpu_trend: Trend,

    /// Median latency.
    pub latency_p50: f64,
    /// 95th percentile latency.
    pub latency_p95: f64,
    /// 99th percentile latency.
    pub latency_p99: f64,
    /// Exponential moving average of latency.
    pub latency_ema: f64,

    /// Mean error rate over the window.
    pub error_rate: f64,
    /// Mean error rate over the trailing five minutes of the window.
    pub error_rate_5m: f64,
    /// Whether the most recent sample spikes above the window baseline.
    pub error_spike: bool,

    /// Throughput of the most recent sample.
    #[serde(rename = "requests_per_second")]
    pub requests_per_sec: f64,
    /// Mean throughput over the window.
    #[serde(rename = "requests_per_second_5m")]
    pub requests_per_sec_5m: f64,
    /// Throughput direction over the window.
    pub requests_trend: Trend,

    /// Queue depth of the most recent sample.
    pub queue_depth: i64,
    /// Mean queue depth over the window.
    pub queue_depth_avg_5m: f64,
    /// Mean queue depth relative to nominal capacity, clamped to `[0, 1]`.
    pub queue_saturation: f64,

    /// Composite load score in `[0, 1]`.
    pub load_score: f64,
    /// Composite health score in `[0, 1]`.
    pub health_score: f64,
    /// Probability-like throttling risk in `[0, 1]`.
    pub throttling_risk: f64,
}

/// An immutable, persisted derivation of a service's recent state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSnapshot {
    /// Business ID (`snap-<service>-<unix-seconds>`).
    pub snapshot_id: String,
    /// The service the snapshot describes.
    pub service_id: String,
    /// The derived features.
    pub features: ServiceFeatures,
    /// When the derivation ran.
    pub calculated_at: DateTime<Utc>,
    /// Strictly greater than `calculated_at`; invalidation sets this to now.
    pub valid_until: DateTime<Utc>,
    /// The events that fed the derivation.
    pub event_ids: Vec<String>,
}

impl FeatureSnapshot {
    /// Builds a snapshot valid for one further window length.
    #[must_use]
    pub fn new(
        features: ServiceFeatures,
        event_ids: Vec<String>,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Self {
        Self {
            snapshot_id: format!("snap-{}-{}", features.service_id, now.timestamp()),
            service_id: features.service_id.clone(),
            features,
            calculated_at: now,
            valid_until: now + window,
            event_ids,
        }
    }
}

/// Feature derivation failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FeatureError {
    /// No events at all for the service in the window.
    #[error("no events for service {service_id} in window")]
    NoEventsInWindow {
        /// The service queried.
        service_id: String,
    },

    /// Events exist but none carried a parseable metrics payload.
    #[error("no metrics events for service {service_id} in window")]
    NoMetricsInWindow {
        /// The service queried.
        service_id: String,
    },
}

impl FeatureError {
    /// Taxonomy classification.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        ErrorKind::NotFound
    }
}

/// Derives [`ServiceFeatures`] from a chronologically-ordered event window.
///
/// Non-metrics events and unparseable payloads are skipped. `now` is the
/// window end; passing the same events and `now` yields byte-identical
/// output.
///
/// # Errors
///
/// Returns [`FeatureError`] when the window is empty or holds no usable
/// metrics samples.
pub fn build_features(
    service_id: &str,
    events: &[Event],
    now: DateTime<Utc>,
) -> Result<ServiceFeatures, FeatureError> {
    if events.is_empty() {
        return Err(FeatureError::NoEventsInWindow {
            service_id: service_id.to_string(),
        });
    }

    let samples: Vec<(DateTime<Utc>, MetricsPayload)> = events
        .iter()
        .filter(|e| e.event_type == EventType::Metrics)
        .filter_map(|e| e.metrics_payload().ok().map(|m| (e.timestamp, m)))
        .collect();

    if samples.is_empty() {
        return Err(FeatureError::NoMetricsInWindow {
            service_id: service_id.to_string(),
        });
    }

    let n = samples.len() as f64;
    let cpu_values: Vec<f64> = samples.iter().map(|(_, m)| m.cpu).collect();
    let latency_values: Vec<f64> = samples.iter().map(|(_, m)| m.latency_ms).collect();
    let rps_values: Vec<f64> = samples.iter().map(|(_, m)| m.requests_per_sec).collect();

    let last = &samples[samples.len() - 1].1;

    let cpu_current = last.cpu;
    let cpu_avg_5m = cpu_values.iter().sum::<f64>() / n;
    let cutoff_15m = now - Duration::minutes(15);
    let recent_15m: Vec<f64> = samples
        .iter()
        .filter(|(ts, _)| *ts >= cutoff_15m)
        .map(|(_, m)| m.cpu)
        .collect();
    let cpu_avg_15m = if recent_15m.is_empty() {
        cpu_avg_5m
    } else {
        recent_15m.iter().sum::<f64>() / recent_15m.len() as f64
    };

    let error_rate = samples.iter().map(|(_, m)| m.error_rate).sum::<f64>() / n;
    let cutoff_5m = now - Duration::minutes(5);
    let recent_errors: Vec<f64> = samples
        .iter()
        .filter(|(ts, _)| *ts >= cutoff_5m)
        .map(|(_, m)| m.error_rate)
        .collect();
    let error_rate_5m = if recent_errors.is_empty() {
        error_rate
    } else {
        recent_errors.iter().sum::<f64>() / recent_errors.len() as f64
    };
    let error_spike = last.error_rate > 0.05 && last.error_rate > 2.0 * error_rate;

    let queue_depth = last.queue_depth;
    let queue_depth_avg_5m = samples.iter().map(|(_, m)| m.queue_depth as f64).sum::<f64>() / n;
    let queue_saturation = clamp01(queue_depth_avg_5m / QUEUE_NOMINAL_CAPACITY);

    let load_score = clamp01(
        cpu_current / 100.0 * 0.5 + queue_depth_avg_5m / 100.0 * 0.3 + error_rate * 0.2,
    );
    let health_score = clamp01(1.0 - error_rate * 2.0 - cpu_current / 200.0);

    let latency_p95 = percentile(&latency_values, 0.95);
    let throttling_risk = if cpu_current > 70.0 && latency_p95 > 500.0 {
        clamp01((cpu_current - 70.0) / 30.0 * 0.7 + (latency_p95 - 500.0) / 500.0 * 0.3)
    } else {
        0.0
    };

    Ok(ServiceFeatures {
        service_id: service_id.to_string(),
        timestamp: now,
        cpu_current,
        cpu_avg_5m,
        cpu_avg_15m,
        cpu_ema: ema(&cpu_values, EMA_ALPHA),
        cpu_trend: trend(&cpu_values),
        latency_p50: percentile(&latency_values, 0.5),
        latency_p95,
        latency_p99: percentile(&latency_values, 0.99),
        latency_ema: ema(&latency_values, EMA_ALPHA),
        error_rate,
        error_rate_5m,
        error_spike,
        requests_per_sec: last.requests_per_sec,
        requests_per_sec_5m: rps_values.iter().sum::<f64>() / n,
        requests_trend: trend(&rps_values),
        queue_depth,
        queue_depth_avg_5m,
        queue_saturation,
        load_score,
        health_score,
        throttling_risk,
    })
}

/// Linear-interpolation percentile (the "type 7" definition) over an
/// unsorted sample.
///
/// For index `k = (n-1)*p` the result is
/// `s[floor(k)]*(ceil(k)-k) + s[ceil(k)]*(k-floor(k))` on the sorted sample.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let k = (sorted.len() - 1) as f64 * p;
    let floor = k.floor();
    let ceil = k.ceil();
    if (floor - ceil).abs() < f64::EPSILON {
        sorted[k as usize]
    } else {
        sorted[floor as usize] * (ceil - k) + sorted[ceil as usize] * (k - floor)
    }
}

/// Exponential moving average seeded on the first sample.
#[must_use]
pub fn ema(values: &[f64], alpha: f64) -> f64 {
    let Some((first, rest)) = values.split_first() else {
        return 0.0;
    };
    rest.iter().fold(*first, |acc, v| alpha * v + (1.0 - alpha) * acc)
}

/// Labels the direction of a series by comparing the mean of the first 20%
/// of samples against the mean of the last 20%.
#[must_use]
pub fn trend(values: &[f64]) -> Trend {
    if values.len() < 2 {
        return Trend::Stable;
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let start_idx = ((values.len() as f64 * 0.2) as usize).max(1);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let end_idx = ((values.len() as f64 * 0.8) as usize).min(values.len() - 1);

    let start_avg = values[..start_idx].iter().sum::<f64>() / start_idx as f64;
    let end_avg =
        values[end_idx..].iter().sum::<f64>() / (values.len() - end_idx) as f64;

    // A zero baseline yields an infinite or NaN ratio; NaN compares false on
    // both bounds and falls through to stable.
    let diff = (end_avg - start_avg) / start_avg;
    if diff > TREND_THRESHOLD {
        Trend::Increasing
    } else if diff < -TREND_THRESHOLD {
        Trend::Decreasing
    } else {
        Trend::Stable
    }
}

fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}
