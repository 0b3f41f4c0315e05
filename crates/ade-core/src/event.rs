//! Event model: the raw unit of telemetry admitted by ingest.
//!
//! An [`Event`] carries an opaque JSON payload; payloads are parsed into the
//! strongly-typed variants ([`MetricsPayload`], [`AlertPayload`],
//! [`CustomPayload`]) keyed by [`EventType`] only at use sites. Validation
//! checks both the envelope shape and, per event type, the payload bounds.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorKind;

/// The closed set of admissible event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Operational metrics sample (cpu, latency, error rate, throughput,
    /// queue depth).
    Metrics,
    /// An alert raised by an external monitor.
    Alert,
    /// Free-form, named custom event.
    Custom,
}

impl EventType {
    /// Stable wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Metrics => "metrics",
            Self::Alert => "alert",
            Self::Custom => "custom",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "metrics" => Ok(Self::Metrics),
            "alert" => Ok(Self::Alert),
            "custom" => Ok(Self::Custom),
            other => Err(EventError::UnknownEventType(other.to_string())),
        }
    }
}

/// Alert severity closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    /// Informational.
    Low,
    /// Needs attention.
    Medium,
    /// Needs prompt attention.
    High,
    /// Service-impacting.
    Critical,
}

/// A raw event as admitted by ingest.
///
/// `idempotency_key` is distinct from `event_id`: at most one stored row per
/// key; re-ingest of the same key is a no-op. Events are never mutated after
/// admission except for stamping `processed_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Caller-assigned unique event ID.
    pub event_id: String,
    /// Caller-chosen dedup token; unique across the event log.
    pub idempotency_key: String,
    /// The monitored service this event describes.
    pub service_id: String,
    /// Which payload variant `payload` holds.
    pub event_type: EventType,
    /// Opaque payload, parsed per `event_type` at use sites.
    pub payload: serde_json::Value,
    /// When the sample was taken.
    pub timestamp: DateTime<Utc>,
    /// Set once the event has been consumed downstream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
}

/// Payload of a [`EventType::Metrics`] event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsPayload {
    /// CPU utilisation percentage, in `[0, 100]`.
    pub cpu: f64,
    /// Observed latency in milliseconds, non-negative.
    pub latency_ms: f64,
    /// Error rate in `[0, 1]`.
    pub error_rate: f64,
    /// Request throughput, non-negative.
    #[serde(rename = "requests_per_second")]
    pub requests_per_sec: f64,
    /// Work-queue depth, non-negative.
    #[serde(default)]
    pub queue_depth: i64,
}

/// Payload of an [`EventType::Alert`] event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertPayload {
    /// Alert classification chosen by the emitting monitor.
    pub alert_type: String,
    /// Severity from the closed set.
    pub severity: AlertSeverity,
    /// Optional human-readable detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Payload of an [`EventType::Custom`] event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomPayload {
    /// Name of the custom event.
    pub event_name: String,
    /// Arbitrary nested payload.
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Event validation and payload extraction failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EventError {
    /// A required envelope field is empty.
    #[error("{0} is required")]
    MissingField(&'static str),

    /// The event type is outside the closed set.
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    /// The payload does not deserialize into the variant for its type.
    #[error("malformed {event_type} payload: {reason}")]
    MalformedPayload {
        /// The event type whose schema was violated.
        event_type: EventType,
        /// Parser detail.
        reason: String,
    },

    /// A numeric payload field is outside its admissible range.
    #[error("{field} out of range: {detail}")]
    FieldOutOfRange {
        /// The offending field.
        field: &'static str,
        /// What bound was violated.
        detail: String,
    },

    /// The payload was requested as the wrong variant.
    #[error("event type is {actual}, not {expected}")]
    WrongEventType {
        /// The variant the caller asked for.
        expected: EventType,
        /// The event's actual type.
        actual: EventType,
    },
}

impl EventError {
    /// Taxonomy classification.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

impl Event {
    /// Validates the envelope and, per event type, the payload bounds.
    ///
    /// # Errors
    ///
    /// Returns [`EventError`] when a required field is empty, the payload
    /// does not conform to the variant schema, or a numeric field is out of
    /// range.
    pub fn validate(&self) -> Result<(), EventError> {
        if self.event_id.is_empty() {
            return Err(EventError::MissingField("event_id"));
        }
        if self.idempotency_key.is_empty() {
            return Err(EventError::MissingField("idempotency_key"));
        }
        if self.service_id.is_empty() {
            return Err(EventError::MissingField("service_id"));
        }
        if self.payload.is_null() {
            return Err(EventError::MissingField("payload"));
        }

        match self.event_type {
            EventType::Metrics => {
                self.metrics_payload()?;
            },
            EventType::Alert => {
                let alert = self.alert_payload()?;
                if alert.alert_type.is_empty() {
                    return Err(EventError::MissingField("alert_type"));
                }
            },
            EventType::Custom => {
                let custom = self.custom_payload()?;
                if custom.event_name.is_empty() {
                    return Err(EventError::MissingField("event_name"));
                }
            },
        }

        Ok(())
    }

    /// Parses the payload as metrics and checks the numeric bounds.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::WrongEventType`] for non-metrics events,
    /// [`EventError::MalformedPayload`] when the shape does not parse, and
    /// [`EventError::FieldOutOfRange`] for bound violations.
    pub fn metrics_payload(&self) -> Result<MetricsPayload, EventError> {
        if self.event_type != EventType::Metrics {
            return Err(EventError::WrongEventType {
                expected: EventType::Metrics,
                actual: self.event_type,
            });
        }

        let metrics: MetricsPayload = serde_json::from_value(self.payload.clone())
            .map_err(|e| EventError::MalformedPayload {
                event_type: EventType::Metrics,
                reason: e.to_string(),
            })?;

        if !(0.0..=100.0).contains(&metrics.cpu) {
            return Err(EventError::FieldOutOfRange {
                field: "cpu",
                detail: format!("{} not in [0, 100]", metrics.cpu),
            });
        }
        if metrics.latency_ms < 0.0 {
            return Err(EventError::FieldOutOfRange {
                field: "latency_ms",
                detail: format!("{} is negative", metrics.latency_ms),
            });
        }
        if !(0.0..=1.0).contains(&metrics.error_rate) {
            return Err(EventError::FieldOutOfRange {
                field: "error_rate",
                detail: format!("{} not in [0, 1]", metrics.error_rate),
            });
        }
        if metrics.requests_per_sec < 0.0 {
            return Err(EventError::FieldOutOfRange {
                field: "requests_per_second",
                detail: format!("{} is negative", metrics.requests_per_sec),
            });
        }
        if metrics.queue_depth < 0 {
            return Err(EventError::FieldOutOfRange {
                field: "queue_depth",
                detail: format!("{} is negative", metrics.queue_depth),
            });
        }

        Ok(metrics)
    }

    /// Parses the payload as an alert.
    ///
    /// # Errors
    ///
    /// Returns [`EventError`] for non-alert events or malformed payloads
    /// (including severities outside the closed set).
    pub fn alert_payload(&self) -> Result<AlertPayload, EventError> {
        if self.event_type != EventType::Alert {
            return Err(EventError::WrongEventType {
                expected: EventType::Alert,
                actual: self.event_type,
            });
        }
        serde_json::from_value(self.payload.clone()).map_err(|e| EventError::MalformedPayload {
            event_type: EventType::Alert,
            reason: e.to_string(),
        })
    }

    /// Parses the payload as a custom event.
    ///
    /// # Errors
    ///
    /// Returns [`EventError`] for non-custom events or malformed payloads.
    pub fn custom_payload(&self) -> Result<CustomPayload, EventError> {
        if self.event_type != EventType::Custom {
            return Err(EventError::WrongEventType {
                expected: EventType::Custom,
                actual: self.event_type,
            });
        }
        serde_json::from_value(self.payload.clone()).map_err(|e| EventError::MalformedPayload {
            event_type: EventType::Custom,
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn metrics_event(payload: serde_json::Value) -> Event {
        Event {
            event_id: "evt-1".to_string(),
            idempotency_key: "key-1".to_string(),
            service_id: "svc-a".to_string(),
            event_type: EventType::Metrics,
            payload,
            timestamp: Utc::now(),
            processed_at: None,
        }
    }

    #[test]
    fn test_valid_metrics_event() {
        let event = metrics_event(json!({
            "cpu": 95.0,
            "latency_ms": 450.0,
            "error_rate": 0.02,
            "requests_per_second": 900.0,
            "queue_depth": 5
        }));
        assert!(event.validate().is_ok());
    }

    #[test]
    fn test_event_type_closure() {
        assert!(EventType::from_str("metrics").is_ok());
        assert!(EventType::from_str("alert").is_ok());
        assert!(EventType::from_str("custom").is_ok());
        for bad in ["metric", "ALERT", "log", "", "trace"] {
            let err = EventType::from_str(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation, "{bad}");
        }
    }

    #[test]
    fn test_metrics_bounds_closure() {
        let cases = vec![
            json!({"cpu": 101.0, "latency_ms": 1.0, "error_rate": 0.1, "requests_per_second": 1.0}),
            json!({"cpu": -1.0, "latency_ms": 1.0, "error_rate": 0.1, "requests_per_second": 1.0}),
            json!({"cpu": 50.0, "latency_ms": -5.0, "error_rate": 0.1, "requests_per_second": 1.0}),
            json!({"cpu": 50.0, "latency_ms": 1.0, "error_rate": 1.5, "requests_per_second": 1.0}),
            json!({"cpu": 50.0, "latency_ms": 1.0, "error_rate": 0.1, "requests_per_second": -1.0}),
            json!({"cpu": 50.0, "latency_ms": 1.0, "error_rate": 0.1, "requests_per_second": 1.0, "queue_depth": -3}),
        ];
        for payload in cases {
            let event = metrics_event(payload.clone());
            let err = event.validate().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation, "{payload}");
        }
    }

    #[test]
    fn test_missing_envelope_fields() {
        let mut event = metrics_event(json!({
            "cpu": 1.0, "latency_ms": 1.0, "error_rate": 0.0, "requests_per_second": 1.0
        }));
        event.event_id = String::new();
        assert!(matches!(
            event.validate(),
            Err(EventError::MissingField("event_id"))
        ));

        let mut event = metrics_event(json!({
            "cpu": 1.0, "latency_ms": 1.0, "error_rate": 0.0, "requests_per_second": 1.0
        }));
        event.idempotency_key = String::new();
        assert!(matches!(
            event.validate(),
            Err(EventError::MissingField("idempotency_key"))
        ));
    }

    #[test]
    fn test_alert_requires_known_severity() {
        let mut event = metrics_event(json!({
            "alert_type": "latency_budget",
            "severity": "catastrophic"
        }));
        event.event_type = EventType::Alert;
        assert!(matches!(
            event.validate(),
            Err(EventError::MalformedPayload { .. })
        ));

        event.payload = json!({"alert_type": "latency_budget", "severity": "high"});
        assert!(event.validate().is_ok());
    }

    #[test]
    fn test_wrong_payload_variant() {
        let event = metrics_event(json!({
            "cpu": 1.0, "latency_ms": 1.0, "error_rate": 0.0, "requests_per_second": 1.0
        }));
        assert!(matches!(
            event.alert_payload(),
            Err(EventError::WrongEventType { .. })
        ));
    }
}
