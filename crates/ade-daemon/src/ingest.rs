//! Event ingestion: admit, validate, deduplicate, persist, publish.
//!
//! Deduplication rides the unique index on `idempotency_key`; re-ingesting a
//! key is a no-op reported as a duplicate success. Batch ingestion has
//! partial-success semantics: one bad item never aborts the rest, and item
//! order is preserved. Publication to the downstream event log goes through
//! the [`EventPublisher`] seam; the log itself is an external collaborator.

use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use ade_core::error::ErrorKind;
use ade_core::event::{Event, EventError, EventType};

use crate::storage::{EventStore, StorageError};

/// Downstream event-log seam. Implementations must be cheap to call per
/// event; failures are reported but never fail ingestion.
pub trait EventPublisher: Send + Sync {
    /// Publishes one admitted event, keyed by its `service_id`.
    fn publish<'a>(
        &'a self,
        event: &'a Event,
    ) -> Pin<Box<dyn Future<Output = Result<(), PublishError>> + Send + 'a>>;
}

/// Publication failure; surfaced as `published = false`, never as an
/// ingestion error.
#[derive(Debug, Error)]
#[error("publish failed: {0}")]
pub struct PublishError(pub String);

/// Publisher used when no event log is configured: records the event in the
/// structured log and reports it as published.
pub struct LogPublisher;

impl EventPublisher for LogPublisher {
    fn publish<'a>(
        &'a self,
        event: &'a Event,
    ) -> Pin<Box<dyn Future<Output = Result<(), PublishError>> + Send + 'a>> {
        Box::pin(async move {
            debug!(
                event_id = %event.event_id,
                service_id = %event.service_id,
                event_type = %event.event_type,
                "event published to log sink"
            );
            Ok(())
        })
    }
}

/// One event as submitted by a caller. The event type arrives as a string so
/// an out-of-closure label surfaces as a validation error rather than a
/// deserialization failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRequest {
    /// Caller-assigned event ID.
    pub event_id: String,
    /// Caller-chosen dedup token.
    pub idempotency_key: String,
    /// The service the event describes.
    pub service_id: String,
    /// Event type label.
    pub event_type: String,
    /// Opaque payload.
    pub payload: serde_json::Value,
    /// Sample instant; defaults to arrival time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Per-event ingestion outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestResponse {
    /// The event submitted.
    pub event_id: String,
    /// `accepted`, `duplicate` or `error`.
    pub status: String,
    /// Whether a row for this idempotency key is durably stored.
    pub stored: bool,
    /// Whether the event reached the downstream log.
    pub published: bool,
    /// Whether this submission collided with an earlier idempotency key.
    pub duplicate: bool,
    /// Failure detail for batch items that were rejected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the outcome was produced.
    pub timestamp: DateTime<Utc>,
}

/// Ingestion failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IngestError {
    /// The event failed validation.
    #[error(transparent)]
    Invalid(#[from] EventError),

    /// Persistence failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl IngestError {
    /// Taxonomy classification.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Invalid(e) => e.kind(),
            Self::Storage(e) => e.kind(),
        }
    }
}

/// The ingestion service.
pub struct IngestService {
    events: EventStore,
    publisher: Arc<dyn EventPublisher>,
}

impl IngestService {
    /// Creates the service.
    #[must_use]
    pub fn new(events: EventStore, publisher: Arc<dyn EventPublisher>) -> Self {
        Self { events, publisher }
    }

    /// Admits a single event.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError`] when validation or persistence fails. An
    /// idempotency-key collision is not an error: the response reports
    /// `stored = true, duplicate = true`.
    pub async fn ingest(&self, request: &IngestRequest) -> Result<IngestResponse, IngestError> {
        let event_type = EventType::from_str(&request.event_type)?;
        let event = Event {
            event_id: request.event_id.clone(),
            idempotency_key: request.idempotency_key.clone(),
            service_id: request.service_id.clone(),
            event_type,
            payload: request.payload.clone(),
            timestamp: request.timestamp.unwrap_or_else(Utc::now),
            processed_at: None,
        };
        event.validate()?;

        let newly_stored = self.events.insert(&event).await?;

        // Duplicates are a no-op by contract; only first admissions reach
        // the downstream log.
        let published = if newly_stored {
            match self.publisher.publish(&event).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(
                        event_id = %event.event_id,
                        error = %e,
                        "failed to publish event downstream"
                    );
                    false
                },
            }
        } else {
            false
        };

        info!(
            event_id = %event.event_id,
            service_id = %event.service_id,
            duplicate = !newly_stored,
            published,
            "event ingested"
        );

        Ok(IngestResponse {
            event_id: event.event_id,
            status: if newly_stored {
                "accepted".to_string()
            } else {
                "duplicate".to_string()
            },
            stored: true,
            published,
            duplicate: !newly_stored,
            error: None,
            timestamp: Utc::now(),
        })
    }

    /// Admits a batch with partial-success semantics: per-item outcomes in
    /// input order, and no item aborts the rest.
    pub async fn ingest_batch(&self, requests: &[IngestRequest]) -> Vec<IngestResponse> {
        let mut responses = Vec::with_capacity(requests.len());
        for request in requests {
            match self.ingest(request).await {
                Ok(response) => responses.push(response),
                Err(e) => {
                    error!(
                        event_id = %request.event_id,
                        error = %e,
                        "batch item rejected"
                    );
                    responses.push(IngestResponse {
                        event_id: request.event_id.clone(),
                        status: "error".to_string(),
                        stored: false,
                        published: false,
                        duplicate: false,
                        error: Some(e.to_string()),
                        timestamp: Utc::now(),
                    });
                },
            }
        }
        responses
    }
}
