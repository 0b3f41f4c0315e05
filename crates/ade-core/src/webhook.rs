//! Outbound webhook delivery with retry, backoff and circuit breaking.
//!
//! Delivery goes through a [`Transport`] so the daemon can use HTTP while
//! tests substitute scripted transports. One circuit breaker is kept per
//! destination URL; the breaker wraps the whole retry loop, so a delivery
//! that exhausts its retries counts as a single breaker failure.
//!
//! Retry semantics: an attempt succeeds when the transport returns no error
//! and the response status is below 500. A 4xx response is terminal - it is
//! returned to the caller after a single attempt and never retried. On
//! exhaustion the final error is surfaced (kind `Upstream`, or `Timeout`
//! when the last attempt timed out) carrying the last observed status.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::breaker::{BreakerConfig, BreakerError, CircuitBreaker};
use crate::error::ErrorKind;

/// Response bodies recorded on action records are truncated to this size.
pub const MAX_RESPONSE_BODY_BYTES: usize = 4096;

/// Delivery client tuning.
#[derive(Debug, Clone, Copy)]
pub struct WebhookConfig {
    /// Per-attempt transport timeout.
    pub timeout: Duration,
    /// Additional attempts after the first (total attempts = retries + 1).
    pub max_retries: u32,
    /// First backoff interval; doubles each attempt.
    pub base_backoff: Duration,
    /// Backoff ceiling before jitter.
    pub max_backoff: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// A single outbound delivery.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryRequest {
    /// Destination URL.
    pub url: String,
    /// Delivery ID, sent as `X-Webhook-ID`.
    pub webhook_id: String,
    /// Extra headers beyond the canonical set.
    pub headers: Vec<(String, String)>,
    /// JSON body.
    pub payload: serde_json::Value,
}

/// The transport-level view of one attempt.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body, already truncated by the transport.
    pub body: String,
}

/// Transport-level failure of one attempt.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The attempt exceeded its deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Connection or protocol failure.
    #[error("transport error: {0}")]
    Transport(String),
}

/// A delivery mechanism. Implemented over HTTP by [`HttpTransport`]; tests
/// substitute scripted implementations.
pub trait Transport: Send + Sync {
    /// Performs one delivery attempt within `timeout`.
    fn send<'a>(
        &'a self,
        request: &'a DeliveryRequest,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<TransportResponse, TransportError>> + Send + 'a>>;
}

/// The reqwest-backed production transport.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Builds the transport.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::Transport`] when the underlying client cannot
    /// be constructed.
    pub fn new() -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| WebhookError::Transport(e.to_string()))?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn send<'a>(
        &'a self,
        request: &'a DeliveryRequest,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<TransportResponse, TransportError>> + Send + 'a>> {
        Box::pin(async move {
            let mut builder = self
                .client
                .post(&request.url)
                .timeout(timeout)
                .header("Content-Type", "application/json")
                .header("X-Webhook-ID", &request.webhook_id);
            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }

            let response = builder.json(&request.payload).send().await.map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout(timeout)
                } else {
                    TransportError::Transport(e.to_string())
                }
            })?;

            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            let body = truncate_body(&body);
            Ok(TransportResponse { status, body })
        })
    }
}

/// The caller-facing outcome of a successful delivery.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// Final HTTP status (may be 4xx; see module docs).
    pub status: u16,
    /// Truncated response body.
    pub body: String,
    /// Attempts actually made.
    pub attempts: u32,
    /// Total wall-clock across attempts and backoffs.
    pub duration: Duration,
}

/// Delivery failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WebhookError {
    /// The destination URL does not parse.
    #[error("invalid webhook url: {0}")]
    InvalidUrl(String),

    /// The destination's circuit rejected the delivery.
    #[error(transparent)]
    CircuitOpen(#[from] BreakerError),

    /// Every attempt failed; carries the last observed status, if any.
    #[error("webhook failed after {attempts} attempts: {message}")]
    Exhausted {
        /// Attempts made before giving up.
        attempts: u32,
        /// Last observed HTTP status, when the failure was a 5xx.
        last_status: Option<u16>,
        /// Final error detail.
        message: String,
    },

    /// Every attempt failed and the final one timed out.
    #[error("webhook timed out after {attempts} attempts")]
    TimedOut {
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// Transport construction or bookkeeping failure.
    #[error("webhook transport: {0}")]
    Transport(String),
}

impl WebhookError {
    /// Taxonomy classification.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidUrl(_) => ErrorKind::Validation,
            Self::CircuitOpen(_) => ErrorKind::CircuitOpen,
            Self::Exhausted { .. } | Self::Transport(_) => ErrorKind::Upstream,
            Self::TimedOut { .. } => ErrorKind::Timeout,
        }
    }
}

/// Webhook delivery client: retry loop plus per-destination breakers.
pub struct WebhookClient {
    transport: Arc<dyn Transport>,
    config: WebhookConfig,
    breaker_config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl WebhookClient {
    /// Creates a client over the given transport.
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        config: WebhookConfig,
        breaker_config: BreakerConfig,
    ) -> Self {
        Self {
            transport,
            config,
            breaker_config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Delivers `request` under the retry and circuit-breaker policy.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError`] when the URL is invalid, the destination's
    /// circuit is open (in which case no request was issued), or every
    /// attempt failed.
    pub async fn send(&self, request: &DeliveryRequest) -> Result<DeliveryResponse, WebhookError> {
        reqwest::Url::parse(&request.url)
            .map_err(|e| WebhookError::InvalidUrl(format!("{}: {e}", request.url)))?;

        let breaker = self.breaker_for(&request.url);
        breaker.try_acquire()?;

        match self.send_with_retries(request).await {
            Ok(response) => {
                breaker.record_success();
                Ok(response)
            },
            Err(err) => {
                breaker.record_failure();
                Err(err)
            },
        }
    }

    /// State of the breaker guarding `url`, for observability.
    #[must_use]
    pub fn breaker_state(&self, url: &str) -> Option<crate::breaker::BreakerState> {
        self.lock_breakers().get(url).map(|b| b.state())
    }

    async fn send_with_retries(
        &self,
        request: &DeliveryRequest,
    ) -> Result<DeliveryResponse, WebhookError> {
        let started = Instant::now();
        let mut last_status: Option<u16> = None;
        let mut last_error: Option<TransportError> = None;

        for attempt in 0..=self.config.max_retries {
            match self.transport.send(request, self.config.timeout).await {
                Ok(response) if response.status < 500 => {
                    return Ok(DeliveryResponse {
                        status: response.status,
                        body: truncate_body(&response.body),
                        attempts: attempt + 1,
                        duration: started.elapsed(),
                    });
                },
                Ok(response) => {
                    last_status = Some(response.status);
                    last_error = None;
                },
                Err(err) => {
                    last_status = None;
                    last_error = Some(err);
                },
            }

            if attempt < self.config.max_retries {
                let backoff = self.backoff(attempt);
                warn!(
                    url = %request.url,
                    webhook_id = %request.webhook_id,
                    attempt = attempt + 1,
                    max_retries = self.config.max_retries,
                    backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                    "webhook attempt failed, retrying"
                );
                tokio::time::sleep(backoff).await;
            }
        }

        let attempts = self.config.max_retries + 1;
        if let Some(TransportError::Timeout(_)) = last_error {
            return Err(WebhookError::TimedOut { attempts });
        }
        let message = match (&last_error, last_status) {
            (Some(err), _) => err.to_string(),
            (None, Some(status)) => format!("status {status}"),
            (None, None) => "no attempt recorded".to_string(),
        };
        Err(WebhookError::Exhausted {
            attempts,
            last_status,
            message,
        })
    }

    /// Backoff before the retry following `attempt`: exponential from the
    /// base, capped, plus 10% additive jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .config
            .base_backoff
            .saturating_mul(2u32.saturating_pow(attempt));
        let capped = exp.min(self.config.max_backoff);
        capped + capped.mul_f64(0.1)
    }

    fn breaker_for(&self, url: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.lock_breakers();
        Arc::clone(
            breakers
                .entry(url.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(url, self.breaker_config))),
        )
    }

    fn lock_breakers(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_RESPONSE_BODY_BYTES {
        body.to_string()
    } else {
        let mut end = MAX_RESPONSE_BODY_BYTES;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body[..end].to_string()
    }
}
