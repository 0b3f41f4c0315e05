//! Three-state circuit breaker guarding an unreliable destination.
//!
//! States: `closed` (pass through, count consecutive failures), `open`
//! (reject until the reset timeout elapses), `half_open` (admit a bounded
//! number of trial calls; enough successes close the breaker, any failure
//! re-opens it). All transitions are atomic; the breaker is safe for
//! concurrent callers.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorKind;

/// Breaker tuning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures in `closed` before opening.
    pub max_failures: u32,
    /// How long `open` rejects before admitting a trial call.
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,
    /// Successful trial calls required in `half_open` to close.
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_max_calls: 3,
        }
    }
}

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Normal operation.
    Closed,
    /// Rejecting calls after repeated failure.
    Open,
    /// Probing whether the destination recovered.
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Rejection reasons surfaced to callers.
#[derive(Debug, Error)]
pub enum BreakerError {
    /// The breaker is open; no call was attempted.
    #[error("circuit breaker open for {name}")]
    Open {
        /// The destination key the breaker guards.
        name: String,
    },

    /// The half-open trial budget is exhausted.
    #[error("circuit breaker half-open at capacity for {name}")]
    HalfOpenSaturated {
        /// The destination key the breaker guards.
        name: String,
    },
}

impl BreakerError {
    /// Taxonomy classification.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        ErrorKind::CircuitOpen
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failures: u32,
    successes: u32,
    last_failure: Option<Instant>,
}

/// A circuit breaker for one destination key.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Creates a closed breaker for `name`.
    #[must_use]
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: 0,
                successes: 0,
                last_failure: None,
            }),
        }
    }

    /// Asks the breaker for permission to attempt a call.
    ///
    /// In `open`, permission is granted once `reset_timeout` has elapsed
    /// since the last failure, transitioning to `half_open` with a fresh
    /// trial counter.
    ///
    /// # Errors
    ///
    /// Returns [`BreakerError`] when the call must be rejected; no request
    /// should be issued in that case.
    pub fn try_acquire(&self) -> Result<(), BreakerError> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = inner
                    .last_failure
                    .map_or(Duration::MAX, |at| at.elapsed());
                if elapsed > self.config.reset_timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.successes = 0;
                    Ok(())
                } else {
                    Err(BreakerError::Open {
                        name: self.name.clone(),
                    })
                }
            },
            BreakerState::HalfOpen => {
                if inner.successes >= self.config.half_open_max_calls {
                    Err(BreakerError::HalfOpenSaturated {
                        name: self.name.clone(),
                    })
                } else {
                    Ok(())
                }
            },
        }
    }

    /// Records a successful call.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => inner.failures = 0,
            BreakerState::HalfOpen => {
                inner.successes += 1;
                if inner.successes >= self.config.half_open_max_calls {
                    inner.state = BreakerState::Closed;
                    inner.failures = 0;
                    inner.successes = 0;
                }
            },
            BreakerState::Open => {},
        }
    }

    /// Records a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.failures += 1;
                inner.last_failure = Some(Instant::now());
                if inner.failures >= self.config.max_failures {
                    inner.state = BreakerState::Open;
                }
            },
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.last_failure = Some(Instant::now());
            },
            BreakerState::Open => {},
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Unconditionally returns to `closed` with zeroed counters.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = BreakerState::Closed;
        inner.failures = 0;
        inner.successes = 0;
    }

    /// The destination key this breaker guards.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        // A poisoned breaker mutex means a panic mid-transition; the counters
        // are still coherent, so recover the guard.
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(max_failures: u32, reset_timeout: Duration, half_open_max_calls: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            BreakerConfig {
                max_failures,
                reset_timeout,
                half_open_max_calls,
            },
        )
    }

    #[test]
    fn test_closed_to_open_after_max_failures() {
        let cb = breaker(3, Duration::from_secs(3600), 2);
        assert_eq!(cb.state(), BreakerState::Closed);

        for _ in 0..2 {
            cb.try_acquire().unwrap();
            cb.record_failure();
        }
        assert_eq!(cb.state(), BreakerState::Closed);

        cb.try_acquire().unwrap();
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);

        assert!(matches!(
            cb.try_acquire(),
            Err(BreakerError::Open { .. })
        ));
    }

    #[test]
    fn test_success_resets_closed_failure_count() {
        let cb = breaker(2, Duration::from_secs(3600), 2);
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        // Never two consecutive failures, so still closed.
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn test_open_transitions_to_half_open_after_timeout() {
        let cb = breaker(1, Duration::from_millis(5), 2);
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(10));
        cb.try_acquire().unwrap();
        assert_eq!(cb.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn test_half_open_closes_after_enough_successes() {
        let cb = breaker(1, Duration::from_millis(1), 3);
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(5));

        for _ in 0..3 {
            cb.try_acquire().unwrap();
            cb.record_success();
        }
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_reopens_on_any_failure() {
        let cb = breaker(1, Duration::from_millis(1), 3);
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(5));

        cb.try_acquire().unwrap();
        cb.record_success();
        cb.try_acquire().unwrap();
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[test]
    fn test_half_open_success_budget_closes_exactly_at_max() {
        let cb = breaker(1, Duration::from_millis(1), 2);
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(5));

        cb.try_acquire().unwrap();
        cb.record_success();
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        cb.try_acquire().unwrap();
        cb.record_success();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn test_reset_returns_to_closed() {
        let cb = breaker(1, Duration::from_secs(3600), 2);
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);

        cb.reset();
        assert_eq!(cb.state(), BreakerState::Closed);
        cb.try_acquire().unwrap();
    }

    #[test]
    fn test_rejection_kind_is_circuit_open() {
        let cb = breaker(1, Duration::from_secs(3600), 2);
        cb.record_failure();
        let err = cb.try_acquire().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
    }
}
