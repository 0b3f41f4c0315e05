//! The closed error taxonomy shared by every component.
//!
//! Errors are classified into a small closed set of kinds; each module's
//! `thiserror` enum exposes a `kind()` accessor mapping into this taxonomy.
//! The daemon turns kinds into HTTP status codes at the API boundary.

use serde::{Deserialize, Serialize};

/// Classification of a failure, driving both propagation and the HTTP
/// status the daemon surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Input shape, enum or bounds violation. Returned to the caller with
    /// field detail.
    Validation,
    /// Entity not found by business ID.
    NotFound,
    /// Idempotency conflict; the winning record is returned as an idempotent
    /// success.
    Duplicate,
    /// The action runtime refused delivery because a circuit is open.
    CircuitOpen,
    /// Webhook/HTTP target error. Retryable if transport-level or 5xx,
    /// terminal otherwise.
    Upstream,
    /// Deadline exceeded; retryable like [`ErrorKind::Upstream`].
    Timeout,
    /// Invariant violation or unexpected storage error.
    Internal,
}

impl ErrorKind {
    /// Stable wire name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Duplicate => "duplicate",
            Self::CircuitOpen => "circuit_open",
            Self::Upstream => "upstream",
            Self::Timeout => "timeout",
            Self::Internal => "internal",
        }
    }

    /// Whether a delivery attempt failing with this kind may be retried.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Upstream | Self::Timeout)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_are_stable() {
        assert_eq!(ErrorKind::Validation.as_str(), "validation");
        assert_eq!(ErrorKind::CircuitOpen.as_str(), "circuit_open");
        assert_eq!(ErrorKind::Internal.as_str(), "internal");
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::Upstream.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(!ErrorKind::Validation.is_retryable());
        assert!(!ErrorKind::CircuitOpen.is_retryable());
    }
}
