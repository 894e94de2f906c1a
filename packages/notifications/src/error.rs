//! Structured error cases for the notification pipeline.
//!
//! `anyhow::Error` is the transport across async seams; the cases below are
//! the pattern-matchable errors callers may need to distinguish. Recover
//! them with `err.downcast_ref::<Error>()`.

use thiserror::Error;

/// Pattern-matchable error cases carried inside `anyhow::Error`.
#[derive(Debug, Error)]
pub enum Error {
    /// Caller passed an invalid argument (empty ID, empty URL). Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A lookup for a record that does not exist.
    #[error("not found: {id}")]
    NotFound { id: String },

    /// The per-endpoint circuit breaker rejected the request without
    /// touching the network.
    #[error("circuit breaker open for {url}")]
    CircuitOpen { url: String },

    /// A delivery sequence exhausted its retry budget.
    #[error("delivery failed after {attempts} attempts: {last_error}")]
    DeliveryFailed { attempts: u32, last_error: String },
}

impl Error {
    /// Returns true if `err` is (or wraps) a not-found error.
    pub fn is_not_found(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<Error>(), Some(Error::NotFound { .. }))
    }
}
