//! Error types for the Floodgate service.

use std::time::Duration;

use thiserror::Error;

/// Errors produced while making a rate limiting decision.
///
/// None of these are ever converted into an allow or deny on their own; the
/// caller of [`crate::ratelimit::Limiter::allow`] owns that policy.
#[derive(Error, Debug)]
pub enum LimitError {
    /// The state handed to an algorithm was produced by a different algorithm
    /// or has the wrong shape.
    #[error("invalid state: expected {expected}, found {found}")]
    InvalidState {
        /// Algorithm the state was expected to belong to
        expected: &'static str,
        /// What was actually found
        found: String,
    },

    /// The storage backend could not be reached or failed a command.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The storage round-trip did not finish before the deadline.
    #[error("storage deadline of {0:?} exceeded")]
    Timeout(Duration),

    /// Stored bytes could not be decoded into any known state.
    #[error("cannot decode stored state: {0}")]
    Decode(#[source] serde_json::Error),

    /// A state value could not be encoded for storage.
    #[error("cannot encode state: {0}")]
    Encode(#[source] serde_json::Error),

    /// Optimistic retries on a single key were exhausted.
    #[error("gave up after {attempts} conflicting updates")]
    Contention {
        /// Number of attempts made
        attempts: u32,
    },

    /// Algorithm parameters were rejected at construction.
    #[error("invalid limiter configuration: {0}")]
    InvalidConfig(String),

    /// An instant could not be aligned to a window grid.
    #[error("cannot align instant to window: {0}")]
    Time(#[from] chrono::RoundingError),
}

impl LimitError {
    /// Whether the failure came from the storage backend rather than from
    /// the state or the algorithm.
    pub fn is_storage_unavailable(&self) -> bool {
        matches!(
            self,
            LimitError::StorageUnavailable(_) | LimitError::Timeout(_) | LimitError::Contention { .. }
        )
    }
}

/// Main error type for Floodgate operations.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rate limiting errors
    #[error("Rate limit error: {0}")]
    RateLimit(#[from] LimitError),

    /// HTTP server or client errors
    #[error("HTTP error: {0}")]
    Http(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;
