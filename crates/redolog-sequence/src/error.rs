//! Error types for sequence generation.

use thiserror::Error;

/// Result type for sequence operations.
pub type Result<T> = std::result::Result<T, SequenceError>;

/// Errors that can occur while generating sequence numbers.
///
/// No variant ever carries a guessed value: when a call fails, no number was issued.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SequenceError {
    /// The counter store could not be reached or rejected the request.
    #[error("counter store unavailable: {reason}")]
    StoreUnavailable {
        /// The reason for failure.
        reason: String,
    },

    /// A store round trip did not finish in time.
    #[error("counter store call timed out after {timeout_ms}ms")]
    Timeout {
        /// The timeout duration in milliseconds.
        timeout_ms: u64,
    },

    /// The counter kept wrapping while this client tried to reset it.
    #[error("counter reset lost {attempts} times in a row")]
    Conflict {
        /// Number of resets attempted.
        attempts: u32,
    },

    /// Internal sequence error.
    #[error("internal sequence error: {0}")]
    Internal(String),
}

impl SequenceError {
    /// Returns true if the caller may retry the same call.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. } | Self::Timeout { .. })
    }
}
