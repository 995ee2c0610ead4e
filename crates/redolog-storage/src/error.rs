//! Error types for the redo log manager.

use redolog_core::CommitId;
use redolog_sequence::SequenceError;
use thiserror::Error;

/// Result type for redo log storage operations.
pub type Result<T> = std::result::Result<T, RedoError>;

/// Errors surfaced by the storage layer and the manager.
#[derive(Error, Debug)]
pub enum RedoError {
    /// Appending, flushing or rolling the log failed. The durability guarantee
    /// is gone, so the manager refuses every later call with [`RedoError::Halted`].
    #[error("redo log I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An earlier fatal error stopped the manager.
    #[error("redo log halted after fatal error: {0}")]
    Halted(String),

    /// The manager is not accepting records in its current state.
    #[error("redo log is not running (state: {0})")]
    NotRunning(&'static str),

    /// A lifecycle call was made in the wrong state.
    #[error("invalid redo log state: {0}")]
    InvalidState(String),

    /// The sequence generator failed.
    #[error("sequence generator error: {0}")]
    Sequence(#[from] SequenceError),

    /// A commit id did not match any commit in the log.
    #[error("commit id {0} not found in the redo log")]
    InvalidCommitId(CommitId),

    /// The host failed to apply a record during replay.
    #[error(transparent)]
    Replay(#[from] ReplayError),

    /// Identifier, codec or configuration error.
    #[error(transparent)]
    Core(#[from] redolog_core::Error),
}

impl RedoError {
    /// Returns true if the error means logged operations may no longer be durable.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Halted(_))
    }
}

/// Failure reported by a [`crate::RedoApplier`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("replay of {op} failed: {reason}")]
pub struct ReplayError {
    /// Operation name.
    pub op: &'static str,
    /// Why the operation could not be applied.
    pub reason: String,
}

impl ReplayError {
    /// Creates a replay error for an operation.
    pub fn new(op: &'static str, reason: impl Into<String>) -> Self {
        Self { op, reason: reason.into() }
    }
}
