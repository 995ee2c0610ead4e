// Copyright 2024 The Rucket Authors
// SPDX-License-Identifier: Apache-2.0

//! Error types shared by the redo log crates.
//!
//! Two kinds are kept apart on purpose: [`Error`] is returned to callers and
//! may be fatal, while [`DecodeError`] describes a single unreadable record and
//! never escapes a scan or recovery pass.

use thiserror::Error;

/// A specialized `Result` type for redo log core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the redo log core.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A transaction id string did not have the `<time>-<counter>` form.
    #[error("bad format for transaction id: {0:?}")]
    InvalidTransactionId(String),

    /// A commit id string did not have the four-part form.
    #[error("bad format for commit id: {0:?}")]
    InvalidCommitId(String),

    /// A segment header or record could not be encoded or was rejected as a whole.
    #[error("codec error: {0}")]
    Codec(String),
}

/// Why a single record in a segment could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Fewer bytes were available than the frame declared.
    #[error("record truncated: needed {needed} bytes, {available} available")]
    Truncated {
        /// Bytes the frame declared.
        needed: u64,
        /// Bytes actually present.
        available: u64,
    },

    /// The operation tag is not one this build knows.
    #[error("unknown operation tag {0}")]
    UnknownOperation(u16),

    /// The payload version of a known operation is not supported.
    #[error("unsupported payload version {version} for {name}")]
    UnsupportedVersion {
        /// Operation name.
        name: &'static str,
        /// Version found in the header.
        version: u16,
    },

    /// The header or payload bytes are inconsistent.
    #[error("malformed record: {0}")]
    Malformed(String),
}

impl DecodeError {
    /// Returns true if the record was cut short, which happens when the process
    /// died mid-append. Such records were never committed.
    #[must_use]
    pub const fn is_truncation(&self) -> bool {
        matches!(self, Self::Truncated { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidTransactionId("abc".to_string());
        assert_eq!(err.to_string(), "bad format for transaction id: \"abc\"");

        let err = DecodeError::Truncated { needed: 40, available: 12 };
        assert_eq!(err.to_string(), "record truncated: needed 40 bytes, 12 available");
        assert!(err.is_truncation());
        assert!(!DecodeError::UnknownOperation(9).is_truncation());
    }
}
