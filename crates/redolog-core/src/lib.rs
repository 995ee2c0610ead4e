// Copyright 2024 The Rucket Authors
// SPDX-License-Identifier: Apache-2.0

//! Core types for the redo log.
//!
//! This crate provides the building blocks shared by every redo log component:
//! - Transaction and commit identifiers with their external string forms
//! - The closed set of redo operations and the [`RedoRecord`] envelope
//! - The bit-exact segment and record codec
//! - Configuration and error types

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod codec;
pub mod commit_id;
pub mod config;
pub mod error;
pub mod record;
pub mod txn;

pub use codec::{RecordHeader, SegmentHeader, SEGMENT_HEADER_LEN};
pub use commit_id::CommitId;
pub use config::{
    Config, LogFormat, LoggingConfig, RedoLogConfig, RolloverConfig, SequenceConfig,
    SequenceKind, SyncMode,
};
pub use error::{DecodeError, Error, Result};
pub use record::{OpKind, RecordState, RedoOp, RedoRecord};
pub use txn::{TransactionId, TxnIdGenerator};

/// Returns the current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
