// Copyright 2024 The Rucket Authors
// SPDX-License-Identifier: Apache-2.0

//! Storage engine for the redo log.
//!
//! This crate provides:
//! - Append-only segment files with a reader that tolerates torn and corrupt records
//! - The archive of closed segments
//! - [`RedoLogManager`]: ordered logging, rollover and crash recovery
//! - [`RedoPlayer`] for feeding committed operations to a replica
//! - The log verifier used by the `redolog` tool

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod archive;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod recovery;
pub mod segment;
pub mod verifier;

#[cfg(test)]
mod durability_tests;

pub use archive::{Archive, ArchivedSegment};
pub use error::{RedoError, ReplayError, Result};
pub use manager::{LogStats, ManagerState, RedoLogManager};
pub use metrics::init_redolog_metrics;
pub use recovery::{PlayStats, RecoveryStats, RedoApplier, RedoPlayer};
pub use segment::{corrupt_sidecar_path, SegmentEntry, SegmentReader, SegmentWriter};
pub use verifier::{
    scan_log, write_report, write_scan_report, LogScan, RecordSummary, ServerFilter, VerifyReport,
};
