// Copyright 2026 Rucket Dev
// SPDX-License-Identifier: Apache-2.0

//! Redo log metrics.
//!
//! This module provides metrics for monitoring the redo log:
//! - Records logged and append latency
//! - Rollovers and the size of the active segment
//! - Records replayed during crash recovery
//! - Fatal errors that halted the manager

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// Records appended to the log.
pub const RECORDS_LOGGED: &str = "redolog_records_logged_total";
/// Append latency in seconds.
pub const APPEND_SECONDS: &str = "redolog_append_seconds";
/// Completed rollovers.
pub const ROLLOVERS: &str = "redolog_rollovers_total";
/// Size of the active segment in bytes.
pub const ACTIVE_SEGMENT_BYTES: &str = "redolog_active_segment_bytes";
/// Operations replayed during crash recovery.
pub const RECOVERED_RECORDS: &str = "redolog_recovered_records_total";
/// Fatal errors.
pub const FATAL_ERRORS: &str = "redolog_fatal_errors_total";

/// Initialize redo log metric descriptions (call once at startup).
pub fn init_redolog_metrics() {
    describe_counter!(RECORDS_LOGGED, "Total number of records appended to the redo log");
    describe_histogram!(APPEND_SECONDS, "Time spent appending a record, including sync");
    describe_counter!(ROLLOVERS, "Total number of redo log rollovers");
    describe_gauge!(ACTIVE_SEGMENT_BYTES, "Size of the active redo log segment in bytes");
    describe_counter!(
        RECOVERED_RECORDS,
        "Total number of operations replayed during crash recovery"
    );
    describe_counter!(FATAL_ERRORS, "Total number of fatal redo log errors");
}

pub(crate) fn record_append(seconds: f64, segment_bytes: u64) {
    counter!(RECORDS_LOGGED).increment(1);
    histogram!(APPEND_SECONDS).record(seconds);
    gauge!(ACTIVE_SEGMENT_BYTES).set(segment_bytes as f64);
}

pub(crate) fn record_rollover(segment_bytes: u64) {
    counter!(ROLLOVERS).increment(1);
    gauge!(ACTIVE_SEGMENT_BYTES).set(segment_bytes as f64);
}

pub(crate) fn record_recovered(count: u64) {
    counter!(RECOVERED_RECORDS).increment(count);
}

pub(crate) fn record_fatal() {
    counter!(FATAL_ERRORS).increment(1);
}
