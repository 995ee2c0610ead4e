//! Durability testing for redo log crash recovery.
//!
//! This module provides tests for:
//! - Crash recovery at each point of the log/apply/commit sequence
//! - Torn and corrupt segments
//! - Rollovers interrupted by a crash
//!
//! # Test Infrastructure
//!
//! - [`RedoTestHarness`]: isolated log directory and manager factory
//! - [`CorruptionInjector`]: utilities for corrupting segment files

use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use redolog_core::codec::encode_record;
use redolog_core::record::{CreateFolder, SetItemFlags};
use redolog_core::{
    RedoLogConfig, RedoOp, RedoRecord, RolloverConfig, SegmentHeader, SyncMode, TransactionId,
};
use redolog_sequence::LocalSequence;
use tempfile::TempDir;

use crate::error::ReplayError;
use crate::manager::RedoLogManager;
use crate::recovery::RedoApplier;
use crate::segment::{SegmentReader, SegmentWriter};
use crate::verifier::{scan_log, ServerFilter};

const SERVER: &str = "mbox1";

/// Test harness for redo log durability testing.
pub struct RedoTestHarness {
    /// Temporary directory (kept alive for the test duration).
    _temp_dir: TempDir,
    /// Manager configuration.
    pub config: RedoLogConfig,
    /// Applier shared by every manager the harness creates.
    pub applier: Arc<RecordingApplier>,
}

impl RedoTestHarness {
    /// Create a new test harness with an isolated log directory.
    pub fn new() -> std::io::Result<Self> {
        let temp_dir = TempDir::new()?;
        let config = RedoLogConfig::in_dir(temp_dir.path().join("redolog"))
            .with_server_id(SERVER)
            .with_sync_mode(SyncMode::None) // Fast for tests
            .with_rollover(RolloverConfig::manual());
        Ok(Self { _temp_dir: temp_dir, config, applier: Arc::new(RecordingApplier::default()) })
    }

    /// Create a stopped manager. Each call simulates a new process.
    pub fn manager(&self) -> RedoLogManager {
        RedoLogManager::new(self.config.clone(), Arc::new(LocalSequence::default()))
            .with_applier(self.applier.clone())
    }

    /// Create and start a manager with crash recovery enabled.
    pub async fn started(&self) -> RedoLogManager {
        let manager = self.manager();
        manager.start(true).await.unwrap();
        manager
    }

    /// Path to the active segment.
    pub fn log_path(&self) -> PathBuf {
        self.config.log_path.clone()
    }

    /// Write an active segment directly, bypassing the manager.
    pub fn write_segment(&self, records: &[RedoRecord]) -> std::io::Result<()> {
        std::fs::create_dir_all(self.config.log_path.parent().unwrap())?;
        let mut writer = SegmentWriter::create(
            &self.config.log_path,
            SegmentHeader::new(0, 1),
            SyncMode::None,
            4096,
        )
        .map_err(std::io::Error::other)?;
        for record in records {
            writer.append(&encode_record(record).unwrap()).map_err(std::io::Error::other)?;
        }
        writer.close().map_err(std::io::Error::other)
    }

    /// Operation names in a segment, in file order.
    pub fn op_names(path: &Path) -> Vec<&'static str> {
        SegmentReader::open(path)
            .unwrap()
            .filter_map(|e| e.unwrap().record.ok())
            .map(|r| r.op().name())
            .collect()
    }
}

impl Default for RedoTestHarness {
    fn default() -> Self {
        Self::new().expect("Failed to create test harness")
    }
}

/// Applier that remembers what it applied and can be told to fail.
#[derive(Default)]
pub struct RecordingApplier {
    applied: Mutex<Vec<TransactionId>>,
    fail: Mutex<bool>,
}

impl RecordingApplier {
    fn applied(&self) -> Vec<TransactionId> {
        self.applied.lock().clone()
    }

    fn fail_next(&self, fail: bool) {
        *self.fail.lock() = fail;
    }
}

#[async_trait]
impl RedoApplier for RecordingApplier {
    async fn apply(&self, record: &RedoRecord) -> Result<(), ReplayError> {
        if *self.fail.lock() {
            return Err(ReplayError::new(record.op().name(), "mailbox unavailable"));
        }
        self.applied.lock().push(record.txn_id().unwrap());
        Ok(())
    }
}

/// Utility for injecting corruption into files.
pub struct CorruptionInjector;

impl CorruptionInjector {
    /// Flip a single bit at the specified byte offset.
    pub fn flip_bit(path: &Path, offset: u64, bit: u8) -> std::io::Result<()> {
        let mut file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = [0u8; 1];
        std::io::Read::read_exact(&mut file, &mut buf)?;
        buf[0] ^= 1 << (bit % 8);
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&buf)?;
        Ok(())
    }

    /// Overwrite bytes at the specified offset.
    pub fn corrupt_bytes(path: &Path, offset: u64, bytes: &[u8]) -> std::io::Result<()> {
        let mut file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes)?;
        Ok(())
    }

    /// Truncate a file to the specified size.
    pub fn truncate(path: &Path, size: u64) -> std::io::Result<()> {
        let file = std::fs::OpenOptions::new().write(true).open(path)?;
        file.set_len(size)?;
        Ok(())
    }

    /// Append garbage bytes to a file.
    pub fn append_garbage(path: &Path, garbage: &[u8]) -> std::io::Result<()> {
        let mut file = std::fs::OpenOptions::new().append(true).open(path)?;
        file.write_all(garbage)?;
        Ok(())
    }
}

fn flags(mailbox: i64, item: i32) -> RedoRecord {
    RedoRecord::new(mailbox, RedoOp::SetItemFlags(SetItemFlags { item_ids: vec![item], flags: 1 }))
}

fn started_record(counter: i32, server: &str) -> RedoRecord {
    let mut record = flags(1, counter).with_server_id(server);
    record.start(TransactionId::new(1_000, counter), 1_000);
    record
}

// =============================================================================
// Crash Recovery Tests
// =============================================================================

/// Test: Nothing to redo on a fresh log.
#[tokio::test]
async fn test_fresh_start_needs_no_recovery() {
    let harness = RedoTestHarness::new().unwrap();
    let stats = harness.manager().start(true).await.unwrap();

    assert_eq!(stats.records_scanned, 0);
    assert_eq!(stats.redone, 0);
    assert!(harness.log_path().exists());
}

/// Test: An operation logged but never committed is redone once.
///
/// Scenario: log(is_commit = false) -> crash before commit.
/// Expected: next start redoes it and marks it aborted; the start after that
/// finds nothing to do.
#[tokio::test]
async fn test_crash_after_log_before_commit() {
    let harness = RedoTestHarness::new().unwrap();
    let mut record = flags(1, 1);
    {
        let manager = harness.started().await;
        manager.log(&mut record, false).await.unwrap();
        // Dropped without stop: simulated crash.
    }

    let manager = harness.manager();
    let stats = manager.start(true).await.unwrap();
    assert_eq!(stats.redone, 1);
    assert_eq!(harness.applier.applied(), vec![record.txn_id().unwrap()]);

    // The redone op was carried into a new segment and closed there.
    assert_eq!(manager.archived_segments().unwrap().len(), 1);
    assert_eq!(
        RedoTestHarness::op_names(&harness.log_path()),
        vec!["SetItemFlags", "AbortTxn"]
    );
    drop(manager);

    let stats = harness.manager().start(true).await.unwrap();
    assert_eq!(stats.redone, 0);
    assert_eq!(harness.applier.applied().len(), 1);
}

/// Test: Committed and aborted operations are not redone.
#[tokio::test]
async fn test_resolved_operations_are_not_redone() {
    let harness = RedoTestHarness::new().unwrap();
    {
        let manager = harness.started().await;
        manager.log(&mut flags(1, 1), true).await.unwrap();

        let mut committed = flags(1, 2);
        manager.log(&mut committed, false).await.unwrap();
        manager.commit(&mut committed).await.unwrap();

        let mut aborted = flags(1, 3);
        manager.log(&mut aborted, false).await.unwrap();
        manager.abort(&mut aborted).await.unwrap();
    }

    let stats = harness.manager().start(true).await.unwrap();
    assert_eq!(stats.records_scanned, 5);
    assert_eq!(stats.redone, 0);
    assert!(harness.applier.applied().is_empty());
}

/// Test: Several pending operations are redone in transaction id order.
#[tokio::test]
async fn test_pending_operations_redone_in_txn_order() {
    let harness = RedoTestHarness::new().unwrap();
    harness
        .write_segment(&[
            started_record(3, SERVER),
            started_record(1, SERVER),
            started_record(2, SERVER),
        ])
        .unwrap();

    let stats = harness.manager().start(true).await.unwrap();
    assert_eq!(stats.redone, 3);
    let order: Vec<i32> = harness.applier.applied().iter().map(TransactionId::counter).collect();
    assert_eq!(order, vec![1, 2, 3]);
}

/// Test: Unfinished operations from another server are left alone.
#[tokio::test]
async fn test_foreign_operations_are_not_redone() {
    let harness = RedoTestHarness::new().unwrap();
    harness.write_segment(&[started_record(1, "mbox2"), started_record(2, SERVER)]).unwrap();

    let stats = harness.manager().start(true).await.unwrap();
    assert_eq!(stats.redone, 1);
    assert_eq!(stats.foreign, 1);
    assert_eq!(harness.applier.applied(), vec![TransactionId::new(1_000, 2)]);
}

/// Test: Crash recovery disabled leaves pending work untouched.
#[tokio::test]
async fn test_recovery_disabled() {
    let harness = RedoTestHarness::new().unwrap();
    harness.write_segment(&[started_record(1, SERVER)]).unwrap();

    let manager = harness.manager();
    let stats = manager.start(false).await.unwrap();
    assert_eq!(stats.redone, 0);
    assert!(harness.applier.applied().is_empty());
    assert!(manager.archived_segments().unwrap().is_empty());
}

/// Test: Work left alone with recovery disabled is redone once it is enabled.
///
/// Scenario: pending op -> start(false) -> log + stop (rollover) -> start(true).
/// Expected: the rollover carries the op forward and the next start redoes it.
#[tokio::test]
async fn test_recovery_reenabled_after_rollover() {
    let harness = RedoTestHarness::new().unwrap();
    harness.write_segment(&[started_record(1, SERVER)]).unwrap();
    {
        let manager = harness.manager();
        manager.start(false).await.unwrap();
        manager.log(&mut flags(1, 5), true).await.unwrap();
        manager.stop().await.unwrap();
        assert_eq!(manager.archived_segments().unwrap().len(), 1);
    }
    assert!(harness.applier.applied().is_empty());
    assert_eq!(RedoTestHarness::op_names(&harness.log_path()), vec!["SetItemFlags"]);

    let stats = harness.manager().start(true).await.unwrap();
    assert_eq!(stats.redone, 1);
    assert_eq!(harness.applier.applied(), vec![TransactionId::new(1_000, 1)]);
}

/// Test: Unfinished operations from another server stay in the active segment.
#[tokio::test]
async fn test_foreign_operations_carried_across_rollover() {
    let harness = RedoTestHarness::new().unwrap();
    harness.write_segment(&[started_record(1, "mbox2")]).unwrap();

    let manager = harness.manager();
    let stats = manager.start(true).await.unwrap();
    assert_eq!(stats.foreign, 1);
    manager.log(&mut flags(1, 5), true).await.unwrap();
    let archived = manager.force_rollover().await.unwrap().unwrap();
    assert_eq!(
        RedoTestHarness::op_names(&archived.path),
        vec!["SetItemFlags", "SetItemFlags", "Checkpoint"]
    );

    let head: Vec<RedoRecord> = SegmentReader::open(&harness.log_path())
        .unwrap()
        .map(|e| e.unwrap().record.unwrap())
        .collect();
    assert_eq!(head.len(), 1);
    assert_eq!(head[0].server_id(), Some("mbox2"));
    assert_eq!(head[0].txn_id(), Some(TransactionId::new(1_000, 1)));
    drop(manager);

    let stats = harness.manager().start(true).await.unwrap();
    assert_eq!(stats.foreign, 1);
    assert!(harness.applier.applied().is_empty());
}

/// Test: A failed redo is still closed with an abort marker.
#[tokio::test]
async fn test_failed_redo_is_marked_aborted() {
    let harness = RedoTestHarness::new().unwrap();
    harness.write_segment(&[started_record(1, SERVER)]).unwrap();

    harness.applier.fail_next(true);
    let stats = harness.manager().start(true).await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.redone, 0);

    harness.applier.fail_next(false);
    let stats = harness.manager().start(true).await.unwrap();
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.redone, 0);
}

/// Test: Sequence numbers and transaction ids keep increasing across restarts.
#[tokio::test]
async fn test_identity_survives_restart() {
    let harness = RedoTestHarness::new().unwrap();
    let (first_txn, first_seq) = {
        let manager = harness.started().await;
        let mut record = flags(1, 1);
        manager.log(&mut record, true).await.unwrap();
        manager.stop().await.unwrap();
        (record.txn_id().unwrap(), manager.current_sequence())
    };

    let manager = harness.started().await;
    assert_eq!(manager.current_sequence(), first_seq);
    let mut record = flags(1, 2);
    manager.log(&mut record, true).await.unwrap();
    assert!(record.txn_id().unwrap() > first_txn);

    let archived = manager.force_rollover().await.unwrap().unwrap();
    assert_eq!(archived.sequence, first_seq);
    assert_eq!(manager.current_sequence(), first_seq + 1);
}

// =============================================================================
// Corruption Tests
// =============================================================================

/// Test: A torn tail is cut off and appends continue on a frame boundary.
#[tokio::test]
async fn test_torn_tail_is_truncated() {
    let harness = RedoTestHarness::new().unwrap();
    {
        let manager = harness.started().await;
        manager.log(&mut flags(1, 1), true).await.unwrap();
        manager.log(&mut flags(1, 2), true).await.unwrap();
    }
    let len = std::fs::metadata(harness.log_path()).unwrap().len();
    CorruptionInjector::truncate(&harness.log_path(), len - 5).unwrap();

    let manager = harness.manager();
    let stats = manager.start(true).await.unwrap();
    assert!(stats.truncated);
    manager.log(&mut flags(1, 3), true).await.unwrap();

    let records: Vec<_> = SegmentReader::open(&harness.log_path())
        .unwrap()
        .map(|e| e.unwrap().record.unwrap())
        .collect();
    assert_eq!(records.len(), 2);
}

/// Test: Garbage after the last frame is discarded on start.
#[tokio::test]
async fn test_garbage_after_last_frame() {
    let harness = RedoTestHarness::new().unwrap();
    {
        let manager = harness.started().await;
        manager.log(&mut flags(1, 1), true).await.unwrap();
    }
    CorruptionInjector::append_garbage(&harness.log_path(), &[0xff, 0x01, 0x02]).unwrap();

    let manager = harness.started().await;
    manager.log(&mut flags(1, 2), true).await.unwrap();
    assert_eq!(RedoTestHarness::op_names(&harness.log_path()).len(), 2);
}

/// Test: A corrupt record is skipped; the records after it survive.
#[tokio::test]
async fn test_corrupt_record_does_not_hide_later_records() {
    let harness = RedoTestHarness::new().unwrap();
    let first = started_record(1, SERVER);
    let first_len = encode_record(&first).unwrap().len() as u64;
    harness.write_segment(&[first, started_record(2, SERVER), started_record(3, SERVER)]).unwrap();

    // Unknown tag on the second frame.
    let tag_offset = 28 + first_len + 4;
    CorruptionInjector::corrupt_bytes(&harness.log_path(), tag_offset, &777u16.to_le_bytes())
        .unwrap();

    let summaries: Vec<_> =
        scan_log(&harness.log_path(), ServerFilter::all()).unwrap().map(Result::unwrap).collect();
    assert_eq!(summaries.len(), 3);
    assert!(!summaries[1].is_readable());
    assert!(summaries[2].is_readable());

    let stats = harness.manager().start(true).await.unwrap();
    assert_eq!(stats.unreadable, 1);
    assert_eq!(stats.redone, 2);
}

/// Test: An active segment without a complete header is replaced.
#[tokio::test]
async fn test_incomplete_segment_header() {
    let harness = RedoTestHarness::new().unwrap();
    std::fs::create_dir_all(harness.log_path().parent().unwrap()).unwrap();
    std::fs::write(harness.log_path(), b"ZRDO\x01").unwrap();

    let manager = harness.started().await;
    manager.log(&mut flags(1, 1), true).await.unwrap();
    assert_eq!(RedoTestHarness::op_names(&harness.log_path()), vec!["SetItemFlags"]);
}

// =============================================================================
// Interrupted Rollover Tests
// =============================================================================

/// Test: A staged segment is completed when the active file was already archived.
#[tokio::test]
async fn test_staged_segment_completed_after_crash() {
    let harness = RedoTestHarness::new().unwrap();
    {
        let manager = harness.started().await;
        manager.log(&mut flags(1, 1), true).await.unwrap();
        manager.stop().await.unwrap();
    }
    // Crash between archiving the old segment and renaming the staged one.
    let staging = harness.config.staging_path();
    std::fs::rename(harness.log_path(), &staging).unwrap();

    let manager = harness.started().await;
    assert!(!staging.exists());
    assert!(harness.log_path().exists());
    assert_eq!(manager.current_sequence(), 1);
}

/// Test: A staged segment is discarded while the active file still exists.
#[tokio::test]
async fn test_staged_segment_discarded_when_active_exists() {
    let harness = RedoTestHarness::new().unwrap();
    {
        let manager = harness.started().await;
        manager.log(&mut flags(1, 1), true).await.unwrap();
    }
    let staging = harness.config.staging_path();
    std::fs::write(&staging, b"partial").unwrap();

    let manager = harness.started().await;
    assert!(!staging.exists());
    assert_eq!(RedoTestHarness::op_names(manager.active_segment_path()), vec!["SetItemFlags"]);
}

/// Test: Replaying with crash recovery twice gives the same applied set.
#[tokio::test]
async fn test_recovery_idempotent() {
    let harness = RedoTestHarness::new().unwrap();
    let mut create = RedoRecord::new(
        1,
        RedoOp::CreateFolder(CreateFolder {
            folder_id: 300,
            parent_id: 1,
            name: "Receipts".to_string(),
            default_view: 1,
        }),
    );
    {
        let manager = harness.started().await;
        manager.log(&mut create, false).await.unwrap();
    }

    for _ in 0..3 {
        let manager = harness.manager();
        manager.start(true).await.unwrap();
        manager.stop().await.unwrap();
    }
    assert_eq!(harness.applier.applied(), vec![create.txn_id().unwrap()]);
}

// =============================================================================
// Property-based Corruption Tests (using proptest)
// =============================================================================

#[cfg(test)]
mod proptest_durability {
    use proptest::prelude::*;

    use super::*;

    fn write_committed(harness: &RedoTestHarness, count: i32) {
        let records: Vec<RedoRecord> = (1..=count)
            .map(|i| {
                let mut record = started_record(i, SERVER);
                record.set_commit(true);
                record
            })
            .collect();
        harness.write_segment(&records).unwrap();
    }

    proptest! {
        /// A bit flip anywhere past the segment header never stops the log from starting.
        #[test]
        fn fuzz_bit_flip_recovery(offset in 28u64..400, bit in 0u8..8) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let (start_ok, log_ok) = rt.block_on(async {
                let harness = RedoTestHarness::new().unwrap();
                write_committed(&harness, 5);

                let size = std::fs::metadata(harness.log_path()).unwrap().len();
                if offset < size {
                    CorruptionInjector::flip_bit(&harness.log_path(), offset, bit).unwrap();
                }

                let manager = harness.manager();
                let start_ok = manager.start(true).await.is_ok();
                let log_ok = manager.log(&mut flags(1, 99), true).await.is_ok();
                (start_ok, log_ok)
            });

            prop_assert!(start_ok);
            prop_assert!(log_ok);
        }

        /// Every truncation point leaves a readable prefix.
        #[test]
        fn fuzz_truncation_recovery(cut in 28u64..600) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let (intact, after) = rt.block_on(async {
                let harness = RedoTestHarness::new().unwrap();
                write_committed(&harness, 8);

                let size = std::fs::metadata(harness.log_path()).unwrap().len();
                if cut < size {
                    CorruptionInjector::truncate(&harness.log_path(), cut).unwrap();
                }
                let intact = SegmentReader::open(&harness.log_path())
                    .unwrap()
                    .filter(|e| e.as_ref().unwrap().record.is_ok())
                    .count();

                let manager = harness.started().await;
                manager.log(&mut flags(1, 99), true).await.unwrap();
                let after = RedoTestHarness::op_names(&harness.log_path()).len();
                (intact, after)
            });

            prop_assert_eq!(after, intact + 1);
        }
    }
}
