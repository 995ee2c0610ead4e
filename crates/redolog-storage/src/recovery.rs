//! Crash recovery and replay.
//!
//! The host logs an operation before applying it and commits it afterwards
//! (write-ahead). After a crash, the active segment is scanned for operations
//! that were logged but neither committed nor aborted; those are the ones whose
//! effect may be missing, and the manager redoes them through the host's
//! [`RedoApplier`] before it starts accepting new work.
//!
//! [`RedoPlayer`] is the other consumer: it feeds the committed operations of
//! archived segments to a replica, skipping transactions it already applied.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redolog_core::{RedoOp, RedoRecord, TransactionId};
use tracing::{debug, warn};

use crate::error::{ReplayError, Result};
use crate::segment::SegmentReader;

/// Applies a logged operation to mailbox state.
///
/// Implementations apply the effect directly; they must not log through the
/// manager, which does not accept records until recovery is complete.
#[async_trait]
pub trait RedoApplier: Send + Sync {
    /// Applies one operation.
    async fn apply(&self, record: &RedoRecord) -> std::result::Result<(), ReplayError>;
}

/// Unfinished work found in a segment.
#[derive(Debug, Default)]
pub struct RecoveryScan {
    /// Frames read.
    pub records: usize,
    /// Frames that could not be decoded.
    pub unreadable: usize,
    /// Whether the segment ended in a torn frame.
    pub truncated: bool,
    /// Largest transaction id seen.
    pub max_txn_id: Option<TransactionId>,
    /// Local operations that were neither committed nor aborted, in txn order.
    pub pending: Vec<RedoRecord>,
    /// Unfinished operations written by other servers, in txn order.
    pub foreign: Vec<RedoRecord>,
}

/// Scans a segment for operations that still need to be redone.
///
/// Unfinished operations whose origin server is `server_id` are returned in
/// `pending`; those from other servers are returned separately in `foreign`.
pub fn scan_for_recovery(path: &Path, server_id: &str) -> Result<RecoveryScan> {
    let mut scan = RecoveryScan::default();
    let mut open: BTreeMap<TransactionId, RedoRecord> = BTreeMap::new();

    for entry in SegmentReader::open(path)? {
        let entry = entry?;
        scan.records += 1;
        let record = match entry.record {
            Ok(record) => record,
            Err(e) => {
                if e.is_truncation() {
                    debug!(offset = entry.offset, "Discarding torn record at end of segment");
                    scan.truncated = true;
                } else {
                    warn!(offset = entry.offset, error = %e, "Skipping unreadable redo record");
                    scan.unreadable += 1;
                }
                continue;
            }
        };

        let Some(txn) = record.txn_id() else { continue };
        scan.max_txn_id = scan.max_txn_id.max(Some(txn));

        match record.op() {
            RedoOp::CommitTxn(_) | RedoOp::AbortTxn(_) => {
                open.remove(&txn);
            }
            RedoOp::Checkpoint(_) => {}
            _ if record.is_commit() => {
                open.remove(&txn);
            }
            _ => {
                open.insert(txn, record);
            }
        }
    }

    for (txn, record) in open {
        if record.server_id() == Some(server_id) {
            scan.pending.push(record);
        } else {
            warn!(
                %txn,
                origin = record.server_id().unwrap_or_default(),
                "Leaving unfinished operation from another server"
            );
            scan.foreign.push(record);
        }
    }
    Ok(scan)
}

/// Returns the largest transaction id in a segment.
///
/// Records that cannot be decoded are ignored.
pub fn max_txn_id(path: &Path) -> Result<Option<TransactionId>> {
    let mut largest = None;
    for entry in SegmentReader::open(path)? {
        if let Ok(record) = entry?.record {
            largest = largest.max(record.txn_id());
        }
    }
    Ok(largest)
}

/// Statistics from crash recovery.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Frames read from the active segment.
    pub records_scanned: usize,
    /// Frames that could not be decoded.
    pub unreadable: usize,
    /// Whether a torn tail was discarded.
    pub truncated: bool,
    /// Operations redone successfully.
    pub redone: usize,
    /// Operations whose redo failed (marked aborted).
    pub failed: usize,
    /// Unfinished operations from other servers, kept in the log but not redone.
    pub foreign: usize,
}

/// Statistics from a [`RedoPlayer`] run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PlayStats {
    /// Operations applied.
    pub applied: usize,
    /// Committed operations skipped (already applied or filtered out).
    pub skipped: usize,
    /// Operations still waiting for a commit at the end of the run.
    pub uncommitted: usize,
    /// Frames that could not be decoded.
    pub unreadable: usize,
}

/// Replays committed operations, each transaction at most once.
///
/// Operations are applied at their commit point, so the apply order is the
/// commit order recorded in the log. Segments must be played in log order.
///
/// Applied transactions are remembered up to a high-water mark: once every
/// transaction at or below the mark is resolved, the mark moves up and the
/// individual ids below it are forgotten.
pub struct RedoPlayer {
    applier: Arc<dyn RedoApplier>,
    applied: BTreeSet<TransactionId>,
    watermark: Option<TransactionId>,
    applied_total: usize,
    server_ids: Option<HashSet<String>>,
}

impl RedoPlayer {
    /// Creates a player that applies through `applier`.
    pub fn new(applier: Arc<dyn RedoApplier>) -> Self {
        Self {
            applier,
            applied: BTreeSet::new(),
            watermark: None,
            applied_total: 0,
            server_ids: None,
        }
    }

    /// Only applies operations that originated on one of `server_ids`.
    #[must_use]
    pub fn with_server_filter<I, S>(mut self, server_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.server_ids = Some(server_ids.into_iter().map(Into::into).collect());
        self
    }

    /// Returns the number of distinct transactions applied so far.
    pub fn applied_count(&self) -> usize {
        self.applied_total
    }

    /// Returns true if the transaction was applied or lies at or below the
    /// high-water mark.
    pub fn has_applied(&self, txn: &TransactionId) -> bool {
        self.watermark.is_some_and(|mark| *txn <= mark) || self.applied.contains(txn)
    }

    /// Returns the highest transaction id below which nothing is pending.
    pub fn watermark(&self) -> Option<TransactionId> {
        self.watermark
    }

    /// Returns the number of applied ids still tracked above the watermark.
    pub fn tracked_count(&self) -> usize {
        self.applied.len()
    }

    /// Replays one segment.
    pub async fn play_segment(&mut self, path: &Path) -> Result<PlayStats> {
        self.play_segments([path]).await
    }

    /// Replays segments in the given order.
    ///
    /// # Errors
    ///
    /// Stops at the first segment that cannot be opened or the first operation
    /// the applier rejects.
    pub async fn play_segments<I, P>(&mut self, paths: I) -> Result<PlayStats>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut stats = PlayStats::default();
        let mut waiting: HashMap<TransactionId, RedoRecord> = HashMap::new();

        for path in paths {
            let path = path.as_ref();
            debug!(path = %path.display(), "Replaying redo log segment");
            for entry in SegmentReader::open(path)? {
                let record = match entry?.record {
                    Ok(record) => record,
                    Err(_) => {
                        stats.unreadable += 1;
                        continue;
                    }
                };
                let Some(txn) = record.txn_id() else { continue };

                match record.op() {
                    RedoOp::CommitTxn(_) => {
                        if let Some(op) = waiting.remove(&txn) {
                            self.apply_once(txn, &op, &mut stats).await?;
                        }
                    }
                    RedoOp::AbortTxn(_) => {
                        waiting.remove(&txn);
                    }
                    RedoOp::Checkpoint(_) => {}
                    _ if record.is_commit() => self.apply_once(txn, &record, &mut stats).await?,
                    _ => {
                        waiting.insert(txn, record);
                    }
                }
            }
            self.advance_watermark(waiting.keys().min().copied());
        }

        stats.uncommitted = waiting.len();
        Ok(stats)
    }

    /// Raises the watermark to the newest applied id below `oldest_waiting`.
    fn advance_watermark(&mut self, oldest_waiting: Option<TransactionId>) {
        let mark = match oldest_waiting {
            Some(oldest) => self.applied.range(..oldest).next_back().copied(),
            None => self.applied.last().copied(),
        };
        let Some(mark) = mark else { return };
        self.applied = self.applied.split_off(&mark);
        self.applied.remove(&mark);
        self.watermark = self.watermark.max(Some(mark));
    }

    async fn apply_once(
        &mut self,
        txn: TransactionId,
        record: &RedoRecord,
        stats: &mut PlayStats,
    ) -> Result<()> {
        let wanted = self
            .server_ids
            .as_ref()
            .map_or(true, |ids| record.server_id().is_some_and(|id| ids.contains(id)));
        if !wanted || self.has_applied(&txn) {
            stats.skipped += 1;
            return Ok(());
        }

        self.applier.apply(record).await?;
        self.applied.insert(txn);
        self.applied_total += 1;
        stats.applied += 1;
        Ok(())
    }
}
