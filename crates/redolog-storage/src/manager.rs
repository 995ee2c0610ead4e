//! The redo log manager.
//!
//! [`RedoLogManager`] owns the active segment, the archive and the sequence
//! generator. Appends, commit and abort markers and rollovers all run inside
//! one critical section, and transaction ids are assigned inside it too, so the
//! byte order of a segment is the order of its transaction ids.
//!
//! # Lifecycle
//!
//! `Stopped -> Starting -> Running -> Stopping -> Stopped`. Records are only
//! accepted while running. An I/O failure on the write path halts the manager:
//! every later call fails with [`RedoError::Halted`] and the host must stop
//! accepting mutations.
//!
//! # Rollover
//!
//! The next segment is prepared at `<log_path>.next`, the closing segment is
//! moved into the archive, then the staged file is renamed into place. A crash
//! at any point leaves either the old active segment or the complete staged one,
//! and [`RedoLogManager::start`] finishes or discards the handoff.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use redolog_core::codec::encode_record;
use redolog_core::record::{Checkpoint, UNSET_MAILBOX};
use redolog_core::{
    now_millis, CommitId, RecordState, RedoLogConfig, RedoOp, RedoRecord, SegmentHeader,
    TransactionId, TxnIdGenerator, SEGMENT_HEADER_LEN,
};
use redolog_sequence::{CounterStore, SequenceGenerator};
use tracing::{debug, error, info, warn};

use crate::archive::{sync_dir, Archive, ArchivedSegment};
use crate::error::{RedoError, ReplayError, Result};
use crate::metrics;
use crate::recovery::{max_txn_id, scan_for_recovery, RecoveryStats, RedoApplier};
use crate::segment::{SegmentReader, SegmentWriter};

/// Lifecycle state of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    /// Not started, or stopped.
    Stopped,
    /// Running crash recovery.
    Starting,
    /// Accepting records.
    Running,
    /// Closing the active segment.
    Stopping,
}

impl ManagerState {
    /// Returns the state name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append statistics since the manager was created.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LogStats {
    /// Records appended, markers included.
    pub records_logged: u64,
    /// Mean append latency including sync, in milliseconds.
    pub mean_append_ms: f64,
}

struct Inner {
    writer: Option<SegmentWriter>,
    /// Logged transactions that are neither committed nor aborted.
    active: BTreeMap<TransactionId, RedoRecord>,
}

/// Orchestrates logging, rollover and crash recovery.
pub struct RedoLogManager {
    config: RedoLogConfig,
    archive: Archive,
    sequence: Arc<dyn SequenceGenerator>,
    applier: Option<Arc<dyn RedoApplier>>,
    txn_ids: TxnIdGenerator,
    state: Mutex<ManagerState>,
    halted: Mutex<Option<String>>,
    inner: tokio::sync::Mutex<Inner>,
    active_sequence: AtomicI64,
    records_logged: AtomicU64,
    append_nanos: AtomicU64,
}

impl RedoLogManager {
    /// Creates a stopped manager.
    pub fn new(config: RedoLogConfig, sequence: Arc<dyn SequenceGenerator>) -> Self {
        let archive = Archive::new(config.archive_dir.clone());
        Self {
            config,
            archive,
            sequence,
            applier: None,
            txn_ids: TxnIdGenerator::new(),
            state: Mutex::new(ManagerState::Stopped),
            halted: Mutex::new(None),
            inner: tokio::sync::Mutex::new(Inner { writer: None, active: BTreeMap::new() }),
            active_sequence: AtomicI64::new(-1),
            records_logged: AtomicU64::new(0),
            append_nanos: AtomicU64::new(0),
        }
    }

    /// Creates a stopped manager with the sequence generator named in `config`.
    ///
    /// # Errors
    ///
    /// Fails if a distributed sequence is configured without a counter store.
    pub fn from_config(
        config: RedoLogConfig,
        store: Option<Arc<dyn CounterStore>>,
    ) -> Result<Self> {
        let sequence = redolog_sequence::from_config(&config.sequence, store)?;
        Ok(Self::new(config, sequence))
    }

    /// Sets the applier used to redo unfinished operations on start.
    #[must_use]
    pub fn with_applier(mut self, applier: Arc<dyn RedoApplier>) -> Self {
        self.applier = Some(applier);
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &RedoLogConfig {
        &self.config
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> ManagerState {
        *self.state.lock()
    }

    /// Returns true if a fatal error halted the manager.
    pub fn is_halted(&self) -> bool {
        self.halted.lock().is_some()
    }

    /// Issues a new transaction id.
    pub fn new_txn_id(&self) -> TransactionId {
        self.txn_ids.next_id()
    }

    /// Opens the log and, if `crash_recovery` is set, redoes unfinished work.
    ///
    /// Unfinished operations of this server found in the active segment are
    /// carried into a fresh segment, handed to the applier in transaction id
    /// order, and closed with an abort marker whether or not the redo
    /// succeeded. Only then does the manager accept records.
    ///
    /// # Errors
    ///
    /// Fails if the manager is not stopped, or if the log cannot be opened.
    pub async fn start(&self, crash_recovery: bool) -> Result<RecoveryStats> {
        self.check_halted()?;
        {
            let mut state = self.state.lock();
            if *state != ManagerState::Stopped {
                return Err(RedoError::InvalidState(format!("cannot start while {}", *state)));
            }
            *state = ManagerState::Starting;
        }
        info!(
            path = %self.config.log_path.display(),
            crash_recovery,
            "Starting redo log"
        );

        let result = self.recover(crash_recovery).await;
        let result = self.halt_on_fatal(result);
        let mut state = self.state.lock();
        match result {
            Ok(stats) => {
                *state = ManagerState::Running;
                info!(
                    sequence = self.current_sequence(),
                    redone = stats.redone,
                    failed = stats.failed,
                    "Redo log running"
                );
                Ok(stats)
            }
            Err(e) => {
                *state = ManagerState::Stopped;
                error!(error = %e, "Redo log failed to start");
                Err(e)
            }
        }
    }

    async fn recover(&self, crash_recovery: bool) -> Result<RecoveryStats> {
        let mut stats = RecoveryStats::default();

        let pending = {
            let mut inner = self.inner.lock().await;
            self.prepare_files()?;

            // After a clean stop the active segment is empty, so the newest
            // archived segment holds the largest transaction id.
            if let Some(last) = self.archive.list()?.last() {
                if let Some(max) = max_txn_id(&last.path)? {
                    self.txn_ids.observe(max);
                }
            }

            // Unfinished work that is not redone now stays active, so rollover
            // carries it forward and a later start still finds it.
            let mut pending = Vec::new();
            let mut unresolved = Vec::new();
            if self.config.log_path.exists() {
                let scan = scan_for_recovery(&self.config.log_path, &self.config.server_id)?;
                if let Some(max) = scan.max_txn_id {
                    self.txn_ids.observe(max);
                }
                stats.records_scanned = scan.records;
                stats.unreadable = scan.unreadable;
                stats.truncated = scan.truncated;
                stats.foreign = scan.foreign.len();
                unresolved = scan.foreign;
                if crash_recovery {
                    pending = scan.pending;
                } else if !scan.pending.is_empty() {
                    warn!(
                        count = scan.pending.len(),
                        "Crash recovery disabled, keeping unfinished operations for a later start"
                    );
                    unresolved.extend(scan.pending);
                }
            }

            let writer = self.open_active().await?;
            self.active_sequence.store(writer.sequence(), Ordering::SeqCst);
            inner.writer = Some(writer);
            inner.active.clear();
            for record in unresolved.iter().chain(&pending) {
                if let Some(txn) = record.txn_id() {
                    inner.active.insert(txn, record.clone());
                }
            }

            if !pending.is_empty() {
                info!(count = pending.len(), "Redoing unfinished operations");
                self.rollover_locked(&mut inner, false).await?;
            }
            pending
        };

        // The applier runs outside the critical section.
        for record in pending {
            let Some(txn) = record.txn_id() else { continue };
            let outcome = match &self.applier {
                Some(applier) => applier.apply(&record).await,
                None => Err(ReplayError::new(record.op().name(), "no applier configured")),
            };
            match outcome {
                Ok(()) => {
                    debug!(%txn, op = record.op().name(), "Redid operation");
                    stats.redone += 1;
                }
                Err(e) => {
                    error!(%txn, error = %e, "Redo failed, marking operation aborted");
                    stats.failed += 1;
                }
            }

            let mut inner = self.inner.lock().await;
            let mut abort = RedoRecord::abort_marker(&record, now_millis());
            self.append_locked(&mut inner, &mut abort)?;
            inner.active.remove(&txn);
        }

        if stats.redone > 0 {
            metrics::record_recovered(stats.redone as u64);
        }
        Ok(stats)
    }

    /// Creates directories and settles a rollover interrupted by a crash.
    fn prepare_files(&self) -> Result<()> {
        let log_path = &self.config.log_path;
        if let Some(parent) = log_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        self.archive.ensure()?;

        let staging = self.config.staging_path();
        if staging.exists() {
            if log_path.exists() {
                warn!(
                    path = %staging.display(),
                    "Discarding segment staged by interrupted rollover"
                );
                fs::remove_file(&staging)?;
            } else {
                info!(path = %staging.display(), "Completing interrupted rollover");
                fs::rename(&staging, log_path)?;
                self.sync_log_dir()?;
            }
        }

        if let Ok(meta) = fs::metadata(log_path) {
            if meta.len() < SEGMENT_HEADER_LEN as u64 {
                warn!(path = %log_path.display(), "Removing segment with incomplete header");
                fs::remove_file(log_path)?;
            }
        }
        Ok(())
    }

    /// Opens the active segment, creating it if needed.
    ///
    /// The sequence generator is raised to at least the sequence of the
    /// segment on disk (or one past the newest archived segment), so sequence
    /// numbers keep increasing across restarts.
    async fn open_active(&self) -> Result<SegmentWriter> {
        let log_path = &self.config.log_path;
        if log_path.exists() {
            let writer =
                SegmentWriter::open(log_path, self.config.sync_mode, self.config.buffer_size)?;
            self.raise_sequence(writer.sequence()).await?;
            return Ok(writer);
        }

        let floor = self.archive.list()?.last().map_or(0, |s| s.sequence.saturating_add(1));
        self.raise_sequence(floor).await?;
        let sequence = self.sequence.current().await?;

        let mut writer = SegmentWriter::create(
            &self.config.staging_path(),
            SegmentHeader::new(sequence, now_millis()),
            self.config.sync_mode,
            self.config.buffer_size,
        )?;
        writer.rename_to(log_path)?;
        self.sync_log_dir()?;
        info!(path = %log_path.display(), sequence, "Created redo log segment");
        Ok(writer)
    }

    async fn raise_sequence(&self, floor: i64) -> Result<()> {
        if self.sequence.current().await? < floor {
            self.sequence.initialize(floor).await?;
        }
        Ok(())
    }

    /// Appends `record` and returns the commit id if `is_commit` is set.
    ///
    /// A record that was not started yet gets its transaction id and timestamp
    /// here, inside the critical section. The record is durable (per the sync
    /// mode) once this returns. With `is_commit = false` the operation stays
    /// active until [`Self::commit`] or [`Self::abort`].
    ///
    /// # Errors
    ///
    /// Fails if the manager is not running. An I/O failure halts the manager.
    pub async fn log(
        &self,
        record: &mut RedoRecord,
        is_commit: bool,
    ) -> Result<Option<CommitId>> {
        let mut inner = self.inner.lock().await;
        self.ensure_running()?;

        if !record.is_started() {
            record.start(self.txn_ids.next_id(), now_millis());
        }
        if record.server_id().is_none() {
            record.set_server_id(self.config.server_id.clone());
        }
        record.set_commit(is_commit);

        let result = self.append_locked(&mut inner, record);
        let sequence = self.halt_on_fatal(result)?;

        let commit_id = match record.txn_id() {
            Some(txn) if is_commit => {
                inner.active.remove(&txn);
                CommitId::for_record(sequence, record)
            }
            Some(txn) => {
                inner.active.insert(txn, record.clone());
                None
            }
            None => None,
        };

        self.after_append(&mut inner).await?;
        Ok(commit_id)
    }

    /// Commits an operation previously logged with `is_commit = false`.
    ///
    /// # Errors
    ///
    /// Fails if the record is not in the logged state.
    pub async fn commit(&self, record: &mut RedoRecord) -> Result<CommitId> {
        let mut inner = self.inner.lock().await;
        self.ensure_running()?;

        let txn = match (record.state(), record.txn_id()) {
            (RecordState::Logged, Some(txn)) => txn,
            (state, _) => {
                return Err(RedoError::InvalidState(format!("cannot commit a {state:?} record")))
            }
        };

        let mut marker = RedoRecord::commit_marker(record, now_millis());
        let result = self.append_locked(&mut inner, &mut marker);
        let sequence = self.halt_on_fatal(result)?;
        inner.active.remove(&txn);
        record.set_state(RecordState::Committed);

        let commit_id = CommitId::for_record(sequence, &marker)
            .ok_or_else(|| RedoError::InvalidState("commit marker was not started".into()))?;
        self.after_append(&mut inner).await?;
        Ok(commit_id)
    }

    /// Aborts an operation.
    ///
    /// A logged operation gets an abort marker so replay skips it. An
    /// operation that never reached the log is only marked aborted.
    ///
    /// # Errors
    ///
    /// Fails if the record was already committed.
    pub async fn abort(&self, record: &mut RedoRecord) -> Result<()> {
        match record.state() {
            RecordState::Logged => {}
            RecordState::Committed => {
                return Err(RedoError::InvalidState("cannot abort a committed record".into()))
            }
            _ => {
                record.set_state(RecordState::Aborted);
                return Ok(());
            }
        }

        let mut inner = self.inner.lock().await;
        self.ensure_running()?;
        let mut marker = RedoRecord::abort_marker(record, now_millis());
        let result = self.append_locked(&mut inner, &mut marker);
        self.halt_on_fatal(result)?;
        if let Some(txn) = record.txn_id() {
            inner.active.remove(&txn);
        }
        record.set_state(RecordState::Aborted);
        self.after_append(&mut inner).await
    }

    /// Forces buffered records to stable storage.
    pub async fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.ensure_running()?;
        let result = match inner.writer.as_mut() {
            Some(writer) => writer.sync(),
            None => Ok(()),
        };
        self.halt_on_fatal(result)
    }

    /// Rolls the active segment into the archive.
    ///
    /// Returns `None` if nothing was written since the segment was opened.
    pub async fn force_rollover(&self) -> Result<Option<ArchivedSegment>> {
        self.force_rollover_with(false).await
    }

    /// Rolls the active segment, optionally without a checkpoint record.
    pub async fn force_rollover_with(
        &self,
        skip_checkpoint: bool,
    ) -> Result<Option<ArchivedSegment>> {
        let mut inner = self.inner.lock().await;
        self.ensure_running()?;
        let result = self.rollover_locked(&mut inner, skip_checkpoint).await;
        self.halt_on_fatal(result)
    }

    /// Lists archived segments in sequence order.
    pub fn archived_segments(&self) -> Result<Vec<ArchivedSegment>> {
        Ok(self.archive.list()?)
    }

    /// Lists archived segments with a sequence number of at least `sequence`.
    pub fn archived_segments_from(&self, sequence: i64) -> Result<Vec<ArchivedSegment>> {
        Ok(self.archive.list_from(sequence)?)
    }

    /// Path of the active segment.
    pub fn active_segment_path(&self) -> &Path {
        &self.config.log_path
    }

    /// Sequence number of the active segment, or -1 before the first start.
    pub fn current_sequence(&self) -> i64 {
        self.active_sequence.load(Ordering::SeqCst)
    }

    /// Returns append statistics.
    pub fn stats(&self) -> LogStats {
        let records_logged = self.records_logged.load(Ordering::Relaxed);
        let nanos = self.append_nanos.load(Ordering::Relaxed);
        let mean_append_ms = if records_logged == 0 {
            0.0
        } else {
            nanos as f64 / records_logged as f64 / 1_000_000.0
        };
        LogStats { records_logged, mean_append_ms }
    }

    /// Returns the mailboxes with commits after `since`, and the last commit id.
    ///
    /// Scans the archived segments from the commit id's sequence onward plus
    /// the active segment. If nothing was committed after `since`, the set is
    /// empty and `since` itself is returned.
    ///
    /// # Errors
    ///
    /// Returns [`RedoError::InvalidCommitId`] if no commit matches `since`.
    pub async fn changed_mailboxes_since(
        &self,
        since: &CommitId,
    ) -> Result<(BTreeSet<i64>, CommitId)> {
        let mut inner = self.inner.lock().await;
        self.ensure_running()?;
        if let Some(writer) = inner.writer.as_mut() {
            let result = writer.sync();
            self.halt_on_fatal(result)?;
        }

        let mut segments: Vec<(i64, PathBuf)> = self
            .archive
            .list_from(since.redo_seq())?
            .into_iter()
            .map(|s| (s.sequence, s.path))
            .collect();
        if let Some(writer) = inner.writer.as_ref() {
            segments.push((writer.sequence(), writer.path().to_path_buf()));
        }

        let mut found = false;
        let mut last = *since;
        let mut mailboxes = BTreeSet::new();
        for (sequence, path) in segments {
            for entry in SegmentReader::open(&path)? {
                let Ok(record) = entry?.record else { continue };
                if !record.is_commit() && !matches!(record.op(), RedoOp::CommitTxn(_)) {
                    continue;
                }
                if !found {
                    found = sequence == since.redo_seq() && since.matches(&record);
                    continue;
                }
                if record.mailbox_id() != UNSET_MAILBOX {
                    mailboxes.insert(record.mailbox_id());
                }
                if let Some(id) = CommitId::for_record(sequence, &record) {
                    last = id;
                }
            }
        }

        if !found {
            return Err(RedoError::InvalidCommitId(*since));
        }
        Ok((mailboxes, last))
    }

    /// Rolls the active segment, closes it and stops.
    ///
    /// Operations still active are carried into the new segment, so the next
    /// start redoes them.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                ManagerState::Stopped => return Ok(()),
                ManagerState::Running => *state = ManagerState::Stopping,
                other => return Err(RedoError::InvalidState(format!("cannot stop while {other}"))),
            }
        }

        let mut inner = self.inner.lock().await;
        let result = self.close_locked(&mut inner).await;
        let result = self.halt_on_fatal(result);
        inner.writer = None;
        inner.active.clear();
        *self.state.lock() = ManagerState::Stopped;

        let stats = self.stats();
        info!(
            records = stats.records_logged,
            mean_append_ms = stats.mean_append_ms,
            "Redo log stopped"
        );
        result
    }

    async fn close_locked(&self, inner: &mut Inner) -> Result<()> {
        self.check_halted()?;
        self.rollover_locked(inner, false).await?;
        if let Some(writer) = inner.writer.take() {
            writer.close()?;
        }
        Ok(())
    }

    /// Encodes, appends and syncs one record. Returns the segment sequence.
    fn append_locked(&self, inner: &mut Inner, record: &mut RedoRecord) -> Result<i64> {
        let writer = inner
            .writer
            .as_mut()
            .ok_or_else(|| RedoError::InvalidState("no active segment".into()))?;
        let frame = encode_record(record)?;

        let started = Instant::now();
        writer.append(&frame)?;
        writer.sync()?;
        let elapsed = started.elapsed();

        self.records_logged.fetch_add(1, Ordering::Relaxed);
        self.append_nanos.fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        metrics::record_append(elapsed.as_secs_f64(), writer.size());

        record.set_state(if record.is_commit() {
            RecordState::Committed
        } else {
            RecordState::Logged
        });
        Ok(writer.sequence())
    }

    /// Runs an automatic rollover if the active segment is due.
    ///
    /// Only fatal failures are returned; the record that triggered the check is
    /// already durable.
    async fn after_append(&self, inner: &mut Inner) -> Result<()> {
        let due = inner.writer.as_ref().is_some_and(|w| self.rollover_due(w));
        if !due {
            return Ok(());
        }
        match self.rollover_locked(inner, false).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_fatal() => self.halt_on_fatal(Err(e)),
            Err(e) => {
                warn!(error = %e, "Automatic rollover failed, retrying after next append");
                Ok(())
            }
        }
    }

    fn rollover_due(&self, writer: &SegmentWriter) -> bool {
        let limits = &self.config.rollover;
        let size = writer.size();
        if size >= limits.hard_max_bytes {
            return true;
        }
        if size < limits.soft_max_bytes || !writer.has_new_records() {
            return false;
        }
        let age = now_millis().saturating_sub(writer.header().created_ms);
        u64::try_from(age).unwrap_or(0) >= limits.min_age_ms
    }

    async fn rollover_locked(
        &self,
        inner: &mut Inner,
        skip_checkpoint: bool,
    ) -> Result<Option<ArchivedSegment>> {
        let Some(writer) = inner.writer.as_mut() else {
            return Err(RedoError::InvalidState("no active segment".into()));
        };
        if !writer.has_new_records() {
            debug!("Nothing written since the segment was opened, skipping rollover");
            return Ok(None);
        }

        if !skip_checkpoint && !inner.active.is_empty() {
            let active_txns = inner.active.keys().copied().collect();
            let mut checkpoint =
                RedoRecord::new(UNSET_MAILBOX, RedoOp::Checkpoint(Checkpoint { active_txns }))
                    .with_server_id(self.config.server_id.clone());
            checkpoint.start(self.txn_ids.next_id(), now_millis());
            writer.append(&encode_record(&checkpoint)?)?;
        }
        writer.sync()?;

        let next_sequence = self.sequence.increment_and_get().await?;
        let mut next = SegmentWriter::create(
            &self.config.staging_path(),
            SegmentHeader::new(next_sequence, now_millis()),
            self.config.sync_mode,
            self.config.buffer_size,
        )?;
        for record in inner.active.values() {
            next.append(&encode_record(record)?)?;
        }
        next.sync()?;
        next.mark_head();

        let old = std::mem::replace(writer, next);
        let old_path = old.path().to_path_buf();
        let (old_sequence, old_created) = (old.sequence(), old.header().created_ms);
        old.close()?;
        let archived = self.archive.move_in(&old_path, old_sequence, old_created)?;
        writer.rename_to(&self.config.log_path)?;
        self.sync_log_dir()?;

        self.active_sequence.store(next_sequence, Ordering::SeqCst);
        metrics::record_rollover(writer.size());
        info!(
            archived = %archived.path.display(),
            sequence = next_sequence,
            carried = inner.active.len(),
            "Rolled over redo log"
        );
        Ok(Some(archived))
    }

    fn sync_log_dir(&self) -> Result<()> {
        let dir = match self.config.log_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        Ok(sync_dir(dir)?)
    }

    fn check_halted(&self) -> Result<()> {
        match self.halted.lock().as_ref() {
            Some(reason) => Err(RedoError::Halted(reason.clone())),
            None => Ok(()),
        }
    }

    fn ensure_running(&self) -> Result<()> {
        self.check_halted()?;
        match *self.state.lock() {
            ManagerState::Running => Ok(()),
            other => Err(RedoError::NotRunning(other.as_str())),
        }
    }

    /// Halts the manager if `result` carries a fatal error.
    fn halt_on_fatal<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                let mut halted = self.halted.lock();
                if halted.is_none() {
                    error!(error = %e, "Redo log halted, no further records will be accepted");
                    metrics::record_fatal();
                    *halted = Some(e.to_string());
                }
            }
        }
        result
    }
}

impl fmt::Debug for RedoLogManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedoLogManager")
            .field("log_path", &self.config.log_path)
            .field("state", &self.state())
            .field("sequence", &self.current_sequence())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use redolog_core::record::{DeleteItems, DeliverMessage, MoveItems};
    use redolog_core::RolloverConfig;
    use redolog_sequence::LocalSequence;
    use tempfile::TempDir;

    use super::*;

    fn config(dir: &TempDir) -> RedoLogConfig {
        RedoLogConfig::in_dir(dir.path())
            .with_server_id("mbox1")
            .with_rollover(RolloverConfig::manual())
    }

    async fn running(dir: &TempDir) -> RedoLogManager {
        let manager = RedoLogManager::new(config(dir), Arc::new(LocalSequence::default()));
        manager.start(true).await.unwrap();
        manager
    }

    fn deliver(mailbox: i64, message_id: i32) -> RedoRecord {
        RedoRecord::new(
            mailbox,
            RedoOp::DeliverMessage(DeliverMessage {
                folder_id: 2,
                message_id,
                size: 1024,
                digest: "abc".to_string(),
                flags: 0,
                received_ms: 0,
            }),
        )
    }

    fn records(path: &Path) -> Vec<RedoRecord> {
        SegmentReader::open(path).unwrap().map(|e| e.unwrap().record.unwrap()).collect()
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let dir = TempDir::new().unwrap();
        let manager = RedoLogManager::new(config(&dir), Arc::new(LocalSequence::default()));
        assert_eq!(manager.state(), ManagerState::Stopped);

        let err = manager.log(&mut deliver(1, 1), true).await.unwrap_err();
        assert!(matches!(err, RedoError::NotRunning("stopped")));

        manager.start(true).await.unwrap();
        assert_eq!(manager.state(), ManagerState::Running);
        assert!(manager.start(true).await.is_err());
        assert!(manager.active_segment_path().exists());

        manager.stop().await.unwrap();
        assert_eq!(manager.state(), ManagerState::Stopped);
        // Stopping twice is harmless.
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_log_assigns_identity() {
        let dir = TempDir::new().unwrap();
        let manager = running(&dir).await;

        let mut first = deliver(1, 1);
        let mut second = deliver(1, 2);
        let commit_id = manager.log(&mut first, true).await.unwrap().unwrap();
        assert!(manager.log(&mut second, false).await.unwrap().is_none());

        assert_eq!(first.server_id(), Some("mbox1"));
        assert_eq!(first.state(), RecordState::Committed);
        assert_eq!(second.state(), RecordState::Logged);
        assert!(first.txn_id() < second.txn_id());
        assert_eq!(commit_id.redo_seq(), manager.current_sequence());
        assert!(commit_id.matches(&first));
        assert_eq!(manager.stats().records_logged, 2);
    }

    #[tokio::test]
    async fn test_rollover_of_empty_segment_is_noop() {
        let dir = TempDir::new().unwrap();
        let manager = running(&dir).await;
        let before = manager.current_sequence();

        assert!(manager.force_rollover().await.unwrap().is_none());
        assert_eq!(manager.current_sequence(), before);
        assert!(manager.archived_segments().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rollover_archives_exactly_the_logged_record() {
        let dir = TempDir::new().unwrap();
        let manager = running(&dir).await;
        let before = manager.current_sequence();

        let mut record = deliver(7, 1);
        manager.log(&mut record, true).await.unwrap();
        let archived = manager.force_rollover().await.unwrap().unwrap();

        assert_eq!(manager.current_sequence(), before + 1);
        assert_eq!(archived.sequence, before);
        assert_eq!(manager.archived_segments().unwrap(), vec![archived.clone()]);
        let logged = records(&archived.path);
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].txn_id(), record.txn_id());
        assert!(records(manager.active_segment_path()).is_empty());
    }

    #[tokio::test]
    async fn test_rollover_carries_active_operations() {
        let dir = TempDir::new().unwrap();
        let manager = running(&dir).await;

        let mut open = deliver(1, 1);
        let mut done = deliver(2, 2);
        manager.log(&mut open, false).await.unwrap();
        manager.log(&mut done, true).await.unwrap();
        let archived = manager.force_rollover().await.unwrap().unwrap();

        let closed = records(&archived.path);
        let RedoOp::Checkpoint(checkpoint) = closed.last().unwrap().op() else {
            panic!("expected checkpoint at the tail");
        };
        assert_eq!(checkpoint.active_txns, vec![open.txn_id().unwrap()]);

        let carried = records(manager.active_segment_path());
        assert_eq!(carried.len(), 1);
        assert_eq!(carried[0].txn_id(), open.txn_id());

        // The carried head alone does not make the segment roll again.
        assert!(manager.force_rollover().await.unwrap().is_none());

        manager.commit(&mut open).await.unwrap();
        assert!(manager.force_rollover().await.unwrap().is_some());
        assert!(records(manager.active_segment_path()).is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_rollovers_roll_once() {
        let dir = TempDir::new().unwrap();
        let manager = running(&dir).await;
        manager.log(&mut deliver(1, 1), true).await.unwrap();

        let (a, b) = tokio::join!(manager.force_rollover(), manager.force_rollover());
        let rolled = [a.unwrap(), b.unwrap()].iter().filter(|r| r.is_some()).count();
        assert_eq!(rolled, 1);
        assert_eq!(manager.archived_segments().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_commit_and_abort() {
        let dir = TempDir::new().unwrap();
        let manager = running(&dir).await;

        let mut never_logged = deliver(1, 1);
        manager.abort(&mut never_logged).await.unwrap();
        assert_eq!(never_logged.state(), RecordState::Aborted);
        assert!(manager.commit(&mut never_logged).await.is_err());

        let mut committed = deliver(1, 2);
        manager.log(&mut committed, false).await.unwrap();
        let commit_id = manager.commit(&mut committed).await.unwrap();
        assert_eq!(commit_id.txn_id(), committed.txn_id().unwrap());
        assert!(manager.abort(&mut committed).await.is_err());

        let mut aborted = deliver(1, 3);
        manager.log(&mut aborted, false).await.unwrap();
        manager.abort(&mut aborted).await.unwrap();

        let ops: Vec<&'static str> =
            records(manager.active_segment_path()).iter().map(|r| r.op().name()).collect();
        assert_eq!(ops, vec!["DeliverMessage", "CommitTxn", "DeliverMessage", "AbortTxn"]);
    }

    #[tokio::test]
    async fn test_changed_mailboxes_since() {
        let dir = TempDir::new().unwrap();
        let manager = running(&dir).await;

        let mut base = deliver(1, 1);
        let since = manager.log(&mut base, true).await.unwrap().unwrap();

        manager.log(&mut deliver(5, 2), true).await.unwrap();
        manager.force_rollover().await.unwrap();
        let op = RedoOp::MoveItems(MoveItems { item_ids: vec![1], target_folder_id: 5 });
        let mut moved = RedoRecord::new(3, op);
        manager.log(&mut moved, false).await.unwrap();
        let last = manager.commit(&mut moved).await.unwrap();
        // Uncommitted work is not reported.
        manager.log(&mut deliver(9, 3), false).await.unwrap();

        let (mailboxes, reported) = manager.changed_mailboxes_since(&since).await.unwrap();
        assert_eq!(mailboxes, BTreeSet::from([3, 5]));
        assert_eq!(reported, last);

        let (none, same) = manager.changed_mailboxes_since(&last).await.unwrap();
        assert!(none.is_empty());
        assert_eq!(same, last);

        let bogus = CommitId::new(since.redo_seq(), 1, TransactionId::new(1, 1));
        assert!(matches!(
            manager.changed_mailboxes_since(&bogus).await,
            Err(RedoError::InvalidCommitId(_))
        ));
    }

    #[tokio::test]
    async fn test_automatic_rollover_at_hard_limit() {
        let dir = TempDir::new().unwrap();
        let rollover = RolloverConfig { hard_max_bytes: 1, ..RolloverConfig::manual() };
        let manager = RedoLogManager::new(
            config(&dir).with_rollover(rollover),
            Arc::new(LocalSequence::default()),
        );
        manager.start(true).await.unwrap();

        for i in 0..3 {
            manager.log(&mut deliver(1, i), true).await.unwrap();
        }
        assert_eq!(manager.archived_segments().unwrap().len(), 3);
        assert_eq!(manager.current_sequence(), 3);
    }

    #[tokio::test]
    async fn test_io_failure_halts_manager() {
        let dir = TempDir::new().unwrap();
        let manager = running(&dir).await;
        manager.log(&mut deliver(1, 1), true).await.unwrap();

        // A file where the archive directory should be makes the rollover fail.
        fs::remove_dir_all(&manager.config().archive_dir).unwrap();
        fs::write(&manager.config().archive_dir, b"not a directory").unwrap();

        let err = manager.force_rollover().await.unwrap_err();
        assert!(err.is_fatal());
        assert!(manager.is_halted());

        let err = manager.log(&mut deliver(1, 2), true).await.unwrap_err();
        assert!(matches!(err, RedoError::Halted(_)));
        assert!(matches!(manager.flush().await, Err(RedoError::Halted(_))));
    }

    #[tokio::test]
    async fn test_stop_carries_active_work_to_next_start() {
        let dir = TempDir::new().unwrap();
        let manager = running(&dir).await;
        let mut open = RedoRecord::new(4, RedoOp::DeleteItems(DeleteItems { item_ids: vec![1] }));
        manager.log(&mut open, false).await.unwrap();
        manager.stop().await.unwrap();

        let carried = records(manager.active_segment_path());
        assert_eq!(carried.len(), 1);
        assert_eq!(carried[0].txn_id(), open.txn_id());
        assert_eq!(manager.archived_segments().unwrap().len(), 1);
    }
}
