//! Log verifier.
//!
//! Decodes a segment into one human-readable summary per record. The output
//! is line oriented and greppable:
//!
//! ```text
//! === BEGIN REDO LOG path=redo.log seq=4 ===
//! offset=28 txn=1700000000-1 serverId=mbox1 mailbox=7 name=DeleteItems commit=true items=3,4
//! offset=101 UNREADABLE serverId=mbox1 reason=unknown operation tag 42
//! === END REDO LOG records=1 unreadable=1 ===
//! ```
//!
//! A record that cannot be decoded is reported inline and the scan moves on.

use std::collections::BTreeSet;
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

use redolog_core::TransactionId;

use crate::error::Result;
use crate::segment::{SegmentEntry, SegmentReader};

/// Origin server ids to include in a scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerFilter {
    ids: Option<BTreeSet<String>>,
}

impl ServerFilter {
    /// Accepts every record.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Accepts only records from the given servers.
    #[must_use]
    pub fn only<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { ids: Some(ids.into_iter().map(Into::into).collect()) }
    }

    /// Builds a filter from command line values; no values means no filter.
    #[must_use]
    pub fn from_ids(ids: Vec<String>) -> Self {
        if ids.is_empty() {
            Self::all()
        } else {
            Self::only(ids)
        }
    }

    /// Returns true if the filter lets everything through.
    #[must_use]
    pub fn is_all(&self) -> bool {
        self.ids.is_none()
    }

    /// Returns true if a record from `server_id` passes.
    ///
    /// A record whose origin is unknown only passes when there is no filter.
    #[must_use]
    pub fn accepts(&self, server_id: Option<&str>) -> bool {
        match (&self.ids, server_id) {
            (None, _) => true,
            (Some(ids), Some(id)) => ids.contains(id),
            (Some(_), None) => false,
        }
    }
}

/// One line of verifier output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordSummary {
    /// A decoded record.
    Record {
        /// Byte offset of the frame.
        offset: u64,
        /// Transaction id.
        txn_id: TransactionId,
        /// Origin server id.
        server_id: String,
        /// Mailbox id (`-1` when unset).
        mailbox_id: i64,
        /// Operation name.
        name: &'static str,
        /// Commit flag.
        commit: bool,
        /// Operation-specific fields.
        key_fields: String,
    },
    /// A frame that could not be decoded.
    Unreadable {
        /// Byte offset of the frame.
        offset: u64,
        /// Origin server id, if the record header was readable.
        server_id: Option<String>,
        /// Why decoding failed.
        reason: String,
    },
}

impl RecordSummary {
    fn from_entry(entry: SegmentEntry) -> Self {
        match entry.record {
            Ok(record) => Self::Record {
                offset: entry.offset,
                txn_id: record.txn_id().unwrap_or(TransactionId::new(0, 0)),
                server_id: record.server_id().unwrap_or_default().to_owned(),
                mailbox_id: record.mailbox_id(),
                name: record.op().name(),
                commit: record.is_commit(),
                key_fields: record.op().key_fields(),
            },
            Err(e) => Self::Unreadable {
                offset: entry.offset,
                server_id: entry.header.map(|h| h.server_id),
                reason: e.to_string(),
            },
        }
    }

    /// Returns true for a decoded record.
    #[must_use]
    pub const fn is_readable(&self) -> bool {
        matches!(self, Self::Record { .. })
    }

    /// Returns the origin server id, if known.
    #[must_use]
    pub fn server_id(&self) -> Option<&str> {
        match self {
            Self::Record { server_id, .. } => Some(server_id),
            Self::Unreadable { server_id, .. } => server_id.as_deref(),
        }
    }
}

impl fmt::Display for RecordSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Record { offset, txn_id, server_id, mailbox_id, name, commit, key_fields } => {
                write!(
                    f,
                    "offset={offset} txn={txn_id} serverId={server_id} mailbox={mailbox_id} \
                     name={name} commit={commit}"
                )?;
                if !key_fields.is_empty() {
                    write!(f, " {key_fields}")?;
                }
                Ok(())
            }
            Self::Unreadable { offset, server_id, reason } => {
                write!(f, "offset={offset} UNREADABLE")?;
                if let Some(id) = server_id {
                    write!(f, " serverId={id}")?;
                }
                write!(f, " reason={reason}")
            }
        }
    }
}

/// Lazy, non-restartable scan of one segment.
pub struct LogScan<R = BufReader<File>> {
    reader: SegmentReader<R>,
    filter: ServerFilter,
}

impl<R: Read> LogScan<R> {
    /// Scans a segment read from `reader`.
    pub fn new(reader: SegmentReader<R>, filter: ServerFilter) -> Self {
        Self { reader, filter }
    }

    /// Log sequence number from the segment header.
    pub fn sequence(&self) -> i64 {
        self.reader.header().sequence
    }
}

impl<R: Read> Iterator for LogScan<R> {
    type Item = io::Result<RecordSummary>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.reader.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e)),
            };
            if self.filter.accepts(entry.server_id()) {
                return Some(Ok(RecordSummary::from_entry(entry)));
            }
        }
    }
}

/// Opens a segment for scanning.
///
/// # Errors
///
/// Fails if the file cannot be opened or its segment header is invalid.
pub fn scan_log(path: &Path, filter: ServerFilter) -> Result<LogScan> {
    Ok(LogScan::new(SegmentReader::open(path)?, filter))
}

/// Counts from one verified segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifyReport {
    /// Record lines written.
    pub records: usize,
    /// Unreadable lines written.
    pub unreadable: usize,
}

/// Writes the verifier report for one segment.
///
/// With `quiet` set only the begin and end markers are written.
///
/// # Errors
///
/// Fails without writing anything if the segment cannot be opened. A read
/// error later on still closes the report with an end marker carrying the
/// error, then is returned.
pub fn write_report<W: Write>(
    out: &mut W,
    path: &Path,
    filter: &ServerFilter,
    quiet: bool,
) -> Result<VerifyReport> {
    let scan = scan_log(path, filter.clone())?;
    write_scan_report(out, path, scan, quiet)
}

/// Writes the report for an already opened scan. `path` labels the markers.
pub fn write_scan_report<R: Read, W: Write>(
    out: &mut W,
    path: &Path,
    scan: LogScan<R>,
    quiet: bool,
) -> Result<VerifyReport> {
    writeln!(out, "=== BEGIN REDO LOG path={} seq={} ===", path.display(), scan.sequence())?;

    let mut report = VerifyReport::default();
    for summary in scan {
        let summary = match summary {
            Ok(summary) => summary,
            Err(e) => {
                writeln!(
                    out,
                    "=== END REDO LOG records={} unreadable={} error={e} ===",
                    report.records, report.unreadable
                )?;
                return Err(e.into());
            }
        };
        if summary.is_readable() {
            report.records += 1;
        } else {
            report.unreadable += 1;
        }
        if !quiet {
            writeln!(out, "{summary}")?;
        }
    }

    writeln!(
        out,
        "=== END REDO LOG records={} unreadable={} ===",
        report.records, report.unreadable
    )?;
    Ok(report)
}
