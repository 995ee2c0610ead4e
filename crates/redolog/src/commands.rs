//! Command handlers.
//!
//! Handlers write their report to `out` so they can be driven from tests.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::DateTime;
use redolog_core::Config;
use redolog_storage::{write_report, Archive, ArchivedSegment, SegmentReader, ServerFilter};
use serde::Serialize;
use tracing::{error, warn};

use crate::cli::{ArchiveArgs, InfoArgs, OutputFormat, VerifyArgs};

/// An archived segment as printed by `archive`.
#[derive(Debug, Serialize)]
pub struct SegmentListing {
    /// Log sequence number.
    pub sequence: i64,
    /// Creation time (RFC 3339).
    pub created: String,
    /// Path of the archived file.
    pub path: PathBuf,
}

impl From<&ArchivedSegment> for SegmentListing {
    fn from(segment: &ArchivedSegment) -> Self {
        Self {
            sequence: segment.sequence,
            created: format_millis(segment.created_ms),
            path: segment.path.clone(),
        }
    }
}

/// Summary of one segment file as printed by `info`.
#[derive(Debug, Serialize)]
pub struct SegmentInfo {
    /// Path of the file.
    pub path: PathBuf,
    /// Segment format version.
    pub version: u32,
    /// Log sequence number.
    pub sequence: i64,
    /// Creation time (RFC 3339).
    pub created: String,
    /// Records that decoded.
    pub records: usize,
    /// Records that did not decode.
    pub unreadable: usize,
    /// Bytes up to the end of the last complete frame.
    pub valid_bytes: u64,
    /// Size of the file on disk.
    pub file_bytes: u64,
}

/// Verifies each file in turn.
///
/// A file that cannot be opened or has a bad segment header is logged and
/// skipped; the command fails once all files have been tried.
pub fn handle_verify(args: &VerifyArgs, out: &mut impl Write) -> Result<()> {
    let filter = ServerFilter::from_ids(args.server_ids.clone());
    let mut failed = 0usize;

    for path in &args.files {
        match write_report(out, path, &filter, args.quiet) {
            Ok(report) if report.unreadable > 0 => {
                warn!(
                    path = %path.display(),
                    unreadable = report.unreadable,
                    "Segment contains unreadable records"
                );
            }
            Ok(_) => {}
            Err(e) => {
                error!(path = %path.display(), error = %e, "Cannot verify segment");
                failed += 1;
            }
        }
    }
    out.flush()?;

    if failed > 0 {
        bail!("{failed} of {} files could not be verified", args.files.len());
    }
    Ok(())
}

/// Lists the archive of the configured log.
pub fn handle_archive(config: &Config, args: &ArchiveArgs, out: &mut impl Write) -> Result<()> {
    let archive = Archive::new(config.redolog.archive_dir.clone());
    let segments = match args.from {
        Some(sequence) => archive.list_from(sequence),
        None => archive.list(),
    }
    .with_context(|| format!("Failed to list archive {}", archive.dir().display()))?;
    let listing: Vec<SegmentListing> = segments.iter().map(SegmentListing::from).collect();

    match args.format {
        OutputFormat::Json => {
            writeln!(out, "{}", serde_json::to_string_pretty(&listing)?)?;
        }
        OutputFormat::Text => {
            for entry in &listing {
                writeln!(
                    out,
                    "seq={} created={} path={}",
                    entry.sequence,
                    entry.created,
                    entry.path.display()
                )?;
            }
            writeln!(out, "{} archived segments in {}", listing.len(), archive.dir().display())?;
        }
    }
    Ok(())
}

/// Prints the header of a segment and counts its records.
pub fn handle_info(args: &InfoArgs, out: &mut impl Write) -> Result<()> {
    let info = segment_info(&args.file)?;

    match args.format {
        OutputFormat::Json => {
            writeln!(out, "{}", serde_json::to_string_pretty(&info)?)?;
        }
        OutputFormat::Text => {
            writeln!(out, "path:        {}", info.path.display())?;
            writeln!(out, "version:     {}", info.version)?;
            writeln!(out, "sequence:    {}", info.sequence)?;
            writeln!(out, "created:     {}", info.created)?;
            writeln!(out, "records:     {}", info.records)?;
            writeln!(out, "unreadable:  {}", info.unreadable)?;
            writeln!(out, "valid bytes: {} of {}", info.valid_bytes, info.file_bytes)?;
        }
    }
    Ok(())
}

fn segment_info(path: &Path) -> Result<SegmentInfo> {
    let file_bytes = std::fs::metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?
        .len();
    let mut reader = SegmentReader::open(path)
        .with_context(|| format!("Failed to open segment {}", path.display()))?;
    let header = *reader.header();

    let (mut records, mut unreadable) = (0, 0);
    for entry in reader.by_ref() {
        let entry = entry.with_context(|| format!("Failed to read {}", path.display()))?;
        if entry.record.is_ok() {
            records += 1;
        } else {
            unreadable += 1;
        }
    }

    Ok(SegmentInfo {
        path: path.to_path_buf(),
        version: header.version,
        sequence: header.sequence,
        created: format_millis(header.created_ms),
        records,
        unreadable,
        valid_bytes: reader.valid_len(),
        file_bytes,
    })
}

fn format_millis(ms: i64) -> String {
    DateTime::from_timestamp_millis(ms).map_or_else(|| ms.to_string(), |t| t.to_rfc3339())
}
