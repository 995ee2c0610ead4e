//! Archive of closed segments.
//!
//! Archived segments are named `redo-<sequence>-<created_ms>.log` with the
//! sequence zero-padded, so a plain directory listing sorts them in log order
//! and no two segments can share a name. Once moved in, a segment is never
//! modified again.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

const PREFIX: &str = "redo-";
const SUFFIX: &str = ".log";

/// A segment in the archive directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedSegment {
    /// Path of the archived file.
    pub path: PathBuf,
    /// Log sequence number.
    pub sequence: i64,
    /// Creation time of the segment (milliseconds since epoch).
    pub created_ms: i64,
}

/// Returns the archive file name for a segment.
#[must_use]
pub fn archive_file_name(sequence: i64, created_ms: i64) -> String {
    format!("{PREFIX}{sequence:020}-{created_ms}{SUFFIX}")
}

/// Parses `(sequence, created_ms)` back out of an archive file name.
#[must_use]
pub fn parse_archive_file_name(name: &str) -> Option<(i64, i64)> {
    let stem = name.strip_prefix(PREFIX)?.strip_suffix(SUFFIX)?;
    let (sequence, created_ms) = stem.split_once('-')?;
    if sequence.is_empty() || !sequence.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if created_ms.is_empty() || !created_ms.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((sequence.parse().ok()?, created_ms.parse().ok()?))
}

/// The archive directory.
#[derive(Debug, Clone)]
pub struct Archive {
    dir: PathBuf,
}

impl Archive {
    /// Creates a handle for the archive at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Returns the archive directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Creates the directory if it does not exist.
    pub fn ensure(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir)
    }

    /// Lists archived segments in log sequence order.
    ///
    /// Files that do not follow the naming scheme are ignored.
    pub fn list(&self) -> io::Result<Vec<ArchivedSegment>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut segments = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some((sequence, created_ms)) = name.to_str().and_then(parse_archive_file_name)
            else {
                continue;
            };
            segments.push(ArchivedSegment { path: entry.path(), sequence, created_ms });
        }
        segments.sort_by_key(|s| (s.sequence, s.created_ms));
        Ok(segments)
    }

    /// Lists archived segments with a sequence number of at least `sequence`.
    pub fn list_from(&self, sequence: i64) -> io::Result<Vec<ArchivedSegment>> {
        let mut segments = self.list()?;
        segments.retain(|s| s.sequence >= sequence);
        Ok(segments)
    }

    /// Moves a closed segment into the archive.
    ///
    /// Falls back to copy-then-delete when the file cannot be renamed (for
    /// example when the archive lives on another file system). The copy is
    /// staged under a temporary name so a partial copy is never listed.
    pub fn move_in(
        &self,
        path: &Path,
        sequence: i64,
        created_ms: i64,
    ) -> io::Result<ArchivedSegment> {
        self.ensure()?;
        let target = self.dir.join(archive_file_name(sequence, created_ms));
        if target.exists() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("archived segment {} already exists", target.display()),
            ));
        }

        if let Err(e) = fs::rename(path, &target) {
            warn!(
                from = %path.display(),
                to = %target.display(),
                error = %e,
                "Rename into archive failed, copying instead"
            );
            let staging = target.with_extension("partial");
            fs::copy(path, &staging)?;
            fs::File::open(&staging)?.sync_all()?;
            fs::rename(&staging, &target)?;
            fs::remove_file(path)?;
        }
        sync_dir(&self.dir)?;

        debug!(path = %target.display(), sequence, "Archived redo log segment");
        Ok(ArchivedSegment { path: target, sequence, created_ms })
    }
}

/// Makes a rename in `dir` durable.
#[cfg(unix)]
pub(crate) fn sync_dir(dir: &Path) -> io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

/// Makes a rename in `dir` durable.
#[cfg(not(unix))]
pub(crate) fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
