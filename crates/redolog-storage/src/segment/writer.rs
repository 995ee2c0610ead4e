//! Append-only segment writer.
//!
//! The writer owns the file handle of one segment. It is not synchronized on
//! its own; the manager keeps it behind the lock that defines the log order.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use redolog_core::{SegmentHeader, SyncMode, SEGMENT_HEADER_LEN};
use tracing::warn;

use super::reader::SegmentReader;
use crate::error::Result;

/// Writes frames to the end of a segment file.
pub struct SegmentWriter {
    path: PathBuf,
    file: BufWriter<File>,
    header: SegmentHeader,
    size: u64,
    initial_size: u64,
    sync_mode: SyncMode,
}

impl SegmentWriter {
    /// Creates a new segment, replacing any file at `path`.
    ///
    /// The header is written and synced before this returns.
    pub fn create(
        path: &Path,
        header: SegmentHeader,
        sync_mode: SyncMode,
        buffer_size: usize,
    ) -> Result<Self> {
        let mut file = File::create(path)?;
        file.write_all(&header.encode())?;
        file.sync_all()?;

        let size = SEGMENT_HEADER_LEN as u64;
        Ok(Self {
            path: path.to_path_buf(),
            file: BufWriter::with_capacity(buffer_size, file),
            header,
            size,
            initial_size: size,
            sync_mode,
        })
    }

    /// Opens an existing segment for appending.
    ///
    /// A torn frame at the tail, left by a crash mid-append, is cut off so new
    /// frames start on a frame boundary. The discarded bytes are kept in a
    /// sidecar file next to the segment (see [`corrupt_sidecar_path`]).
    pub fn open(path: &Path, sync_mode: SyncMode, buffer_size: usize) -> Result<Self> {
        let mut reader = SegmentReader::open(path)?;
        let header = *reader.header();
        for entry in reader.by_ref() {
            entry?;
        }
        let valid_len = reader.valid_len();

        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let actual_len = file.metadata()?.len();
        if actual_len > valid_len {
            let sidecar = corrupt_sidecar_path(path, valid_len);
            preserve_tail(&mut file, valid_len, &sidecar)?;
            warn!(
                path = %path.display(),
                discarded = actual_len - valid_len,
                sidecar = %sidecar.display(),
                "Discarding torn tail of redo log segment"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(valid_len))?;

        Ok(Self {
            path: path.to_path_buf(),
            file: BufWriter::with_capacity(buffer_size, file),
            header,
            size: valid_len,
            initial_size: SEGMENT_HEADER_LEN as u64,
            sync_mode,
        })
    }

    /// Appends one encoded frame and returns the offset it starts at.
    ///
    /// The frame may sit in the write buffer until [`Self::sync`].
    pub fn append(&mut self, frame: &[u8]) -> Result<u64> {
        let offset = self.size;
        self.file.write_all(frame)?;
        self.size += frame.len() as u64;
        Ok(offset)
    }

    /// Flushes buffered frames and syncs according to the sync mode.
    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        let inner = self.file.get_ref();
        match self.sync_mode {
            SyncMode::None => {}
            SyncMode::Fdatasync => inner.sync_data()?,
            SyncMode::Fsync => inner.sync_all()?,
        }
        Ok(())
    }

    /// Flushes and fully syncs the segment, then closes it.
    pub fn close(mut self) -> Result<()> {
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        Ok(())
    }

    /// Renames the segment file, keeping the open handle.
    pub fn rename_to(&mut self, path: &Path) -> Result<()> {
        std::fs::rename(&self.path, path)?;
        self.path = path.to_path_buf();
        Ok(())
    }

    /// Marks everything written so far as the head of the segment.
    ///
    /// Used after carried-forward records are copied into a new segment, so
    /// they alone do not make the segment eligible for another rollover.
    pub fn mark_head(&mut self) {
        self.initial_size = self.size;
    }

    /// Returns true if anything was appended after the head.
    pub fn has_new_records(&self) -> bool {
        self.size > self.initial_size
    }

    /// Returns true if the segment holds no records at all.
    pub fn is_empty(&self) -> bool {
        self.size <= SEGMENT_HEADER_LEN as u64
    }

    /// Returns the segment size in bytes, including buffered frames.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the segment header.
    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    /// Returns the log sequence number of the segment.
    pub fn sequence(&self) -> i64 {
        self.header.sequence
    }

    /// Path to the segment file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Returns where the bytes cut from `path` at `offset` are kept.
///
/// The name is `<segment>.<offset>.corrupt`.
#[must_use]
pub fn corrupt_sidecar_path(path: &Path, offset: u64) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{offset}.corrupt"));
    PathBuf::from(name)
}

/// Copies everything from `offset` to EOF into `sidecar` and syncs it.
fn preserve_tail(file: &mut File, offset: u64, sidecar: &Path) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    let mut out = File::create(sidecar)?;
    io::copy(file, &mut out)?;
    out.sync_all()
}
