//! Segment reader.
//!
//! Decodes the record stream of one segment lazily. Damage is reported per
//! record: a frame whose header or payload cannot be decoded is yielded as an
//! error entry and the scan moves on to the next frame. Only damage to the
//! framing itself (a truncated tail or an impossible length) ends the scan,
//! since the position of the next frame is then unknown.

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;

use redolog_core::codec::{decode_record, MAX_FRAME_LEN};
use redolog_core::{DecodeError, RecordHeader, RedoRecord, SegmentHeader, SEGMENT_HEADER_LEN};

use crate::error::Result;

/// One frame read from a segment.
#[derive(Debug, Clone)]
pub struct SegmentEntry {
    /// Byte offset of the frame within the segment file.
    pub offset: u64,
    /// Record header, if it could be decoded.
    pub header: Option<RecordHeader>,
    /// The decoded record, or why it could not be decoded.
    pub record: std::result::Result<RedoRecord, DecodeError>,
}

impl SegmentEntry {
    /// Returns the origin server id, if the header was readable.
    pub fn server_id(&self) -> Option<&str> {
        self.header.as_ref().map(|h| h.server_id.as_str())
    }
}

/// Lazy, non-restartable iterator over the records of a segment.
pub struct SegmentReader<R = BufReader<File>> {
    inner: R,
    header: SegmentHeader,
    offset: u64,
    valid_len: u64,
    done: bool,
}

impl SegmentReader<BufReader<File>> {
    /// Opens a segment file and validates its header.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be opened, or a codec error if
    /// the segment header is missing or invalid.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Self::new(BufReader::new(file))
    }
}

impl<R: Read> SegmentReader<R> {
    /// Wraps a reader positioned at the start of a segment.
    pub fn new(mut inner: R) -> Result<Self> {
        let mut buf = [0u8; SEGMENT_HEADER_LEN];
        let read = read_full(&mut inner, &mut buf)?;
        let header = SegmentHeader::decode(&buf[..read])?;
        let start = SEGMENT_HEADER_LEN as u64;
        Ok(Self { inner, header, offset: start, valid_len: start, done: false })
    }

    /// Returns the segment header.
    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    /// Returns the end offset of the last complete frame read so far.
    ///
    /// After the iterator is exhausted this is the length of the intact
    /// prefix of the segment.
    pub fn valid_len(&self) -> u64 {
        self.valid_len
    }

    fn next_entry(&mut self) -> std::io::Result<Option<SegmentEntry>> {
        let offset = self.offset;

        let mut len_buf = [0u8; 4];
        let read = read_full(&mut self.inner, &mut len_buf)?;
        if read == 0 {
            return Ok(None);
        }
        if read < 4 {
            return Ok(Some(self.stop(offset, truncated(4, read))));
        }
        let header_len = u32::from_le_bytes(len_buf);
        if header_len > MAX_FRAME_LEN {
            let err = DecodeError::Malformed(format!("header length {header_len} exceeds limit"));
            return Ok(Some(self.stop(offset, err)));
        }

        let mut header_bytes = vec![0u8; header_len as usize];
        let read = read_full(&mut self.inner, &mut header_bytes)?;
        if read < header_bytes.len() {
            return Ok(Some(self.stop(offset, truncated(header_bytes.len(), read))));
        }

        let read = read_full(&mut self.inner, &mut len_buf)?;
        if read < 4 {
            return Ok(Some(self.stop(offset, truncated(4, read))));
        }
        let payload_len = u32::from_le_bytes(len_buf);
        if payload_len > MAX_FRAME_LEN {
            let err = DecodeError::Malformed(format!("payload length {payload_len} exceeds limit"));
            return Ok(Some(self.stop(offset, err)));
        }

        let mut payload = vec![0u8; payload_len as usize];
        let read = read_full(&mut self.inner, &mut payload)?;
        if read < payload.len() {
            return Ok(Some(self.stop(offset, truncated(payload.len(), read))));
        }

        self.offset = offset + 8 + u64::from(header_len) + u64::from(payload_len);
        self.valid_len = self.offset;

        let entry = match RecordHeader::decode(&header_bytes) {
            Ok(header) => {
                let record = decode_record(&header, &payload);
                SegmentEntry { offset, header: Some(header), record }
            }
            Err(e) => SegmentEntry { offset, header: None, record: Err(e) },
        };
        Ok(Some(entry))
    }

    fn stop(&mut self, offset: u64, err: DecodeError) -> SegmentEntry {
        self.done = true;
        SegmentEntry { offset, header: None, record: Err(err) }
    }
}

impl<R: Read> Iterator for SegmentReader<R> {
    type Item = std::io::Result<SegmentEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

fn truncated(needed: usize, available: usize) -> DecodeError {
    DecodeError::Truncated { needed: needed as u64, available: available as u64 }
}

/// Reads until `buf` is full or EOF, returning the number of bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
