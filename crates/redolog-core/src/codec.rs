//! Bit-exact encoding of segments and records.
//!
//! # Segment layout
//!
//! ```text
//! +--------+---------+------------+----------+----------+
//! | magic  | version | created_ms | sequence | reserved |
//! | 4 B    | u32     | i64        | i64      | u32      |
//! +--------+---------+------------+----------+----------+
//! | frame | frame | ...                          (to EOF) |
//! ```
//!
//! # Record frame
//!
//! ```text
//! header_len u32 | header bytes | payload_len u32 | payload bytes
//! ```
//!
//! Header bytes: `tag u16, payload_version u16, flags u8, mailbox_id i64,
//! txn_time i64, txn_counter i32, timestamp i64, server_id_len u16, server_id`.
//! The payload is sized independently so a reader can skip a payload it does
//! not understand without losing its position in the stream.
//!
//! All integers are little-endian.

use crate::error::{DecodeError, Error, Result};
use crate::record::{OpKind, RedoOp, RedoRecord, PAYLOAD_VERSION};
use crate::txn::TransactionId;

/// Magic bytes at the start of every segment.
pub const SEGMENT_MAGIC: &[u8; 4] = b"ZRDO";

/// Segment format version.
pub const SEGMENT_VERSION: u32 = 1;

/// Size of the segment header in bytes.
pub const SEGMENT_HEADER_LEN: usize = 28;

/// Largest header or payload a frame may declare. Anything larger is corruption.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

const FLAG_COMMIT: u8 = 0x01;

/// Fixed part of the record header, before the server id bytes.
const FIXED_HEADER_LEN: usize = 2 + 2 + 1 + 8 + 8 + 4 + 8 + 2;

/// Header at the start of every segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Format version.
    pub version: u32,
    /// Creation time (milliseconds since epoch).
    pub created_ms: i64,
    /// Log sequence number of the segment.
    pub sequence: i64,
}

impl SegmentHeader {
    /// Creates a header for a new segment in the current format.
    #[must_use]
    pub const fn new(sequence: i64, created_ms: i64) -> Self {
        Self { version: SEGMENT_VERSION, created_ms, sequence }
    }

    /// Encodes the header.
    #[must_use]
    pub fn encode(&self) -> [u8; SEGMENT_HEADER_LEN] {
        let mut buf = [0u8; SEGMENT_HEADER_LEN];
        buf[0..4].copy_from_slice(SEGMENT_MAGIC);
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..16].copy_from_slice(&self.created_ms.to_le_bytes());
        buf[16..24].copy_from_slice(&self.sequence.to_le_bytes());
        buf
    }

    /// Decodes and validates a header.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Codec`] if the bytes are short, the magic is wrong, or
    /// the version is not supported. The whole segment is unusable in that case.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SEGMENT_HEADER_LEN {
            return Err(Error::Codec(format!(
                "segment header truncated: {} of {SEGMENT_HEADER_LEN} bytes",
                bytes.len()
            )));
        }
        if &bytes[0..4] != SEGMENT_MAGIC {
            return Err(Error::Codec("invalid segment magic".to_string()));
        }
        let mut cursor = Cursor::new(&bytes[4..SEGMENT_HEADER_LEN]);
        let parsed = (|| -> std::result::Result<Self, DecodeError> {
            let version = cursor.u32()?;
            let created_ms = cursor.i64()?;
            let sequence = cursor.i64()?;
            Ok(Self { version, created_ms, sequence })
        })()
        .map_err(|e| Error::Codec(e.to_string()))?;

        if parsed.version != SEGMENT_VERSION {
            return Err(Error::Codec(format!("unsupported segment version: {}", parsed.version)));
        }
        Ok(parsed)
    }
}

/// Decoded record header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    /// Operation wire tag.
    pub tag: u16,
    /// Payload version.
    pub payload_version: u16,
    /// Commit flag.
    pub commit: bool,
    /// Mailbox id, [`crate::record::UNSET_MAILBOX`] if none.
    pub mailbox_id: i64,
    /// Transaction id.
    pub txn_id: TransactionId,
    /// Start timestamp (milliseconds since epoch).
    pub timestamp: i64,
    /// Origin server id.
    pub server_id: String,
}

impl RecordHeader {
    /// Builds the header for a started record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Codec`] if the record has no transaction id yet.
    pub fn of(record: &RedoRecord) -> Result<Self> {
        let (Some(txn_id), Some(timestamp)) = (record.txn_id(), record.timestamp()) else {
            return Err(Error::Codec(format!("{} record was never started", record.op().name())));
        };
        Ok(Self {
            tag: record.op().kind().tag(),
            payload_version: PAYLOAD_VERSION,
            commit: record.is_commit(),
            mailbox_id: record.mailbox_id(),
            txn_id,
            timestamp,
            server_id: record.server_id().unwrap_or_default().to_string(),
        })
    }

    /// Returns the operation kind, if the tag is known.
    #[must_use]
    pub const fn kind(&self) -> Option<OpKind> {
        OpKind::from_tag(self.tag)
    }

    /// Encodes the header bytes (without the length prefix).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Codec`] if the server id is longer than `u16::MAX` bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let server_len = u16::try_from(self.server_id.len())
            .map_err(|_| Error::Codec("server id too long".to_string()))?;

        let mut buf = Vec::with_capacity(FIXED_HEADER_LEN + self.server_id.len());
        buf.extend_from_slice(&self.tag.to_le_bytes());
        buf.extend_from_slice(&self.payload_version.to_le_bytes());
        buf.push(if self.commit { FLAG_COMMIT } else { 0 });
        buf.extend_from_slice(&self.mailbox_id.to_le_bytes());
        buf.extend_from_slice(&self.txn_id.time().to_le_bytes());
        buf.extend_from_slice(&self.txn_id.counter().to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&server_len.to_le_bytes());
        buf.extend_from_slice(self.server_id.as_bytes());
        Ok(buf)
    }

    /// Decodes header bytes.
    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, DecodeError> {
        let mut cursor = Cursor::new(bytes);
        let tag = cursor.u16()?;
        let payload_version = cursor.u16()?;
        let flags = cursor.u8()?;
        let mailbox_id = cursor.i64()?;
        let txn_time = cursor.i64()?;
        let txn_counter = cursor.i32()?;
        let timestamp = cursor.i64()?;
        let server_len = usize::from(cursor.u16()?);
        let server_id = std::str::from_utf8(cursor.take(server_len)?)
            .map_err(|e| DecodeError::Malformed(format!("server id is not UTF-8: {e}")))?
            .to_string();
        if cursor.remaining() != 0 {
            return Err(DecodeError::Malformed(format!(
                "{} trailing header bytes",
                cursor.remaining()
            )));
        }

        Ok(Self {
            tag,
            payload_version,
            commit: flags & FLAG_COMMIT != 0,
            mailbox_id,
            txn_id: TransactionId::new(txn_time, txn_counter),
            timestamp,
            server_id,
        })
    }
}

/// Encodes a started record as one complete frame.
///
/// # Errors
///
/// Returns [`Error::Codec`] if the record was never started or cannot be serialized.
pub fn encode_record(record: &RedoRecord) -> Result<Vec<u8>> {
    let header = RecordHeader::of(record)?.encode()?;
    let payload = record
        .op()
        .encode_payload()
        .map_err(|e| Error::Codec(format!("failed to serialize {}: {e}", record.op().name())))?;

    let header_len = frame_len(header.len())?;
    let payload_len = frame_len(payload.len())?;

    let mut frame = Vec::with_capacity(8 + header.len() + payload.len());
    frame.extend_from_slice(&header_len.to_le_bytes());
    frame.extend_from_slice(&header);
    frame.extend_from_slice(&payload_len.to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

fn frame_len(len: usize) -> Result<u32> {
    u32::try_from(len)
        .ok()
        .filter(|l| *l <= MAX_FRAME_LEN)
        .ok_or_else(|| Error::Codec(format!("frame section of {len} bytes exceeds limit")))
}

/// Rebuilds a record from a decoded header and its payload bytes.
pub fn decode_record(
    header: &RecordHeader,
    payload: &[u8],
) -> std::result::Result<RedoRecord, DecodeError> {
    let op = RedoOp::decode_payload(header.tag, header.payload_version, payload)?;
    Ok(RedoRecord::from_parts(
        header.mailbox_id,
        header.server_id.clone(),
        header.txn_id,
        header.timestamp,
        header.commit,
        op,
    ))
}

/// Minimal little-endian reader over a byte slice.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> std::result::Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::Malformed(format!(
                "header needs {n} more bytes, {} left",
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> std::result::Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> std::result::Result<u8, DecodeError> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> std::result::Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> std::result::Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn i32(&mut self) -> std::result::Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    fn i64(&mut self) -> std::result::Result<i64, DecodeError> {
        Ok(i64::from_le_bytes(self.array()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{DeliverMessage, RecordState, UNSET_MAILBOX};

    fn delivered() -> RedoRecord {
        let mut record = RedoRecord::new(
            42,
            RedoOp::DeliverMessage(DeliverMessage {
                folder_id: 2,
                message_id: 300,
                size: 4096,
                digest: "fUlWqV2F1v4HSkfHbaCwYQ".to_string(),
                flags: 0,
                received_ms: 1_700_000_000_000,
            }),
        )
        .with_server_id("mbs-1");
        record.start(TransactionId::new(1_700_000_000, 9), 1_700_000_000_001);
        record
    }

    #[test]
    fn test_segment_header_layout() {
        let header = SegmentHeader::new(17, 1_700_000_000_000);
        let bytes = header.encode();
        assert_eq!(&bytes[0..4], b"ZRDO");
        assert_eq!(&bytes[4..8], &1u32.to_le_bytes());
        assert_eq!(&bytes[16..24], &17i64.to_le_bytes());
        assert_eq!(&bytes[24..28], &[0, 0, 0, 0]);
        assert_eq!(SegmentHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn test_segment_header_rejects_bad_input() {
        let mut bytes = SegmentHeader::new(1, 0).encode();
        assert!(SegmentHeader::decode(&bytes[..10]).is_err());

        bytes[4] = 9;
        assert!(matches!(SegmentHeader::decode(&bytes), Err(Error::Codec(_))));

        bytes[0] = b'X';
        assert!(matches!(SegmentHeader::decode(&bytes), Err(Error::Codec(_))));
    }

    #[test]
    fn test_frame_layout() {
        let record = delivered();
        let frame = encode_record(&record).unwrap();

        let header_len = u32::from_le_bytes(frame[0..4].try_into().unwrap()) as usize;
        assert_eq!(header_len, FIXED_HEADER_LEN + "mbs-1".len());
        // tag
        assert_eq!(&frame[4..6], &3u16.to_le_bytes());

        let header = RecordHeader::decode(&frame[4..4 + header_len]).unwrap();
        assert_eq!(header.server_id, "mbs-1");
        assert_eq!(header.mailbox_id, 42);
        assert_eq!(header.txn_id, TransactionId::new(1_700_000_000, 9));
        assert!(!header.commit);

        let payload_start = 4 + header_len + 4;
        let payload_len =
            u32::from_le_bytes(frame[4 + header_len..payload_start].try_into().unwrap()) as usize;
        assert_eq!(frame.len(), payload_start + payload_len);

        let decoded = decode_record(&header, &frame[payload_start..]).unwrap();
        assert_eq!(decoded.op(), record.op());
        assert_eq!(decoded.state(), RecordState::Logged);
    }

    #[test]
    fn test_commit_flag_and_unset_mailbox() {
        let mut record = RedoRecord::new(UNSET_MAILBOX, delivered().op().clone());
        record.start(TransactionId::new(1, 1), 10);
        record.set_commit(true);

        let header = RecordHeader::of(&record).unwrap();
        let decoded = RecordHeader::decode(&header.encode().unwrap()).unwrap();
        assert!(decoded.commit);
        assert_eq!(decoded.mailbox_id, UNSET_MAILBOX);
        assert_eq!(decoded.server_id, "");
    }

    #[test]
    fn test_unstarted_record_cannot_be_encoded() {
        let record = RedoRecord::new(1, delivered().op().clone());
        assert!(matches!(encode_record(&record), Err(Error::Codec(_))));
    }

    #[test]
    fn test_header_decode_rejects_trailing_bytes() {
        let mut bytes = RecordHeader::of(&delivered()).unwrap().encode().unwrap();
        bytes.push(0);
        assert!(matches!(RecordHeader::decode(&bytes), Err(DecodeError::Malformed(_))));
        assert!(matches!(RecordHeader::decode(&bytes[..5]), Err(DecodeError::Malformed(_))));
    }
}
