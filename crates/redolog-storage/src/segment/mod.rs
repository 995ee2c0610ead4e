//! Segment files.
//!
//! A segment is one append-only file: a fixed header (format version,
//! creation time, log sequence number) followed by record frames up to EOF.
//! There is no end marker; a reader treats a frame cut short by EOF as never
//! written.

mod reader;
mod writer;

pub use reader::{SegmentEntry, SegmentReader};
pub use writer::{corrupt_sidecar_path, SegmentWriter};
