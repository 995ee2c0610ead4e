//! Commit identifiers.
//!
//! A [`CommitId`] is the "as-of" marker handed to replicas: the log sequence
//! number that was current when the commit was logged, plus the timestamp and
//! transaction id of the commit record. It only has meaning within the segment
//! sequence it was minted in.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::record::RedoRecord;
use crate::txn::{parse_dashed, TransactionId};

/// External marker of how far a consumer has replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitId {
    redo_seq: i64,
    op_timestamp: i64,
    txn_id: TransactionId,
}

impl CommitId {
    /// Creates a commit id from its parts.
    #[must_use]
    pub const fn new(redo_seq: i64, op_timestamp: i64, txn_id: TransactionId) -> Self {
        Self { redo_seq, op_timestamp, txn_id }
    }

    /// Mints a commit id for a logged commit record.
    ///
    /// Returns `None` if the record was never started.
    #[must_use]
    pub fn for_record(redo_seq: i64, record: &RedoRecord) -> Option<Self> {
        Some(Self::new(redo_seq, record.timestamp()?, record.txn_id()?))
    }

    /// Returns the log sequence number the commit was minted in.
    #[must_use]
    pub const fn redo_seq(&self) -> i64 {
        self.redo_seq
    }

    /// Returns the timestamp of the commit record.
    #[must_use]
    pub const fn op_timestamp(&self) -> i64 {
        self.op_timestamp
    }

    /// Returns the transaction id of the commit record.
    #[must_use]
    pub const fn txn_id(&self) -> TransactionId {
        self.txn_id
    }

    /// Returns true if `record` is the commit record this id was minted for.
    ///
    /// Unset fields on the record never match.
    #[must_use]
    pub fn matches(&self, record: &RedoRecord) -> bool {
        record.timestamp() == Some(self.op_timestamp) && record.txn_id() == Some(self.txn_id)
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}",
            self.redo_seq,
            self.op_timestamp,
            self.txn_id.time(),
            self.txn_id.counter()
        )
    }
}

impl FromStr for CommitId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || Error::InvalidCommitId(s.to_string());
        let parts = parse_dashed(s, 4).ok_or_else(bad)?;
        let counter = i32::try_from(parts[3]).map_err(|_| bad())?;
        Ok(Self::new(parts[0], parts[1], TransactionId::new(parts[2], counter)))
    }
}
