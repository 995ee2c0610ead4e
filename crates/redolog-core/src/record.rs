//! Redo record types.
//!
//! A [`RedoRecord`] is the envelope every mutating mailbox operation is logged
//! in. The envelope carries the header fields (mailbox, origin server,
//! transaction id, start timestamp, commit flag); the operation itself is one
//! variant of the closed [`RedoOp`] set.
//!
//! Operation variants follow a log/commit pattern:
//! - Operations are logged BEFORE their effect is applied
//! - A `CommitTxn` marker (or the commit flag) records that the effect is durable
//! - An `AbortTxn` marker records that the effect was discarded
//!
//! During crash recovery, an operation without a matching commit or abort is
//! replayed.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;
use crate::txn::TransactionId;

/// Mailbox id used for records that are not tied to a mailbox.
pub const UNSET_MAILBOX: i64 = -1;

/// Payload version written by this build.
pub const PAYLOAD_VERSION: u16 = 1;

/// Operation kind with its stable wire tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum OpKind {
    /// Create a folder.
    CreateFolder = 1,
    /// Rename a folder.
    RenameFolder = 2,
    /// Deliver a message into a folder.
    DeliverMessage = 3,
    /// Replace the flags of a set of items.
    SetItemFlags = 4,
    /// Move items into another folder.
    MoveItems = 5,
    /// Delete items.
    DeleteItems = 6,
    /// Change the retention policy of a folder.
    SetRetentionPolicy = 7,
    /// Commit marker for an earlier operation.
    CommitTxn = 100,
    /// Abort marker for an earlier operation.
    AbortTxn = 101,
    /// Checkpoint listing transactions still active at rollover.
    Checkpoint = 102,
}

impl OpKind {
    /// Returns the wire tag.
    #[must_use]
    pub const fn tag(self) -> u16 {
        self as u16
    }

    /// Looks up an operation kind by wire tag.
    #[must_use]
    pub const fn from_tag(tag: u16) -> Option<Self> {
        Some(match tag {
            1 => Self::CreateFolder,
            2 => Self::RenameFolder,
            3 => Self::DeliverMessage,
            4 => Self::SetItemFlags,
            5 => Self::MoveItems,
            6 => Self::DeleteItems,
            7 => Self::SetRetentionPolicy,
            100 => Self::CommitTxn,
            101 => Self::AbortTxn,
            102 => Self::Checkpoint,
            _ => return None,
        })
    }

    /// Returns the operation name used in diagnostic output.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::CreateFolder => "CreateFolder",
            Self::RenameFolder => "RenameFolder",
            Self::DeliverMessage => "DeliverMessage",
            Self::SetItemFlags => "SetItemFlags",
            Self::MoveItems => "MoveItems",
            Self::DeleteItems => "DeleteItems",
            Self::SetRetentionPolicy => "SetRetentionPolicy",
            Self::CommitTxn => "CommitTxn",
            Self::AbortTxn => "AbortTxn",
            Self::Checkpoint => "Checkpoint",
        }
    }

    /// Returns true for transaction markers, which carry no mailbox effect.
    #[must_use]
    pub const fn is_marker(self) -> bool {
        matches!(self, Self::CommitTxn | Self::AbortTxn | Self::Checkpoint)
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Payload of [`RedoOp::CreateFolder`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateFolder {
    /// Id of the new folder.
    pub folder_id: i32,
    /// Id of the parent folder.
    pub parent_id: i32,
    /// Folder name.
    pub name: String,
    /// Default view type.
    pub default_view: u8,
}

/// Payload of [`RedoOp::RenameFolder`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameFolder {
    /// Folder being renamed.
    pub folder_id: i32,
    /// New name.
    pub name: String,
}

/// Payload of [`RedoOp::DeliverMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliverMessage {
    /// Destination folder.
    pub folder_id: i32,
    /// Id assigned to the message.
    pub message_id: i32,
    /// Message size in bytes.
    pub size: u64,
    /// Content digest of the message blob.
    pub digest: String,
    /// Initial flags.
    pub flags: u32,
    /// Time the message was received (milliseconds since epoch).
    pub received_ms: i64,
}

/// Payload of [`RedoOp::SetItemFlags`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetItemFlags {
    /// Items to update.
    pub item_ids: Vec<i32>,
    /// New flag bits.
    pub flags: u32,
}

/// Payload of [`RedoOp::MoveItems`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveItems {
    /// Items to move.
    pub item_ids: Vec<i32>,
    /// Destination folder.
    pub target_folder_id: i32,
}

/// Payload of [`RedoOp::DeleteItems`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteItems {
    /// Items to delete.
    pub item_ids: Vec<i32>,
}

/// Payload of [`RedoOp::SetRetentionPolicy`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetRetentionPolicy {
    /// Folder the policy applies to.
    pub folder_id: i32,
    /// Days to keep items before they become eligible for purge.
    pub keep_days: u32,
    /// Days after which items are purged.
    pub purge_days: u32,
}

/// Payload of [`RedoOp::CommitTxn`] and [`RedoOp::AbortTxn`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnMarker {
    /// Wire tag of the operation being committed or aborted.
    pub target_tag: u16,
}

/// Payload of [`RedoOp::Checkpoint`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Transactions logged but neither committed nor aborted, in log order.
    pub active_txns: Vec<TransactionId>,
}

/// The closed set of redo operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedoOp {
    /// See [`CreateFolder`].
    CreateFolder(CreateFolder),
    /// See [`RenameFolder`].
    RenameFolder(RenameFolder),
    /// See [`DeliverMessage`].
    DeliverMessage(DeliverMessage),
    /// See [`SetItemFlags`].
    SetItemFlags(SetItemFlags),
    /// See [`MoveItems`].
    MoveItems(MoveItems),
    /// See [`DeleteItems`].
    DeleteItems(DeleteItems),
    /// See [`SetRetentionPolicy`].
    SetRetentionPolicy(SetRetentionPolicy),
    /// Commit marker.
    CommitTxn(TxnMarker),
    /// Abort marker.
    AbortTxn(TxnMarker),
    /// Rollover checkpoint.
    Checkpoint(Checkpoint),
}

impl RedoOp {
    /// Returns the operation kind.
    #[must_use]
    pub const fn kind(&self) -> OpKind {
        match self {
            Self::CreateFolder(_) => OpKind::CreateFolder,
            Self::RenameFolder(_) => OpKind::RenameFolder,
            Self::DeliverMessage(_) => OpKind::DeliverMessage,
            Self::SetItemFlags(_) => OpKind::SetItemFlags,
            Self::MoveItems(_) => OpKind::MoveItems,
            Self::DeleteItems(_) => OpKind::DeleteItems,
            Self::SetRetentionPolicy(_) => OpKind::SetRetentionPolicy,
            Self::CommitTxn(_) => OpKind::CommitTxn,
            Self::AbortTxn(_) => OpKind::AbortTxn,
            Self::Checkpoint(_) => OpKind::Checkpoint,
        }
    }

    /// Returns the operation name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// Returns the operation-specific fields as `key=value` pairs.
    #[must_use]
    pub fn key_fields(&self) -> String {
        match self {
            Self::CreateFolder(p) => format!(
                "folder={} parent={} folderName={:?} view={}",
                p.folder_id, p.parent_id, p.name, p.default_view
            ),
            Self::RenameFolder(p) => format!("folder={} folderName={:?}", p.folder_id, p.name),
            Self::DeliverMessage(p) => format!(
                "folder={} message={} size={} digest={} flags={:#x}",
                p.folder_id, p.message_id, p.size, p.digest, p.flags
            ),
            Self::SetItemFlags(p) => {
                format!("items={} flags={:#x}", join_ids(&p.item_ids), p.flags)
            }
            Self::MoveItems(p) => {
                format!("items={} target={}", join_ids(&p.item_ids), p.target_folder_id)
            }
            Self::DeleteItems(p) => format!("items={}", join_ids(&p.item_ids)),
            Self::SetRetentionPolicy(p) => {
                format!("folder={} keep={}d purge={}d", p.folder_id, p.keep_days, p.purge_days)
            }
            Self::CommitTxn(m) | Self::AbortTxn(m) => {
                let target = OpKind::from_tag(m.target_tag).map_or("Unknown", OpKind::name);
                format!("target={target}")
            }
            Self::Checkpoint(c) => {
                let txns: Vec<String> = c.active_txns.iter().map(ToString::to_string).collect();
                format!("active=[{}]", txns.join(","))
            }
        }
    }

    /// Serializes the payload bytes of this operation.
    pub fn encode_payload(&self) -> bincode::Result<Vec<u8>> {
        match self {
            Self::CreateFolder(p) => bincode::serialize(p),
            Self::RenameFolder(p) => bincode::serialize(p),
            Self::DeliverMessage(p) => bincode::serialize(p),
            Self::SetItemFlags(p) => bincode::serialize(p),
            Self::MoveItems(p) => bincode::serialize(p),
            Self::DeleteItems(p) => bincode::serialize(p),
            Self::SetRetentionPolicy(p) => bincode::serialize(p),
            Self::CommitTxn(m) | Self::AbortTxn(m) => bincode::serialize(m),
            Self::Checkpoint(c) => bincode::serialize(c),
        }
    }

    /// Decodes a payload for the given wire tag and payload version.
    ///
    /// The tag selects the decode routine; nothing is instantiated from names
    /// stored in the stream.
    pub fn decode_payload(tag: u16, version: u16, bytes: &[u8]) -> Result<Self, DecodeError> {
        let kind = OpKind::from_tag(tag).ok_or(DecodeError::UnknownOperation(tag))?;
        if version != PAYLOAD_VERSION {
            return Err(DecodeError::UnsupportedVersion { name: kind.name(), version });
        }
        Ok(match kind {
            OpKind::CreateFolder => Self::CreateFolder(decode(bytes)?),
            OpKind::RenameFolder => Self::RenameFolder(decode(bytes)?),
            OpKind::DeliverMessage => Self::DeliverMessage(decode(bytes)?),
            OpKind::SetItemFlags => Self::SetItemFlags(decode(bytes)?),
            OpKind::MoveItems => Self::MoveItems(decode(bytes)?),
            OpKind::DeleteItems => Self::DeleteItems(decode(bytes)?),
            OpKind::SetRetentionPolicy => Self::SetRetentionPolicy(decode(bytes)?),
            OpKind::CommitTxn => Self::CommitTxn(decode(bytes)?),
            OpKind::AbortTxn => Self::AbortTxn(decode(bytes)?),
            OpKind::Checkpoint => Self::Checkpoint(decode(bytes)?),
        })
    }
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, DecodeError> {
    bincode::deserialize(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))
}

fn join_ids(ids: &[i32]) -> String {
    ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(",")
}

/// Where a record is in its lifecycle.
///
/// `Constructed -> Started -> Logged -> Committed | Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordState {
    /// Fields set, no transaction id yet.
    #[default]
    Constructed,
    /// Transaction id and start timestamp assigned.
    Started,
    /// Appended to the active segment.
    Logged,
    /// Effect applied and acknowledged.
    Committed,
    /// Effect discarded.
    Aborted,
}

/// A single entry in the redo log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedoRecord {
    mailbox_id: i64,
    server_id: Option<String>,
    txn_id: Option<TransactionId>,
    timestamp: Option<i64>,
    commit: bool,
    op: RedoOp,
    state: RecordState,
}

impl RedoRecord {
    /// Creates a record for an operation on a mailbox.
    #[must_use]
    pub fn new(mailbox_id: i64, op: RedoOp) -> Self {
        Self {
            mailbox_id,
            server_id: None,
            txn_id: None,
            timestamp: None,
            commit: false,
            op,
            state: RecordState::Constructed,
        }
    }

    /// Creates the commit marker for `target`.
    ///
    /// The marker shares the target's mailbox, server and transaction id.
    #[must_use]
    pub fn commit_marker(target: &Self, timestamp: i64) -> Self {
        let marker = TxnMarker { target_tag: target.op.kind().tag() };
        Self::marker_for(target, RedoOp::CommitTxn(marker), timestamp)
    }

    /// Creates the abort marker for `target`.
    #[must_use]
    pub fn abort_marker(target: &Self, timestamp: i64) -> Self {
        let marker = TxnMarker { target_tag: target.op.kind().tag() };
        Self::marker_for(target, RedoOp::AbortTxn(marker), timestamp)
    }

    fn marker_for(target: &Self, op: RedoOp, timestamp: i64) -> Self {
        Self {
            mailbox_id: target.mailbox_id,
            server_id: target.server_id.clone(),
            txn_id: target.txn_id,
            timestamp: Some(timestamp),
            commit: false,
            op,
            state: if target.txn_id.is_some() {
                RecordState::Started
            } else {
                RecordState::Constructed
            },
        }
    }

    /// Rebuilds a record read back from a segment.
    #[must_use]
    pub fn from_parts(
        mailbox_id: i64,
        server_id: String,
        txn_id: TransactionId,
        timestamp: i64,
        commit: bool,
        op: RedoOp,
    ) -> Self {
        Self {
            mailbox_id,
            server_id: Some(server_id),
            txn_id: Some(txn_id),
            timestamp: Some(timestamp),
            commit,
            op,
            state: if commit { RecordState::Committed } else { RecordState::Logged },
        }
    }

    /// Assigns the transaction id and start timestamp.
    pub fn start(&mut self, txn_id: TransactionId, timestamp: i64) {
        self.txn_id = Some(txn_id);
        self.timestamp = Some(timestamp);
        self.state = RecordState::Started;
    }

    /// Returns true once a transaction id has been assigned.
    #[must_use]
    pub const fn is_started(&self) -> bool {
        self.txn_id.is_some() && self.timestamp.is_some()
    }

    /// Sets the origin server id.
    pub fn set_server_id(&mut self, server_id: impl Into<String>) {
        self.server_id = Some(server_id.into());
    }

    /// Builder-style variant of [`Self::set_server_id`].
    #[must_use]
    pub fn with_server_id(mut self, server_id: impl Into<String>) -> Self {
        self.set_server_id(server_id);
        self
    }

    /// Sets the commit flag carried in the record header.
    pub fn set_commit(&mut self, commit: bool) {
        self.commit = commit;
    }

    /// Moves the record to a new lifecycle state.
    pub fn set_state(&mut self, state: RecordState) {
        self.state = state;
    }

    /// Returns the mailbox id.
    #[must_use]
    pub const fn mailbox_id(&self) -> i64 {
        self.mailbox_id
    }

    /// Returns the origin server id, if set.
    #[must_use]
    pub fn server_id(&self) -> Option<&str> {
        self.server_id.as_deref()
    }

    /// Returns the transaction id, if started.
    #[must_use]
    pub const fn txn_id(&self) -> Option<TransactionId> {
        self.txn_id
    }

    /// Returns the start timestamp (milliseconds since epoch), if started.
    #[must_use]
    pub const fn timestamp(&self) -> Option<i64> {
        self.timestamp
    }

    /// Returns the commit flag.
    #[must_use]
    pub const fn is_commit(&self) -> bool {
        self.commit
    }

    /// Returns the operation.
    #[must_use]
    pub const fn op(&self) -> &RedoOp {
        &self.op
    }

    /// Returns the lifecycle state.
    #[must_use]
    pub const fn state(&self) -> RecordState {
        self.state
    }

    /// Returns true if this is a commit or abort marker, which ends a transaction.
    #[must_use]
    pub const fn is_end_marker(&self) -> bool {
        matches!(self.op, RedoOp::CommitTxn(_) | RedoOp::AbortTxn(_))
    }
}
