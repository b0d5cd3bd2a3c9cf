//! Journal record framing.
//!
//! On disk each record is `lsn u64 | txn_id u64 | kind u8 | len u32 |
//! payload | crc32 u32` (little-endian, crc over everything before it).
//! Payloads are postcard-encoded and carry the state needed to redo the
//! operation and to undo it if its transaction never committed.

use serde::{Deserialize, Serialize};

use crate::error::{FsError, Result};

/// Fixed part of a frame: lsn + txn + kind + len.
pub const FRAME_PREFIX_LEN: usize = 8 + 8 + 1 + 4;
pub const FRAME_CRC_LEN: usize = 4;

/// Payloads above this size are spilled to a sidecar file keyed by LSN.
pub const BLOB_SPILL_THRESHOLD: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    Begin = 1,
    Insert = 2,
    Delete = 3,
    UpdateMeta = 4,
    WriteData = 5,
    Rename = 6,
    XattrSet = 7,
    XattrDel = 8,
    Hardlink = 9,
    Commit = 10,
    Abort = 11,
    Checkpoint = 12,
}

impl RecordKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::Begin,
            2 => Self::Insert,
            3 => Self::Delete,
            4 => Self::UpdateMeta,
            5 => Self::WriteData,
            6 => Self::Rename,
            7 => Self::XattrSet,
            8 => Self::XattrDel,
            9 => Self::Hardlink,
            10 => Self::Commit,
            11 => Self::Abort,
            12 => Self::Checkpoint,
            _ => return None,
        })
    }
}

/// A data payload either carried inline or spilled to `wal_blob_<lsn>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Blob {
    Inline(Vec<u8>),
    /// The bytes live in the sidecar file for this record's LSN.
    Spilled { len: u64 },
}

impl Blob {
    pub fn len(&self) -> u64 {
        match self {
            Blob::Inline(bytes) => bytes.len() as u64,
            Blob::Spilled { len } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    Begin,
    Insert {
        parent: u16,
        new_idx: u16,
        inode: u32,
        name_offset: u32,
        mode: u16,
        mtime: u32,
    },
    Delete {
        parent: u16,
        child: u16,
        prior_position: u16,
    },
    UpdateMeta {
        idx: u16,
        mode: u16,
        size: u64,
        mtime: u32,
        prior_mode: u16,
        prior_size: u64,
        prior_mtime: u32,
    },
    WriteData {
        inode: u32,
        offset: u64,
        length: u64,
        compressed: bool,
        blob: Blob,
        /// Overwritten range (clipped to the prior size) plus the prior
        /// size, for compensation.
        prior: Blob,
        prior_size: u64,
    },
    Rename {
        src_parent: u16,
        dst_parent: u16,
        child: u16,
        src_name_offset: u32,
        dst_name_offset: u32,
        prior_position: u16,
        /// Set for EXCHANGE: the entry swapped with `child`.
        exchange_with: Option<u16>,
        /// Set when an existing destination entry was replaced.
        replaced: Option<u16>,
    },
    XattrSet {
        inode: u32,
        name: String,
        value: Vec<u8>,
        prior: Option<Vec<u8>>,
    },
    XattrDel {
        inode: u32,
        name: String,
        prior: Option<Vec<u8>>,
    },
    Hardlink {
        src_idx: u16,
        new_idx: u16,
        dst_parent: u16,
        inode: u32,
        name_offset: u32,
    },
    Commit,
    Abort,
    Checkpoint,
}

impl Payload {
    pub fn kind(&self) -> RecordKind {
        match self {
            Payload::Begin => RecordKind::Begin,
            Payload::Insert { .. } => RecordKind::Insert,
            Payload::Delete { .. } => RecordKind::Delete,
            Payload::UpdateMeta { .. } => RecordKind::UpdateMeta,
            Payload::WriteData { .. } => RecordKind::WriteData,
            Payload::Rename { .. } => RecordKind::Rename,
            Payload::XattrSet { .. } => RecordKind::XattrSet,
            Payload::XattrDel { .. } => RecordKind::XattrDel,
            Payload::Hardlink { .. } => RecordKind::Hardlink,
            Payload::Commit => RecordKind::Commit,
            Payload::Abort => RecordKind::Abort,
            Payload::Checkpoint => RecordKind::Checkpoint,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub lsn: u64,
    pub txn_id: u64,
    pub payload: Payload,
}

impl Record {
    /// Appends the framed record to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<()> {
        let payload = postcard::to_stdvec(&self.payload)
            .map_err(|err| FsError::Corrupted(format!("payload encode: {err}")))?;
        let start = out.len();
        out.extend_from_slice(&self.lsn.to_le_bytes());
        out.extend_from_slice(&self.txn_id.to_le_bytes());
        out.push(self.payload.kind() as u8);
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&payload);
        let crc = crc32fast::hash(&out[start..]);
        out.extend_from_slice(&crc.to_le_bytes());
        Ok(())
    }
}

/// Result of pulling one frame off a journal buffer.
#[derive(Debug)]
pub enum Frame {
    /// A whole valid record and the bytes it consumed.
    Record(Record, usize),
    /// Truncated length or failed CRC: the torn tail. Scanning stops here.
    Torn,
    /// A frame with a valid CRC whose payload does not decode. Fatal once
    /// past analysis.
    Undecodable { lsn: u64, reason: String },
}

/// Decodes the frame at the start of `buf`. `buf` empty means a clean end
/// and returns `None`.
pub fn decode_frame(buf: &[u8]) -> Option<Frame> {
    if buf.is_empty() {
        return None;
    }
    if buf.len() < FRAME_PREFIX_LEN + FRAME_CRC_LEN {
        return Some(Frame::Torn);
    }
    let lsn = u64::from_le_bytes(buf[0..8].try_into().unwrap());
    let txn_id = u64::from_le_bytes(buf[8..16].try_into().unwrap());
    let kind_raw = buf[16];
    let len = u32::from_le_bytes(buf[17..21].try_into().unwrap()) as usize;
    let total = FRAME_PREFIX_LEN + len + FRAME_CRC_LEN;
    if buf.len() < total {
        return Some(Frame::Torn);
    }
    let body = &buf[..FRAME_PREFIX_LEN + len];
    let stored_crc = u32::from_le_bytes(
        buf[FRAME_PREFIX_LEN + len..total].try_into().unwrap(),
    );
    if crc32fast::hash(body) != stored_crc {
        return Some(Frame::Torn);
    }

    // Valid CRC makes the record authoritative; any decode problem past
    // this point is corruption, not a torn tail.
    let payload: Payload = match postcard::from_bytes(&buf[FRAME_PREFIX_LEN..FRAME_PREFIX_LEN + len])
    {
        Ok(payload) => payload,
        Err(err) => {
            return Some(Frame::Undecodable {
                lsn,
                reason: format!("payload decode: {err}"),
            })
        }
    };
    match RecordKind::from_u8(kind_raw) {
        Some(kind) if kind == payload.kind() => {}
        _ => {
            return Some(Frame::Undecodable {
                lsn,
                reason: format!("kind byte {kind_raw} does not match payload"),
            })
        }
    }
    Some(Frame::Record(Record { lsn, txn_id, payload }, total))
}
