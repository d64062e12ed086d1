//! WAL record types and their on-disk framing.
//!
//! Frame layout (little-endian):
//!
//! ```text
//! [kind:u8][op_id:u64, operation kinds only][payload_len:u32][payload][crc32:u32]
//! ```
//!
//! The CRC covers the kind tag, the operation id and the payload.

use bytes::{BufMut, BytesMut};

use crate::atomic::OperationId;
use crate::recovery::page_operation::PageOperationRecord;
use crate::storage::codec::{self, Decoder};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::wal::Lsn;

/// Largest payload a frame may carry. Appends above it are refused and
/// frames claiming more are treated as garbage.
pub const MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    AtomicOperationStart = 1,
    AtomicOperationCommit = 2,
    AtomicOperationRollback = 3,
    PageOperation = 4,
    ComponentOperation = 5,
    Checkpoint = 6,
}

impl RecordKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::AtomicOperationStart),
            2 => Some(Self::AtomicOperationCommit),
            3 => Some(Self::AtomicOperationRollback),
            4 => Some(Self::PageOperation),
            5 => Some(Self::ComponentOperation),
            6 => Some(Self::Checkpoint),
            _ => None,
        }
    }

    /// Whether frames of this kind carry an operation id.
    fn has_op_id(self) -> bool {
        self != RecordKind::Checkpoint
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    AtomicOperationStart {
        op_id: OperationId,
    },
    AtomicOperationCommit {
        op_id: OperationId,
        /// Wall-clock milliseconds since the Unix epoch.
        commit_timestamp: u64,
    },
    AtomicOperationRollback {
        op_id: OperationId,
    },
    PageOperation(PageOperationRecord),
    /// Opaque logical record of a higher-level component.
    ComponentOperation {
        op_id: OperationId,
        component: String,
        payload: Vec<u8>,
    },
    Checkpoint {
        redo_lsn: Lsn,
    },
}

/// A record together with the LSN it was assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalEntry {
    pub lsn: Lsn,
    pub record: WalRecord,
}

impl WalRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            WalRecord::AtomicOperationStart { .. } => RecordKind::AtomicOperationStart,
            WalRecord::AtomicOperationCommit { .. } => RecordKind::AtomicOperationCommit,
            WalRecord::AtomicOperationRollback { .. } => RecordKind::AtomicOperationRollback,
            WalRecord::PageOperation(_) => RecordKind::PageOperation,
            WalRecord::ComponentOperation { .. } => RecordKind::ComponentOperation,
            WalRecord::Checkpoint { .. } => RecordKind::Checkpoint,
        }
    }

    pub fn op_id(&self) -> Option<OperationId> {
        match self {
            WalRecord::AtomicOperationStart { op_id }
            | WalRecord::AtomicOperationCommit { op_id, .. }
            | WalRecord::AtomicOperationRollback { op_id }
            | WalRecord::ComponentOperation { op_id, .. } => Some(*op_id),
            WalRecord::PageOperation(record) => Some(record.op_id),
            WalRecord::Checkpoint { .. } => None,
        }
    }

    fn encode_payload(&self, buf: &mut BytesMut) {
        match self {
            WalRecord::AtomicOperationStart { .. } | WalRecord::AtomicOperationRollback { .. } => {}
            WalRecord::AtomicOperationCommit {
                commit_timestamp, ..
            } => buf.put_u64_le(*commit_timestamp),
            WalRecord::PageOperation(record) => record.encode(buf),
            WalRecord::ComponentOperation {
                component, payload, ..
            } => {
                codec::put_string(buf, component);
                codec::put_bytes(buf, payload);
            }
            WalRecord::Checkpoint { redo_lsn } => codec::put_lsn(buf, *redo_lsn),
        }
    }

    fn decode_payload(
        kind: RecordKind,
        op_id: OperationId,
        payload: &[u8],
    ) -> StorageResult<Self> {
        let mut decoder = Decoder::new(payload);
        let record = match kind {
            RecordKind::AtomicOperationStart => WalRecord::AtomicOperationStart { op_id },
            RecordKind::AtomicOperationCommit => WalRecord::AtomicOperationCommit {
                op_id,
                commit_timestamp: decoder.read_u64()?,
            },
            RecordKind::AtomicOperationRollback => WalRecord::AtomicOperationRollback { op_id },
            RecordKind::PageOperation => {
                WalRecord::PageOperation(PageOperationRecord::decode(op_id, &mut decoder)?)
            }
            RecordKind::ComponentOperation => WalRecord::ComponentOperation {
                op_id,
                component: decoder.read_string()?,
                payload: decoder.read_bytes()?,
            },
            RecordKind::Checkpoint => WalRecord::Checkpoint {
                redo_lsn: decoder.read_lsn()?,
            },
        };
        decoder.finish()?;
        Ok(record)
    }

    /// Serialize the record into a complete frame. Fails with
    /// [`StorageError::RecordTooLarge`] if the payload could not be read
    /// back by [`decode_frame`](WalRecord::decode_frame).
    pub fn encode(&self) -> StorageResult<BytesMut> {
        let mut payload = BytesMut::new();
        self.encode_payload(&mut payload);
        let payload_len = match u32::try_from(payload.len()) {
            Ok(len) if len <= MAX_PAYLOAD_SIZE => len,
            _ => {
                return Err(StorageError::RecordTooLarge {
                    size: payload.len(),
                    limit: MAX_PAYLOAD_SIZE as usize,
                })
            }
        };

        let kind = self.kind();
        let mut frame = BytesMut::with_capacity(payload.len() + 17);
        frame.put_u8(kind as u8);
        if let Some(op_id) = self.op_id() {
            frame.put_u64_le(op_id.value());
        }
        frame.put_u32_le(payload_len);
        frame.put_slice(&payload);
        frame.put_u32_le(frame_crc(kind as u8, self.op_id(), &payload));
        Ok(frame)
    }

    /// Decode one frame from the start of `input`.
    ///
    /// Returns `Ok(None)` when the input holds a partial frame, garbage or a
    /// frame whose CRC does not match; the caller treats that as the end of
    /// the durable log. A frame with a valid CRC whose payload cannot be
    /// decoded is reported as [`StorageError::MalformedRecord`].
    pub fn decode_frame(lsn: Lsn, input: &[u8]) -> StorageResult<Option<(WalRecord, usize)>> {
        let mut decoder = Decoder::new(input);
        let Ok(tag) = decoder.read_u8() else {
            return Ok(None);
        };
        let Some(kind) = RecordKind::from_u8(tag) else {
            return Ok(None);
        };
        let op_id = if kind.has_op_id() {
            match decoder.read_u64() {
                Ok(id) => Some(OperationId::new(id)),
                Err(_) => return Ok(None),
            }
        } else {
            None
        };
        let len = match decoder.read_u32() {
            Ok(len) if len <= MAX_PAYLOAD_SIZE => len as usize,
            _ => return Ok(None),
        };
        let Ok(payload) = decoder.read_slice(len) else {
            return Ok(None);
        };
        let Ok(stored_crc) = decoder.read_u32() else {
            return Ok(None);
        };
        if stored_crc != frame_crc(tag, op_id, payload) {
            return Ok(None);
        }

        let record = Self::decode_payload(kind, op_id.unwrap_or(OperationId::new(0)), payload)
            .map_err(|e| StorageError::MalformedRecord {
                lsn,
                reason: e.to_string(),
            })?;
        let frame_len = input.len() - decoder.remaining();
        Ok(Some((record, frame_len)))
    }
}

fn frame_crc(kind: u8, op_id: Option<OperationId>, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[kind]);
    if let Some(op_id) = op_id {
        hasher.update(&op_id.value().to_le_bytes());
    }
    hasher.update(payload);
    hasher.finalize()
}
