//! Typed page mutations carried by page-operation WAL records.
//!
//! Every mutation a component applies to a page payload is one of the
//! [`PageOperation`] variants. Each variant stores enough before-image data to
//! be reversed exactly, so `undo(redo(page)) == page` holds bit for bit.
//! Offsets are relative to the page payload (after the system header).
//!
//! Encoding: `[kind:u8][version:u8][fields...]`, little-endian, byte strings
//! length-prefixed with a `u32`.

use bytes::BufMut;

use crate::atomic::OperationId;
use crate::storage::codec::{self, Decoder};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::utils::{check_range, read_u64_at, write_u64_at};
use crate::storage::page::PageKey;
use crate::storage::wal::Lsn;

const KIND_WRITE_BYTES: u8 = 1;
const KIND_INSERT_BYTES: u8 = 2;
const KIND_REMOVE_BYTES: u8 = 3;
const KIND_ADD_TO_COUNTER: u8 = 4;
const KIND_FILL_BYTES: u8 = 5;

/// Current encoding version of every variant.
pub const PAGE_OPERATION_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOperation {
    /// Overwrite `after.len()` bytes at `offset`.
    WriteBytes {
        offset: u32,
        before: Vec<u8>,
        after: Vec<u8>,
    },
    /// Insert `data` at `offset` inside the region `offset..region_end`,
    /// shifting the rest of the region right. `displaced` holds the bytes
    /// pushed out past `region_end`.
    InsertBytes {
        offset: u32,
        region_end: u32,
        data: Vec<u8>,
        displaced: Vec<u8>,
    },
    /// Remove `removed.len()` bytes at `offset` from the region
    /// `offset..region_end`, shifting the rest left and zero filling the tail.
    RemoveBytes {
        offset: u32,
        region_end: u32,
        removed: Vec<u8>,
    },
    /// Wrapping add on the little-endian `u64` at `offset`.
    AddToCounter { offset: u32, delta: i64 },
    /// Set `before.len()` bytes at `offset` to `value`.
    FillBytes {
        offset: u32,
        value: u8,
        before: Vec<u8>,
    },
}

impl PageOperation {
    /// Build a `WriteBytes` capturing the current bytes of `payload`.
    pub fn write_bytes(payload: &[u8], offset: usize, data: &[u8]) -> StorageResult<Self> {
        let range = check_range(payload.len(), offset, data.len())?;
        Ok(PageOperation::WriteBytes {
            offset: offset as u32,
            before: payload[range].to_vec(),
            after: data.to_vec(),
        })
    }

    pub fn insert_bytes(
        payload: &[u8],
        offset: usize,
        region_end: usize,
        data: &[u8],
    ) -> StorageResult<Self> {
        let region = Self::region(payload.len(), offset, region_end, data.len())?;
        Ok(PageOperation::InsertBytes {
            offset: offset as u32,
            region_end: region_end as u32,
            data: data.to_vec(),
            displaced: payload[region.end - data.len()..region.end].to_vec(),
        })
    }

    pub fn remove_bytes(
        payload: &[u8],
        offset: usize,
        region_end: usize,
        len: usize,
    ) -> StorageResult<Self> {
        Self::region(payload.len(), offset, region_end, len)?;
        Ok(PageOperation::RemoveBytes {
            offset: offset as u32,
            region_end: region_end as u32,
            removed: payload[offset..offset + len].to_vec(),
        })
    }

    pub fn add_to_counter(payload: &[u8], offset: usize, delta: i64) -> StorageResult<Self> {
        check_range(payload.len(), offset, 8)?;
        Ok(PageOperation::AddToCounter {
            offset: offset as u32,
            delta,
        })
    }

    pub fn fill_bytes(payload: &[u8], offset: usize, len: usize, value: u8) -> StorageResult<Self> {
        let range = check_range(payload.len(), offset, len)?;
        Ok(PageOperation::FillBytes {
            offset: offset as u32,
            value,
            before: payload[range].to_vec(),
        })
    }

    /// Validate a shifting region `offset..region_end` that moves `len` bytes.
    fn region(
        size: usize,
        offset: usize,
        region_end: usize,
        len: usize,
    ) -> StorageResult<std::ops::Range<usize>> {
        if region_end < offset {
            return Err(StorageError::InvalidPageOperation(format!(
                "region end {} precedes offset {}",
                region_end, offset
            )));
        }
        let region = check_range(size, offset, region_end - offset)?;
        if len > region.len() {
            return Err(StorageError::InvalidPageOperation(format!(
                "{} bytes do not fit in region {}..{}",
                len, offset, region_end
            )));
        }
        Ok(region)
    }

    /// Apply the mutation to a page payload.
    pub fn redo(&self, payload: &mut [u8]) -> StorageResult<()> {
        match self {
            PageOperation::WriteBytes {
                offset,
                before,
                after,
            } => {
                if before.len() != after.len() {
                    return Err(StorageError::InvalidPageOperation(
                        "before and after images differ in length".into(),
                    ));
                }
                let range = check_range(payload.len(), *offset as usize, after.len())?;
                payload[range].copy_from_slice(after);
            }
            PageOperation::InsertBytes {
                offset,
                region_end,
                data,
                displaced,
            } => {
                let (offset, end, k) = (*offset as usize, *region_end as usize, data.len());
                Self::region(payload.len(), offset, end, k)?;
                Self::check_same_len(k, displaced.len())?;
                payload.copy_within(offset..end - k, offset + k);
                payload[offset..offset + k].copy_from_slice(data);
            }
            PageOperation::RemoveBytes {
                offset,
                region_end,
                removed,
            } => {
                let (offset, end, k) = (*offset as usize, *region_end as usize, removed.len());
                Self::region(payload.len(), offset, end, k)?;
                payload.copy_within(offset + k..end, offset);
                payload[end - k..end].fill(0);
            }
            PageOperation::AddToCounter { offset, delta } => {
                let value = read_u64_at(payload, *offset as usize)?;
                write_u64_at(payload, *offset as usize, value.wrapping_add(*delta as u64))?;
            }
            PageOperation::FillBytes {
                offset,
                value,
                before,
            } => {
                let range = check_range(payload.len(), *offset as usize, before.len())?;
                payload[range].fill(*value);
            }
        }
        Ok(())
    }

    /// Reverse the mutation on a payload it was previously applied to.
    pub fn undo(&self, payload: &mut [u8]) -> StorageResult<()> {
        match self {
            PageOperation::WriteBytes { offset, before, .. } => {
                let range = check_range(payload.len(), *offset as usize, before.len())?;
                payload[range].copy_from_slice(before);
            }
            PageOperation::InsertBytes {
                offset,
                region_end,
                data,
                displaced,
            } => {
                let (offset, end, k) = (*offset as usize, *region_end as usize, data.len());
                Self::region(payload.len(), offset, end, k)?;
                Self::check_same_len(k, displaced.len())?;
                payload.copy_within(offset + k..end, offset);
                payload[end - k..end].copy_from_slice(displaced);
            }
            PageOperation::RemoveBytes {
                offset,
                region_end,
                removed,
            } => {
                let (offset, end, k) = (*offset as usize, *region_end as usize, removed.len());
                Self::region(payload.len(), offset, end, k)?;
                payload.copy_within(offset..end - k, offset + k);
                payload[offset..offset + k].copy_from_slice(removed);
            }
            PageOperation::AddToCounter { offset, delta } => {
                let value = read_u64_at(payload, *offset as usize)?;
                write_u64_at(payload, *offset as usize, value.wrapping_sub(*delta as u64))?;
            }
            PageOperation::FillBytes { offset, before, .. } => {
                let range = check_range(payload.len(), *offset as usize, before.len())?;
                payload[range].copy_from_slice(before);
            }
        }
        Ok(())
    }

    fn check_same_len(expected: usize, actual: usize) -> StorageResult<()> {
        if expected != actual {
            return Err(StorageError::InvalidPageOperation(format!(
                "displaced image has {} bytes, expected {}",
                actual, expected
            )));
        }
        Ok(())
    }

    pub fn kind(&self) -> u8 {
        match self {
            PageOperation::WriteBytes { .. } => KIND_WRITE_BYTES,
            PageOperation::InsertBytes { .. } => KIND_INSERT_BYTES,
            PageOperation::RemoveBytes { .. } => KIND_REMOVE_BYTES,
            PageOperation::AddToCounter { .. } => KIND_ADD_TO_COUNTER,
            PageOperation::FillBytes { .. } => KIND_FILL_BYTES,
        }
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.kind());
        buf.put_u8(PAGE_OPERATION_VERSION);
        match self {
            PageOperation::WriteBytes {
                offset,
                before,
                after,
            } => {
                buf.put_u32_le(*offset);
                codec::put_bytes(buf, before);
                codec::put_bytes(buf, after);
            }
            PageOperation::InsertBytes {
                offset,
                region_end,
                data,
                displaced,
            } => {
                buf.put_u32_le(*offset);
                buf.put_u32_le(*region_end);
                codec::put_bytes(buf, data);
                codec::put_bytes(buf, displaced);
            }
            PageOperation::RemoveBytes {
                offset,
                region_end,
                removed,
            } => {
                buf.put_u32_le(*offset);
                buf.put_u32_le(*region_end);
                codec::put_bytes(buf, removed);
            }
            PageOperation::AddToCounter { offset, delta } => {
                buf.put_u32_le(*offset);
                buf.put_i64_le(*delta);
            }
            PageOperation::FillBytes {
                offset,
                value,
                before,
            } => {
                buf.put_u32_le(*offset);
                buf.put_u8(*value);
                codec::put_bytes(buf, before);
            }
        }
    }

    pub fn decode(decoder: &mut Decoder<'_>) -> StorageResult<Self> {
        let kind = decoder.read_u8()?;
        let version = decoder.read_u8()?;
        if version != PAGE_OPERATION_VERSION {
            return Err(StorageError::Serialization(format!(
                "unsupported page operation version {} for kind {}",
                version, kind
            )));
        }
        let operation = match kind {
            KIND_WRITE_BYTES => PageOperation::WriteBytes {
                offset: decoder.read_u32()?,
                before: decoder.read_bytes()?,
                after: decoder.read_bytes()?,
            },
            KIND_INSERT_BYTES => PageOperation::InsertBytes {
                offset: decoder.read_u32()?,
                region_end: decoder.read_u32()?,
                data: decoder.read_bytes()?,
                displaced: decoder.read_bytes()?,
            },
            KIND_REMOVE_BYTES => PageOperation::RemoveBytes {
                offset: decoder.read_u32()?,
                region_end: decoder.read_u32()?,
                removed: decoder.read_bytes()?,
            },
            KIND_ADD_TO_COUNTER => PageOperation::AddToCounter {
                offset: decoder.read_u32()?,
                delta: decoder.read_i64()?,
            },
            KIND_FILL_BYTES => PageOperation::FillBytes {
                offset: decoder.read_u32()?,
                value: decoder.read_u8()?,
                before: decoder.read_bytes()?,
            },
            other => {
                return Err(StorageError::Serialization(format!(
                    "unknown page operation kind {}",
                    other
                )))
            }
        };
        Ok(operation)
    }
}

/// A logged page mutation. When `compensates` is set this is a compensation
/// record written during rollback: replaying it applies the *undo* of its
/// operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageOperationRecord {
    pub op_id: OperationId,
    pub key: PageKey,
    /// Page LSN before this mutation was applied.
    pub prev_page_lsn: Lsn,
    pub compensates: Option<Lsn>,
    pub operation: PageOperation,
}

impl PageOperationRecord {
    pub fn is_compensation(&self) -> bool {
        self.compensates.is_some()
    }

    /// Replay this record against a page payload.
    pub fn apply(&self, payload: &mut [u8]) -> StorageResult<()> {
        if self.is_compensation() {
            self.operation.undo(payload)
        } else {
            self.operation.redo(payload)
        }
    }

    /// Encode everything except the operation id, which the WAL frame carries.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_le(self.key.file_id);
        buf.put_u64_le(self.key.page_index);
        codec::put_lsn(buf, self.prev_page_lsn);
        match self.compensates {
            Some(lsn) => {
                buf.put_u8(1);
                codec::put_lsn(buf, lsn);
            }
            None => buf.put_u8(0),
        }
        self.operation.encode(buf);
    }

    pub fn decode(op_id: OperationId, decoder: &mut Decoder<'_>) -> StorageResult<Self> {
        let key = PageKey::new(decoder.read_u64()?, decoder.read_u64()?);
        let prev_page_lsn = decoder.read_lsn()?;
        let compensates = match decoder.read_u8()? {
            0 => None,
            1 => Some(decoder.read_lsn()?),
            flag => {
                return Err(StorageError::Serialization(format!(
                    "invalid compensation flag {}",
                    flag
                )))
            }
        };
        let operation = PageOperation::decode(decoder)?;
        Ok(Self {
            op_id,
            key,
            prev_page_lsn,
            compensates,
            operation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand::rngs::StdRng;

    const PAYLOAD: usize = 512;

    fn random_payload(rng: &mut StdRng) -> Vec<u8> {
        (0..PAYLOAD).map(|_| rng.gen()).collect()
    }

    fn random_bytes(rng: &mut StdRng, len: usize) -> Vec<u8> {
        (0..len).map(|_| rng.gen()).collect()
    }

    fn random_operation(rng: &mut StdRng, payload: &[u8]) -> PageOperation {
        let offset = rng.gen_range(0..PAYLOAD - 8);
        match rng.gen_range(0..5) {
            0 => {
                let len = rng.gen_range(0..=PAYLOAD - offset);
                let data = random_bytes(rng, len);
                PageOperation::write_bytes(payload, offset, &data).unwrap()
            }
            1 => {
                let end = rng.gen_range(offset..=PAYLOAD);
                let len = rng.gen_range(0..=end - offset);
                let data = random_bytes(rng, len);
                PageOperation::insert_bytes(payload, offset, end, &data).unwrap()
            }
            2 => {
                let end = rng.gen_range(offset..=PAYLOAD);
                let len = rng.gen_range(0..=end - offset);
                PageOperation::remove_bytes(payload, offset, end, len).unwrap()
            }
            3 => PageOperation::add_to_counter(payload, offset, rng.gen()).unwrap(),
            _ => {
                let len = rng.gen_range(0..=PAYLOAD - offset);
                PageOperation::fill_bytes(payload, offset, len, rng.gen()).unwrap()
            }
        }
    }

    #[test]
    fn test_undo_reverses_redo_randomized() {
        let mut rng = StdRng::seed_from_u64(0x5EED);
        for _ in 0..2000 {
            let original = random_payload(&mut rng);
            let operation = random_operation(&mut rng, &original);

            let mut page = original.clone();
            operation.redo(&mut page).unwrap();
            operation.undo(&mut page).unwrap();
            assert_eq!(page, original, "operation {:?}", operation.kind());
        }
    }

    #[test]
    fn test_stacked_operations_undo_in_reverse() {
        let mut rng = StdRng::seed_from_u64(7);
        let original = random_payload(&mut rng);
        let mut page = original.clone();

        let mut applied = Vec::new();
        for _ in 0..50 {
            let operation = random_operation(&mut rng, &page);
            operation.redo(&mut page).unwrap();
            applied.push(operation);
        }
        for operation in applied.iter().rev() {
            operation.undo(&mut page).unwrap();
        }
        assert_eq!(page, original);
    }

    #[test]
    fn test_insert_and_remove_shift_region() {
        let mut page = vec![1, 2, 3, 4, 5, 6, 7, 8];

        let insert = PageOperation::insert_bytes(&page, 2, 6, &[9, 9]).unwrap();
        insert.redo(&mut page).unwrap();
        assert_eq!(page, vec![1, 2, 9, 9, 3, 4, 7, 8]);
        assert_eq!(
            insert,
            PageOperation::InsertBytes {
                offset: 2,
                region_end: 6,
                data: vec![9, 9],
                displaced: vec![5, 6],
            }
        );

        let remove = PageOperation::remove_bytes(&page, 1, 6, 3).unwrap();
        remove.redo(&mut page).unwrap();
        assert_eq!(page, vec![1, 3, 4, 0, 0, 0, 7, 8]);
    }

    #[test]
    fn test_counter_wraps() {
        let mut page = vec![0u8; 16];
        write_u64_at(&mut page, 8, u64::MAX).unwrap();

        let add = PageOperation::add_to_counter(&page, 8, 2).unwrap();
        add.redo(&mut page).unwrap();
        assert_eq!(read_u64_at(&page, 8).unwrap(), 1);

        let sub = PageOperation::add_to_counter(&page, 8, -3).unwrap();
        sub.redo(&mut page).unwrap();
        assert_eq!(read_u64_at(&page, 8).unwrap(), u64::MAX - 1);
    }

    #[test]
    fn test_out_of_bounds_rejected() {
        let page = vec![0u8; 16];
        assert!(PageOperation::write_bytes(&page, 10, &[0; 7]).is_err());
        assert!(PageOperation::insert_bytes(&page, 4, 2, &[1]).is_err());
        assert!(PageOperation::insert_bytes(&page, 4, 6, &[1, 2, 3]).is_err());
        assert!(PageOperation::remove_bytes(&page, 0, 17, 1).is_err());
        assert!(PageOperation::add_to_counter(&page, 9, 1).is_err());

        // A record decoded from a log can still point outside a smaller page
        let op = PageOperation::FillBytes {
            offset: 12,
            value: 1,
            before: vec![0; 8],
        };
        let mut small = vec![0u8; 16];
        assert!(matches!(
            op.redo(&mut small),
            Err(StorageError::InvalidPageOperation(_))
        ));
    }

    #[test]
    fn test_record_codec() {
        let mut rng = StdRng::seed_from_u64(99);
        let payload = random_payload(&mut rng);
        for compensates in [None, Some(Lsn::new(3, 128))] {
            for _ in 0..20 {
                let record = PageOperationRecord {
                    op_id: OperationId::new(17),
                    key: PageKey::new(2, 40),
                    prev_page_lsn: Lsn::new(2, 64),
                    compensates,
                    operation: random_operation(&mut rng, &payload),
                };
                let mut buf = Vec::new();
                record.encode(&mut buf);

                let mut decoder = Decoder::new(&buf);
                let decoded = PageOperationRecord::decode(record.op_id, &mut decoder).unwrap();
                decoder.finish().unwrap();
                assert_eq!(decoded, record);
            }
        }
    }

    #[test]
    fn test_unknown_kind_and_version() {
        let mut decoder = Decoder::new(&[42, PAGE_OPERATION_VERSION]);
        assert!(PageOperation::decode(&mut decoder).is_err());

        let mut decoder = Decoder::new(&[KIND_WRITE_BYTES, 9]);
        assert!(PageOperation::decode(&mut decoder).is_err());
    }

    #[test]
    fn test_compensation_applies_undo() {
        let mut page = vec![5u8; 8];
        let record = PageOperationRecord {
            op_id: OperationId::new(1),
            key: PageKey::new(1, 0),
            prev_page_lsn: Lsn::NULL,
            compensates: Some(Lsn::new(1, 24)),
            operation: PageOperation::FillBytes {
                offset: 0,
                value: 5,
                before: vec![0, 1, 2, 3],
            },
        };
        record.apply(&mut page).unwrap();
        assert_eq!(page, vec![0, 1, 2, 3, 5, 5, 5, 5]);
    }
}
