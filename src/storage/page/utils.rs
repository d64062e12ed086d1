//! Bounds-checked helpers for reading and writing fixed-width fields inside
//! page images.

use std::ops::Range;

use byteorder::{ByteOrder, LittleEndian};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::wal::Lsn;

/// Validate that `offset..offset + len` lies within a buffer of `size` bytes.
pub fn check_range(size: usize, offset: usize, len: usize) -> StorageResult<Range<usize>> {
    let end = offset
        .checked_add(len)
        .ok_or_else(|| StorageError::InvalidPageOperation("region length overflows".into()))?;
    if end > size {
        return Err(StorageError::InvalidPageOperation(format!(
            "region {}..{} exceeds page payload of {} bytes",
            offset, end, size
        )));
    }
    Ok(offset..end)
}

pub fn read_u64_at(buf: &[u8], offset: usize) -> StorageResult<u64> {
    let range = check_range(buf.len(), offset, 8)?;
    Ok(LittleEndian::read_u64(&buf[range]))
}

pub fn write_u64_at(buf: &mut [u8], offset: usize, value: u64) -> StorageResult<()> {
    let range = check_range(buf.len(), offset, 8)?;
    LittleEndian::write_u64(&mut buf[range], value);
    Ok(())
}

pub fn read_u32_at(buf: &[u8], offset: usize) -> StorageResult<u32> {
    let range = check_range(buf.len(), offset, 4)?;
    Ok(LittleEndian::read_u32(&buf[range]))
}

pub fn write_u32_at(buf: &mut [u8], offset: usize, value: u32) -> StorageResult<()> {
    let range = check_range(buf.len(), offset, 4)?;
    LittleEndian::write_u32(&mut buf[range], value);
    Ok(())
}

/// Read an LSN stored in the page header. The header offsets are constants,
/// so a short buffer is a programming error.
pub(crate) fn read_lsn(buf: &[u8], offset: usize) -> Lsn {
    Lsn::new(
        LittleEndian::read_u64(&buf[offset..offset + 8]),
        LittleEndian::read_u64(&buf[offset + 8..offset + 16]),
    )
}

pub(crate) fn write_lsn(buf: &mut [u8], offset: usize, lsn: Lsn) {
    LittleEndian::write_u64(&mut buf[offset..offset + 8], lsn.segment());
    LittleEndian::write_u64(&mut buf[offset + 8..offset + 16], lsn.position());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_range() {
        assert_eq!(check_range(16, 4, 8).unwrap(), 4..12);
        assert_eq!(check_range(16, 8, 8).unwrap(), 8..16);
        assert!(check_range(16, 9, 8).is_err());
        assert!(check_range(16, usize::MAX, 2).is_err());
    }

    #[test]
    fn test_u64_roundtrip_and_bounds() {
        let mut buf = vec![0u8; 12];
        write_u64_at(&mut buf, 4, 0xDEAD_BEEF_0102_0304).unwrap();
        assert_eq!(read_u64_at(&buf, 4).unwrap(), 0xDEAD_BEEF_0102_0304);
        assert_eq!(buf[4], 0x04); // little-endian

        assert!(write_u64_at(&mut buf, 5, 1).is_err());
        assert!(read_u64_at(&buf, 8).is_err());
    }

    #[test]
    fn test_u32_bounds() {
        let mut buf = vec![0u8; 4];
        write_u32_at(&mut buf, 0, 7).unwrap();
        assert_eq!(read_u32_at(&buf, 0).unwrap(), 7);
        assert!(read_u32_at(&buf, 1).is_err());
    }

    #[test]
    fn test_lsn_field() {
        let mut buf = vec![0u8; 32];
        write_lsn(&mut buf, 16, Lsn::new(3, 4096));
        assert_eq!(read_lsn(&buf, 16), Lsn::new(3, 4096));
        assert_eq!(read_lsn(&buf, 0), Lsn::NULL);
    }
}
