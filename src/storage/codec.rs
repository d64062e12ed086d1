//! Little-endian binary encoding shared by WAL records and page operations.
//!
//! Encoding goes through [`bytes::BufMut`]; decoding goes through [`Decoder`],
//! which checks the remaining length before every read so truncated or
//! malformed input surfaces as an error instead of a panic.

use bytes::{Buf, BufMut};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::wal::Lsn;

pub fn put_lsn<B: BufMut>(buf: &mut B, lsn: Lsn) {
    buf.put_u64_le(lsn.segment());
    buf.put_u64_le(lsn.position());
}

/// Length-prefixed byte string.
pub fn put_bytes<B: BufMut>(buf: &mut B, bytes: &[u8]) {
    buf.put_u32_le(bytes.len() as u32);
    buf.put_slice(bytes);
}

pub fn put_string<B: BufMut>(buf: &mut B, value: &str) {
    put_bytes(buf, value.as_bytes());
}

pub struct Decoder<'a> {
    input: &'a [u8],
    consumed: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, consumed: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.input.remaining()
    }

    pub fn is_empty(&self) -> bool {
        self.input.is_empty()
    }

    fn ensure(&self, len: usize) -> StorageResult<()> {
        if self.input.remaining() < len {
            return Err(StorageError::Serialization(format!(
                "unexpected end of input at offset {}: need {} bytes, have {}",
                self.consumed,
                len,
                self.input.remaining()
            )));
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> StorageResult<u8> {
        self.ensure(1)?;
        self.consumed += 1;
        Ok(self.input.get_u8())
    }

    pub fn read_u16(&mut self) -> StorageResult<u16> {
        self.ensure(2)?;
        self.consumed += 2;
        Ok(self.input.get_u16_le())
    }

    pub fn read_u32(&mut self) -> StorageResult<u32> {
        self.ensure(4)?;
        self.consumed += 4;
        Ok(self.input.get_u32_le())
    }

    pub fn read_u64(&mut self) -> StorageResult<u64> {
        self.ensure(8)?;
        self.consumed += 8;
        Ok(self.input.get_u64_le())
    }

    pub fn read_i64(&mut self) -> StorageResult<i64> {
        self.ensure(8)?;
        self.consumed += 8;
        Ok(self.input.get_i64_le())
    }

    pub fn read_lsn(&mut self) -> StorageResult<Lsn> {
        let segment = self.read_u64()?;
        let position = self.read_u64()?;
        Ok(Lsn::new(segment, position))
    }

    /// Read exactly `len` raw bytes.
    pub fn read_slice(&mut self, len: usize) -> StorageResult<&'a [u8]> {
        self.ensure(len)?;
        let (head, tail) = self.input.split_at(len);
        self.input = tail;
        self.consumed += len;
        Ok(head)
    }

    /// Read a length-prefixed byte string written by [`put_bytes`].
    pub fn read_bytes(&mut self) -> StorageResult<Vec<u8>> {
        let len = self.read_u32()? as usize;
        Ok(self.read_slice(len)?.to_vec())
    }

    pub fn read_string(&mut self) -> StorageResult<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes)
            .map_err(|e| StorageError::Serialization(format!("invalid UTF-8 string: {}", e)))
    }

    /// Fail if any input is left over.
    pub fn finish(self) -> StorageResult<()> {
        if !self.input.is_empty() {
            return Err(StorageError::Serialization(format!(
                "{} trailing bytes after offset {}",
                self.input.len(),
                self.consumed
            )));
        }
        Ok(())
    }
}
