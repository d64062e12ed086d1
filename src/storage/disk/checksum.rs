//! Page magic and CRC32 stamping applied when pages leave the write cache,
//! and verification applied when they are read back.

use serde::{Deserialize, Serialize};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::utils::{read_u32_at, read_u64_at, write_u32_at, write_u64_at};
use crate::storage::page::{PageKey, CRC_OFFSET, LSN_OFFSET, MAGIC_OFFSET, PAGE_MAGIC};

/// How a file treats page checksums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChecksumMode {
    /// Neither store nor verify.
    Off,
    /// Store on write, never verify.
    Store,
    /// Verify on read; a mismatch is logged and the page returned as is.
    #[default]
    StoreAndVerify,
    /// Verify on read; a mismatch fails the read.
    StoreAndThrow,
}

impl ChecksumMode {
    pub fn stores(self) -> bool {
        self != ChecksumMode::Off
    }

    pub fn verifies(self) -> bool {
        matches!(self, ChecksumMode::StoreAndVerify | ChecksumMode::StoreAndThrow)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// Never written; all zeros.
    Blank,
    Valid,
    Mismatch { stored: u32, computed: u32 },
}

/// CRC32 over everything after the magic and checksum fields.
pub fn compute(page: &[u8]) -> u32 {
    crc32fast::hash(&page[LSN_OFFSET..])
}

/// Write the magic number and, when the mode stores checksums, the CRC.
pub fn stamp(page: &mut [u8], mode: ChecksumMode) -> StorageResult<()> {
    write_u64_at(page, MAGIC_OFFSET, PAGE_MAGIC)?;
    let crc = if mode.stores() { compute(page) } else { 0 };
    write_u32_at(page, CRC_OFFSET, crc)
}

pub fn check(page: &[u8]) -> StorageResult<Verification> {
    let magic = read_u64_at(page, MAGIC_OFFSET)?;
    let stored = read_u32_at(page, CRC_OFFSET)?;
    if magic != PAGE_MAGIC {
        if page.iter().all(|&b| b == 0) {
            return Ok(Verification::Blank);
        }
        return Ok(Verification::Mismatch {
            stored,
            computed: compute(page),
        });
    }
    let computed = compute(page);
    if computed == stored {
        Ok(Verification::Valid)
    } else {
        Ok(Verification::Mismatch { stored, computed })
    }
}

/// Apply `mode` to a page just read from disk.
pub fn verify(key: PageKey, page: &[u8], mode: ChecksumMode) -> StorageResult<()> {
    if !mode.verifies() {
        return Ok(());
    }
    match check(page)? {
        Verification::Blank | Verification::Valid => Ok(()),
        Verification::Mismatch { stored, computed } => {
            if mode == ChecksumMode::StoreAndThrow {
                return Err(StorageError::ChecksumMismatch {
                    key,
                    stored,
                    computed,
                });
            }
            log::warn!(
                "Checksum mismatch on page {}: stored {:#010x}, computed {:#010x}",
                key,
                stored,
                computed
            );
            Ok(())
        }
    }
}
