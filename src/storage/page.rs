pub mod utils;

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::storage::memory::PageBuffer;
use crate::storage::wal::Lsn;
use crate::storage::PAGE_SIZE;

/// Identifier of a page file registered with the write cache.
pub type FileId = u64;

// System header (32 bytes), present both in memory and on disk
pub const MAGIC_OFFSET: usize = 0;
pub const CRC_OFFSET: usize = 8;
pub const LSN_OFFSET: usize = 16;
pub const PAGE_HEADER_SIZE: usize = 32;

/// Bytes of a page visible to callers.
pub const PAGE_PAYLOAD_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

/// Marks a page that has been written at least once.
pub const PAGE_MAGIC: u64 = 0xFACB_03FE;

/// Address of a page: file plus page index within the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageKey {
    pub file_id: FileId,
    pub page_index: u64,
}

impl PageKey {
    pub fn new(file_id: FileId, page_index: u64) -> Self {
        Self {
            file_id,
            page_index,
        }
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file_id, self.page_index)
    }
}

/// A full page image: system header followed by the payload region.
///
/// Frames are shared between the read cache and the write cache through
/// [`SharedFrame`]; the lock around the frame is the per-page latch.
pub struct PageFrame {
    buffer: PageBuffer,
}

impl PageFrame {
    pub fn new(buffer: PageBuffer) -> Self {
        debug_assert_eq!(buffer.len(), PAGE_SIZE);
        Self { buffer }
    }

    /// LSN of the last logged mutation applied to this page.
    pub fn lsn(&self) -> Lsn {
        utils::read_lsn(&self.buffer, LSN_OFFSET)
    }

    pub fn set_lsn(&mut self, lsn: Lsn) {
        utils::write_lsn(&mut self.buffer, LSN_OFFSET, lsn);
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer[PAGE_HEADER_SIZE..]
    }

    pub(crate) fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[PAGE_HEADER_SIZE..]
    }

    /// Whole page including the system header.
    pub fn data(&self) -> &[u8] {
        &self.buffer
    }
}

impl fmt::Debug for PageFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageFrame").field("lsn", &self.lsn()).finish()
    }
}

pub type SharedFrame = Arc<RwLock<PageFrame>>;

pub fn shared_frame(buffer: PageBuffer) -> SharedFrame {
    Arc::new(RwLock::new(PageFrame::new(buffer)))
}
