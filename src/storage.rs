//! Storage layer implementation for vibestore.
//!
//! - **Page**: Fixed-size (8KB) frames with a magic/CRC/LSN header
//! - **PageFile**: Reads and writes pages of one file on disk
//! - **WriteCache**: Owns page files and dirty pages, writes them back in WAL order
//! - **ReadCache**: Bounded set of pinned or resident pages with 2Q replacement
//! - **WriteAheadLog**: Segmented log of atomic operation records

pub mod cache;
pub mod codec;
pub mod disk;
pub mod error;
pub mod memory;
pub mod page;
pub mod wal;

pub use cache::{PageReadGuard, PageWriteGuard, ReadCache, WriteCache};
pub use disk::{ChecksumMode, PAGE_SIZE};
pub use error::{StorageError, StorageResult};
pub use page::{FileId, PageFrame, PageKey};
pub use wal::{Lsn, WriteAheadLog};
