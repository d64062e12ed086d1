//! On-disk page files.
//!
//! Each logical file is a flat sequence of `PAGE_SIZE` pages addressed by page
//! index. The write cache owns every [`PageFile`]; the [`FileRegistry`] maps
//! file names to stable ids and checksum modes across restarts.

pub mod checksum;
pub mod page_file;
pub mod registry;

pub use checksum::ChecksumMode;
pub use page_file::PageFile;
pub use registry::{FileEntry, FileRegistry};

pub const PAGE_SIZE: usize = 8192;
