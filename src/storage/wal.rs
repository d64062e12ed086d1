//! Write-ahead logging.
//!
//! The log is a sequence of segment files holding CRC-protected records in
//! LSN order. Appends are buffered in memory and made durable by group
//! flushes; a [`WalReader`] replays the durable prefix.

pub mod lsn;
pub mod manager;
pub mod reader;
pub mod record;

pub use lsn::Lsn;
pub use manager::{WalConfig, WalStats, WriteAheadLog, SEGMENT_HEADER_SIZE};
pub use reader::WalReader;
pub use record::{RecordKind, WalEntry, WalRecord};
