//! Storage layer error types.

use std::path::PathBuf;

use thiserror::Error;

use crate::storage::page::PageKey;
use crate::storage::wal::Lsn;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A WAL or page write/fsync failed. The engine cannot guarantee
    /// durability afterwards and refuses further writes.
    #[error("Durability failure: {0}")]
    Durability(String),

    #[error("Checksum mismatch on page {key}: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        key: PageKey,
        stored: u32,
        computed: u32,
    },

    #[error("Page cache exhausted: all {capacity} pages are pinned")]
    CacheExhausted { capacity: usize },

    #[error("Page not found: {0}")]
    PageNotFound(PageKey),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("File already exists: {0}")]
    FileExists(String),

    #[error("Unknown file id: {0}")]
    UnknownFileId(u64),

    #[error("Invalid page operation: {0}")]
    InvalidPageOperation(String),

    #[error("Corrupted data in {path:?}: {reason}")]
    Corrupted { path: PathBuf, reason: String },

    #[error("Recovery has not completed; atomic operations are not admitted yet")]
    RecoveryPending,

    #[error("Atomic operation {0} was marked rollback-only and has been rolled back")]
    RollbackOnly(u64),

    #[error("Storage is closed")]
    Closed,

    #[error("Unknown conflict strategy: {0}")]
    UnknownConflictStrategy(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("WAL record payload of {size} bytes exceeds the {limit} byte limit")]
    RecordTooLarge { size: usize, limit: usize },

    #[error("WAL record at {lsn} is malformed: {reason}")]
    MalformedRecord { lsn: Lsn, reason: String },
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
