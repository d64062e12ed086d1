//! Recovery and crash resilience module.
//!
//! - Typed page operations with redo and undo
//! - Startup redo/undo replay of the write-ahead log
//! - Fuzzy checkpoints bounding how much log recovery has to read

pub mod checkpoint;
pub mod page_operation;
pub mod replay;

pub use checkpoint::{read_last_checkpoint, CheckpointManager, FuzzyCheckpoint};
pub use page_operation::{PageOperation, PageOperationRecord};
pub use replay::{Recovery, RecoveryStats};
