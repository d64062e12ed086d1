//! Atomic operations: groups of page mutations that survive a crash
//! completely or not at all.
//!
//! A caller starts an [`AtomicOperation`], loads pages through it and mutates
//! them only through logged [`PageOperation`](crate::recovery::PageOperation)s.
//! Commit writes a commit record and flushes the log through it; rollback
//! logs a compensation record for every page operation in reverse order.

pub mod freezer;
pub mod id;
pub mod manager;
pub mod operation;
pub mod state;

pub use id::{OperationId, OperationIdGenerator};
pub use freezer::FreezeId;
pub use manager::{AtomicOperationsManager, ComponentReadLock};
pub use operation::AtomicOperation;
pub use state::{OperationInfo, OperationState};
