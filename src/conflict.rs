//! Conflict strategies for optimistic record updates.
//!
//! When an update carries a version that differs from the stored one, the
//! configured [`RecordConflictStrategy`] decides whether the write proceeds,
//! proceeds with a merged payload, or fails with
//! [`ConcurrentModificationError`]. Strategies are pure: they never touch the
//! log or the cache.

pub mod automerge;
pub mod content;
pub mod document;
pub mod registry;
pub mod version;

use std::fmt::Debug;

use thiserror::Error;

pub use automerge::AutomergeConflictStrategy;
pub use content::ContentConflictStrategy;
pub use document::{Document, FieldValue};
pub use registry::{ConflictStrategyRegistry, DEFAULT_CONFLICT_STRATEGY};
pub use version::VersionConflictStrategy;

/// Content of a record as seen by a conflict strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordContent {
    /// Opaque bytes.
    Raw(Vec<u8>),
    /// Field collection that can be merged.
    Document(Document),
}

/// One side of a conflict: a version and the content written with it.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedRecord {
    pub version: u64,
    pub content: RecordContent,
}

impl VersionedRecord {
    pub fn raw(version: u64, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            version,
            content: RecordContent::Raw(bytes.into()),
        }
    }

    pub fn document(version: u64, document: Document) -> Self {
        Self {
            version,
            content: RecordContent::Document(document),
        }
    }
}

/// Accepted update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictOutcome {
    pub new_version: u64,
    /// Payload to store instead of the incoming one. `None` means the normal
    /// write of the incoming content proceeds.
    pub replacement: Option<Vec<u8>>,
}

impl ConflictOutcome {
    pub fn proceed(new_version: u64) -> Self {
        Self {
            new_version,
            replacement: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Cannot update record: stored version is {stored} but the update carries version {incoming}")]
pub struct ConcurrentModificationError {
    pub stored: u64,
    pub incoming: u64,
}

impl ConcurrentModificationError {
    pub fn between(stored: &VersionedRecord, incoming: &VersionedRecord) -> Self {
        Self {
            stored: stored.version,
            incoming: incoming.version,
        }
    }
}

/// Version following `current`. A record already at `u64::MAX` cannot take
/// another update.
pub(crate) fn bump_version(
    current: u64,
    stored: &VersionedRecord,
    incoming: &VersionedRecord,
) -> Result<u64, ConcurrentModificationError> {
    current
        .checked_add(1)
        .ok_or_else(|| ConcurrentModificationError::between(stored, incoming))
}

/// Policy applied when an update meets a stored record.
pub trait RecordConflictStrategy: Send + Sync + Debug {
    fn name(&self) -> &str;

    fn resolve(
        &self,
        stored: &VersionedRecord,
        incoming: &VersionedRecord,
    ) -> Result<ConflictOutcome, ConcurrentModificationError>;
}
