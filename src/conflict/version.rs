use super::{
    bump_version, ConcurrentModificationError, ConflictOutcome, RecordConflictStrategy, VersionedRecord,
};

/// Accepts an update only when it carries the stored version.
#[derive(Debug, Default, Clone, Copy)]
pub struct VersionConflictStrategy;

pub const NAME: &str = "version";

impl VersionConflictStrategy {
    /// The version check shared by every built-in strategy.
    pub(crate) fn check(
        stored: &VersionedRecord,
        incoming: &VersionedRecord,
    ) -> Result<ConflictOutcome, ConcurrentModificationError> {
        if stored.version == incoming.version {
            let version = bump_version(stored.version, stored, incoming)?;
            Ok(ConflictOutcome::proceed(version))
        } else {
            Err(ConcurrentModificationError::between(stored, incoming))
        }
    }
}

impl RecordConflictStrategy for VersionConflictStrategy {
    fn name(&self) -> &str {
        NAME
    }

    fn resolve(
        &self,
        stored: &VersionedRecord,
        incoming: &VersionedRecord,
    ) -> Result<ConflictOutcome, ConcurrentModificationError> {
        Self::check(stored, incoming)
    }
}
