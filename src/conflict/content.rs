use super::version::VersionConflictStrategy;
use super::{
    bump_version, ConcurrentModificationError, ConflictOutcome, RecordConflictStrategy, VersionedRecord,
};

/// Accepts a stale update whose content equals what is already stored.
///
/// Raw payloads compare byte for byte and documents field by field. A raw
/// payload never equals a document.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContentConflictStrategy;

pub const NAME: &str = "content";

impl RecordConflictStrategy for ContentConflictStrategy {
    fn name(&self) -> &str {
        NAME
    }

    fn resolve(
        &self,
        stored: &VersionedRecord,
        incoming: &VersionedRecord,
    ) -> Result<ConflictOutcome, ConcurrentModificationError> {
        if stored.version != incoming.version && stored.content == incoming.content {
            let version = bump_version(stored.version.max(incoming.version), stored, incoming)?;
            return Ok(ConflictOutcome::proceed(version));
        }
        VersionConflictStrategy::check(stored, incoming)
    }
}
