use log::error;

use super::version::VersionConflictStrategy;
use super::{
    bump_version, ConcurrentModificationError, ConflictOutcome, RecordConflictStrategy,
    RecordContent, VersionedRecord,
};

/// Merges a stale document update field by field into the stored document.
/// Raw payloads cannot be merged and fall back to the version check.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutomergeConflictStrategy;

pub const NAME: &str = "automerge";

impl RecordConflictStrategy for AutomergeConflictStrategy {
    fn name(&self) -> &str {
        NAME
    }

    fn resolve(
        &self,
        stored: &VersionedRecord,
        incoming: &VersionedRecord,
    ) -> Result<ConflictOutcome, ConcurrentModificationError> {
        if stored.version == incoming.version {
            return VersionConflictStrategy::check(stored, incoming);
        }
        let (RecordContent::Document(stored_doc), RecordContent::Document(incoming_doc)) =
            (&stored.content, &incoming.content)
        else {
            return VersionConflictStrategy::check(stored, incoming);
        };

        let new_version = bump_version(stored.version.max(incoming.version), stored, incoming)?;
        let merged = stored_doc.merge(incoming_doc);
        match merged.to_bytes() {
            Ok(bytes) => Ok(ConflictOutcome {
                new_version,
                replacement: Some(bytes),
            }),
            Err(e) => {
                error!("Failed to serialize merged document: {}", e);
                Err(ConcurrentModificationError::between(stored, incoming))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::document::{Document, FieldValue};

    #[test]
    fn test_merges_stale_document() -> anyhow::Result<()> {
        let stored =
            VersionedRecord::document(5, Document::new().with("a", FieldValue::Integer(1)));
        let incoming =
            VersionedRecord::document(4, Document::new().with("b", FieldValue::Integer(2)));

        let outcome = AutomergeConflictStrategy.resolve(&stored, &incoming)?;
        assert_eq!(outcome.new_version, 6);
        let merged = Document::from_bytes(&outcome.replacement.unwrap_or_default())?;
        assert_eq!(
            merged,
            Document::new()
                .with("a", FieldValue::Integer(1))
                .with("b", FieldValue::Integer(2))
        );
        Ok(())
    }

    #[test]
    fn test_matching_versions_proceed_without_merge() {
        let stored = VersionedRecord::document(2, Document::new());
        let incoming =
            VersionedRecord::document(2, Document::new().with("x", FieldValue::Null));
        let outcome = AutomergeConflictStrategy.resolve(&stored, &incoming).unwrap();
        assert_eq!(outcome, ConflictOutcome::proceed(3));
    }

    #[test]
    fn test_merge_at_max_version_rejected() {
        let stored = VersionedRecord::document(u64::MAX, Document::new());
        let incoming = VersionedRecord::document(1, Document::new());
        assert!(AutomergeConflictStrategy.resolve(&stored, &incoming).is_err());
    }

    #[test]
    fn test_raw_content_rejected() {
        let stored = VersionedRecord::raw(3, vec![1]);
        let incoming = VersionedRecord::raw(2, vec![1]);
        assert!(AutomergeConflictStrategy.resolve(&stored, &incoming).is_err());

        let document = VersionedRecord::document(2, Document::new());
        assert!(AutomergeConflictStrategy.resolve(&stored, &document).is_err());
    }
}
