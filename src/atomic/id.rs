//! Atomic operation id generation.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier of an atomic operation, stamped on every WAL record it
/// produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationId(pub u64);

impl OperationId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Op{}", self.0)
    }
}

/// A thread-safe operation id generator.
pub struct OperationIdGenerator {
    next_id: AtomicU64,
}

impl OperationIdGenerator {
    /// Creates a generator starting from 1.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> OperationId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        OperationId::new(id)
    }

    /// Ensure every future id is greater than `id`. Used after recovery so
    /// ids found in the log are never handed out again.
    pub fn advance_past(&self, id: OperationId) {
        self.next_id.fetch_max(id.0 + 1, Ordering::SeqCst);
    }
}

impl Default for OperationIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_id_display_and_order() {
        let id1 = OperationId::new(1);
        let id2 = OperationId::new(2);
        assert_eq!(format!("{}", id2), "Op2");
        assert!(id1 < id2);
        assert_eq!(id1, OperationId::new(1));
    }

    #[test]
    fn test_generator_starts_at_one() {
        let generator = OperationIdGenerator::new();
        assert_eq!(generator.next(), OperationId::new(1));
        assert_eq!(generator.next(), OperationId::new(2));
    }

    #[test]
    fn test_advance_past() {
        let generator = OperationIdGenerator::new();
        generator.advance_past(OperationId::new(41));
        assert_eq!(generator.next().value(), 42);

        // Never moves backwards
        generator.advance_past(OperationId::new(10));
        assert_eq!(generator.next().value(), 43);
    }

    #[test]
    fn test_generator_thread_safety() {
        use std::sync::Arc;
        use std::thread;

        let generator = Arc::new(OperationIdGenerator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gen = Arc::clone(&generator);
                thread::spawn(move || (0..100).map(|_| gen.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut all_ids = vec![];
        for handle in handles {
            all_ids.extend(handle.join().unwrap());
        }

        let mut unique: Vec<_> = all_ids.iter().map(|id| id.value()).collect();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 800);
    }
}
