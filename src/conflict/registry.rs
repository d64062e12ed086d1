use std::collections::BTreeMap;
use std::sync::Arc;

use log::info;
use parking_lot::RwLock;

use super::{
    automerge, content, version, AutomergeConflictStrategy, ContentConflictStrategy,
    RecordConflictStrategy, VersionConflictStrategy,
};
use crate::storage::error::{StorageError, StorageResult};

pub const DEFAULT_CONFLICT_STRATEGY: &str = version::NAME;

/// Resolves conflict strategies by name.
#[derive(Debug, Clone)]
pub struct ConflictStrategyRegistry {
    strategies: Arc<RwLock<BTreeMap<String, Arc<dyn RecordConflictStrategy>>>>,
}

impl ConflictStrategyRegistry {
    /// A registry holding the built-in strategies.
    pub fn new() -> Self {
        let mut strategies: BTreeMap<String, Arc<dyn RecordConflictStrategy>> = BTreeMap::new();
        strategies.insert(version::NAME.into(), Arc::new(VersionConflictStrategy));
        strategies.insert(content::NAME.into(), Arc::new(ContentConflictStrategy));
        strategies.insert(automerge::NAME.into(), Arc::new(AutomergeConflictStrategy));
        Self {
            strategies: Arc::new(RwLock::new(strategies)),
        }
    }

    /// Register a strategy under its own name, replacing any previous one.
    pub fn register(&self, strategy: Arc<dyn RecordConflictStrategy>) {
        let name = strategy.name().to_string();
        info!("Registered conflict strategy '{}'", name);
        self.strategies.write().insert(name, strategy);
    }

    pub fn get(&self, name: &str) -> StorageResult<Arc<dyn RecordConflictStrategy>> {
        self.strategies
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::UnknownConflictStrategy(name.to_string()))
    }

    /// Resolve `name`, falling back to the default strategy for `None`.
    pub fn resolve(&self, name: Option<&str>) -> StorageResult<Arc<dyn RecordConflictStrategy>> {
        self.get(name.unwrap_or(DEFAULT_CONFLICT_STRATEGY))
    }

    pub fn names(&self) -> Vec<String> {
        self.strategies.read().keys().cloned().collect()
    }
}

impl Default for ConflictStrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}
