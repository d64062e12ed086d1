use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{error, info};

use crate::atomic::AtomicOperationsManager;
use crate::config::EngineConfig;
use crate::conflict::ConflictStrategyRegistry;
use crate::recovery::{
    read_last_checkpoint, CheckpointManager, FuzzyCheckpoint, Recovery, RecoveryStats,
};
use crate::storage::cache::{ReadCache, WriteCache};
use crate::storage::disk::{ChecksumMode, PAGE_SIZE};
use crate::storage::error::StorageResult;
use crate::storage::memory::ByteBufferPool;
use crate::storage::page::FileId;
use crate::storage::wal::{Lsn, WriteAheadLog};

/// Storage engine: owns the log, the caches and the atomic operation manager
/// for one data directory.
pub struct Engine {
    config: EngineConfig,
    wal: Arc<WriteAheadLog>,
    read_cache: ReadCache,
    operations: AtomicOperationsManager,
    checkpoints: CheckpointManager,
    conflict_strategies: ConflictStrategyRegistry,
    recovery_stats: RecoveryStats,
    closed: AtomicBool,
}

impl Engine {
    /// Open the engine in `config.data_dir`, creating it if needed, and run
    /// recovery before any atomic operation is admitted.
    pub fn open(config: EngineConfig) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("Failed to create data directory {:?}", config.data_dir))?;

        let wal = Arc::new(
            WriteAheadLog::open(config.wal.clone())
                .with_context(|| format!("Failed to open WAL in {:?}", config.wal.wal_dir))?,
        );
        let pool = ByteBufferPool::new(PAGE_SIZE, config.cache.buffer_pool_limit);
        let write_cache = WriteCache::open(&config.data_dir, Arc::clone(&wal), pool, &config.cache)
            .context("Failed to open page files")?;
        let read_cache = ReadCache::new(
            write_cache.clone(),
            config.cache.capacity_pages,
            config.cache.exhaustion,
        );
        let operations = AtomicOperationsManager::new(Arc::clone(&wal), read_cache.clone());

        let redo_lsn = read_last_checkpoint(&config.data_dir)
            .context("Failed to read checkpoint metadata")?
            .map(|checkpoint| checkpoint.redo_lsn)
            .unwrap_or(Lsn::NULL);
        let recovery_stats = Recovery::new(operations.clone())
            .recover(redo_lsn)
            .context("Recovery failed")?;
        operations.mark_recovered();

        let checkpoints = CheckpointManager::new(&config.data_dir, operations.clone())
            .context("Failed to load checkpoint state")?;
        write_cache
            .start_flusher()
            .context("Failed to start background flusher")?;

        info!("Opened storage engine in {:?}", config.data_dir);
        Ok(Self {
            config,
            wal,
            read_cache,
            operations,
            checkpoints,
            conflict_strategies: ConflictStrategyRegistry::new(),
            recovery_stats,
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Create a page file with the configured default checksum mode.
    pub fn add_file(&self, name: &str) -> StorageResult<FileId> {
        self.add_file_with_checksum(name, self.config.default_checksum_mode)
    }

    pub fn add_file_with_checksum(&self, name: &str, mode: ChecksumMode) -> StorageResult<FileId> {
        self.write_cache().add_file(name, mode)
    }

    pub fn open_file(&self, name: &str) -> StorageResult<FileId> {
        self.write_cache().open_file(name)
    }

    pub fn atomic_operations(&self) -> &AtomicOperationsManager {
        &self.operations
    }

    pub fn read_cache(&self) -> &ReadCache {
        &self.read_cache
    }

    pub fn write_cache(&self) -> &WriteCache {
        self.read_cache.write_cache()
    }

    pub fn wal(&self) -> &Arc<WriteAheadLog> {
        &self.wal
    }

    pub fn conflict_strategies(&self) -> &ConflictStrategyRegistry {
        &self.conflict_strategies
    }

    /// What recovery did when the engine was opened.
    pub fn recovery_stats(&self) -> &RecoveryStats {
        &self.recovery_stats
    }

    /// Write back all dirty pages and checkpoint.
    pub fn checkpoint(&self) -> StorageResult<FuzzyCheckpoint> {
        self.checkpoints.full_checkpoint()
    }

    /// Checkpoint without writing back dirty pages.
    pub fn fuzzy_checkpoint(&self) -> StorageResult<FuzzyCheckpoint> {
        self.checkpoints.fuzzy_checkpoint()
    }

    /// Write back all dirty pages.
    pub fn flush(&self) -> StorageResult<usize> {
        self.write_cache().flush_all()
    }

    /// Stop the flusher, checkpoint and close the log.
    pub fn close(&self) -> StorageResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.write_cache().stop_flusher();
        if !self.wal.is_failed() {
            self.checkpoints.full_checkpoint()?;
        }
        self.wal.close()?;
        info!("Closed storage engine in {:?}", self.config.data_dir);
        Ok(())
    }

    /// Drop the engine without writing anything back, the way a process
    /// crash would leave the data directory.
    pub fn abandon(self) {
        self.closed.store(true, Ordering::Release);
        self.write_cache().stop_flusher();
        info!("Abandoned storage engine in {:?}", self.config.data_dir);
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Best effort close on drop
        if let Err(e) = self.close() {
            error!("Failed to close storage engine: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::error::StorageError;
    use tempfile::tempdir;

    #[test]
    fn test_open_fresh_engine() -> Result<()> {
        let dir = tempdir()?;
        let engine = Engine::open(EngineConfig::new(dir.path()))?;

        assert_eq!(engine.recovery_stats().records_scanned, 0);
        let file = engine.add_file("users.pages")?;
        assert_eq!(engine.open_file("users.pages")?, file);
        assert_eq!(
            engine.write_cache().checksum_mode(file)?,
            ChecksumMode::StoreAndVerify
        );
        Ok(())
    }

    #[test]
    fn test_close_then_reopen() -> Result<()> {
        let dir = tempdir()?;
        {
            let engine = Engine::open(EngineConfig::new(dir.path()))?;
            let file = engine.add_file("data.pages")?;
            engine
                .atomic_operations()
                .execute_inside_atomic_operation(|op| -> StorageResult<()> {
                    let (_, mut page) = op.allocate_new_page(file)?;
                    op.write_bytes(&mut page, 0, b"persisted")?;
                    Ok(())
                })?;
            engine.close()?;
            assert!(matches!(
                engine.atomic_operations().start_atomic_operation(),
                Err(StorageError::Closed)
            ));
        }

        let engine = Engine::open(EngineConfig::new(dir.path()))?;
        // Clean close leaves nothing to redo
        assert_eq!(engine.recovery_stats().records_redone, 0);
        let file = engine.open_file("data.pages")?;
        let page = engine.read_cache().load_for_read(file, 0)?;
        assert_eq!(&page.payload()[..9], b"persisted");
        Ok(())
    }

    #[test]
    fn test_drop_closes() -> Result<()> {
        let dir = tempdir()?;
        {
            let engine = Engine::open(EngineConfig::new(dir.path()))?;
            engine.add_file("a.pages")?;
        }
        assert!(read_last_checkpoint(dir.path())?.is_some());
        Ok(())
    }
}
