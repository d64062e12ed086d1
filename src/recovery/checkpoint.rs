//! Checkpoint management for recovery.
//!
//! Implements fuzzy checkpointing: operations keep running while the
//! checkpoint is taken. A checkpoint records the LSN recovery has to start
//! from, persists it in `checkpoint.meta`, and lets the WAL drop every segment
//! before that point.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::atomic::{AtomicOperationsManager, OperationId};
use crate::storage::cache::WriteCache;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::wal::{Lsn, WalRecord, WriteAheadLog};

pub const CHECKPOINT_FILE_NAME: &str = "checkpoint.meta";

/// Fuzzy checkpoint data structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuzzyCheckpoint {
    /// LSN of the checkpoint record.
    pub checkpoint_lsn: Lsn,
    /// LSN where the redo pass should start.
    pub redo_lsn: Lsn,
    /// Operations running when the checkpoint was taken.
    pub active_operations: Vec<OperationId>,
    pub created_at_millis: u64,
}

/// Internal checkpoint state.
#[derive(Debug, Default)]
struct CheckpointState {
    last: Option<FuzzyCheckpoint>,
    checkpoint_in_progress: bool,
}

/// Checkpoint manager handles creating and persisting checkpoints.
pub struct CheckpointManager {
    dir: PathBuf,
    wal: Arc<WriteAheadLog>,
    write_cache: WriteCache,
    operations: AtomicOperationsManager,
    state: Mutex<CheckpointState>,
}

impl CheckpointManager {
    pub fn new(dir: &Path, operations: AtomicOperationsManager) -> StorageResult<Self> {
        let last = read_last_checkpoint(dir)?;
        Ok(CheckpointManager {
            dir: dir.to_path_buf(),
            wal: Arc::clone(operations.wal()),
            write_cache: operations.read_cache().write_cache().clone(),
            operations,
            state: Mutex::new(CheckpointState {
                last,
                checkpoint_in_progress: false,
            }),
        })
    }

    pub fn last_checkpoint(&self) -> Option<FuzzyCheckpoint> {
        self.state.lock().last.clone()
    }

    /// Take a fuzzy checkpoint. Dirty pages stay in the write cache; the redo
    /// LSN is the oldest change that may not be on disk yet.
    pub fn fuzzy_checkpoint(&self) -> StorageResult<FuzzyCheckpoint> {
        {
            let mut state = self.state.lock();
            if state.checkpoint_in_progress {
                return Err(StorageError::Checkpoint(
                    "checkpoint already in progress".into(),
                ));
            }
            state.checkpoint_in_progress = true;
        }
        let result = self.create_checkpoint();
        let mut state = self.state.lock();
        state.checkpoint_in_progress = false;
        if let Ok(checkpoint) = &result {
            state.last = Some(checkpoint.clone());
        }
        result
    }

    /// Write back every dirty page, then checkpoint. The WAL can then drop
    /// everything before the oldest running operation.
    pub fn full_checkpoint(&self) -> StorageResult<FuzzyCheckpoint> {
        let pages = self.write_cache.flush_all()?;
        debug!("Wrote back {} page(s) before checkpoint", pages);
        self.fuzzy_checkpoint()
    }

    fn create_checkpoint(&self) -> StorageResult<FuzzyCheckpoint> {
        // Read in this order: anything started or dirtied after a read is
        // covered by the LSN read before it.
        let end_lsn = self.wal.end_lsn();
        let active_operations = self.operations.active_operations();
        let min_active = self.operations.min_active_start_lsn();
        let min_dirty = self.write_cache.min_dirty_lsn();

        let redo_lsn = [Some(end_lsn), min_active, min_dirty]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or(Lsn::NULL);

        let checkpoint_lsn = self.wal.append(&WalRecord::Checkpoint { redo_lsn })?;
        self.wal.flush(checkpoint_lsn)?;

        let checkpoint = FuzzyCheckpoint {
            checkpoint_lsn,
            redo_lsn,
            active_operations,
            created_at_millis: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_millis() as u64)
                .unwrap_or(0),
        };
        self.write_checkpoint_metadata(&checkpoint)?;

        let removed = self.wal.truncate(redo_lsn)?;
        info!(
            "Checkpoint at {} (redo from {}, {} active operation(s), {} segment(s) removed)",
            checkpoint_lsn,
            redo_lsn,
            checkpoint.active_operations.len(),
            removed
        );
        Ok(checkpoint)
    }

    /// Write checkpoint metadata to disk, replacing the previous one.
    fn write_checkpoint_metadata(&self, checkpoint: &FuzzyCheckpoint) -> StorageResult<()> {
        let bytes = bincode::serialize(checkpoint)?;
        let path = self.dir.join(CHECKPOINT_FILE_NAME);
        let tmp = path.with_extension("meta.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// Read the last checkpoint metadata from `dir`, if any.
pub fn read_last_checkpoint(dir: &Path) -> StorageResult<Option<FuzzyCheckpoint>> {
    let path = dir.join(CHECKPOINT_FILE_NAME);
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(&path)?;
    bincode::deserialize(&bytes)
        .map(Some)
        .map_err(|e| StorageError::Corrupted {
            path: path.clone(),
            reason: e.to_string(),
        })
}
