//! Startup recovery: redo every logged page operation the page files are
//! missing, then undo operations that never finished.
//!
//! Runs in two passes over the WAL starting at the checkpoint's redo LSN:
//! 1. Redo: replay page-operation records whose LSN is newer than the target
//!    page's LSN, tracking which operations are still open.
//! 2. Undo: roll back every open operation, newest record first, writing a
//!    compensation record per undone page operation and a rollback record per
//!    operation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, info, warn};

use crate::atomic::operation::log_and_apply;
use crate::atomic::{AtomicOperationsManager, OperationId};
use crate::recovery::page_operation::PageOperationRecord;
use crate::storage::cache::ReadCache;
use crate::storage::wal::{Lsn, WalRecord, WriteAheadLog};

/// Recovery statistics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryStats {
    /// LSN the scan started from.
    pub start_lsn: Lsn,
    /// Last record seen by the scan.
    pub end_lsn: Lsn,
    pub records_scanned: usize,
    pub records_redone: usize,
    /// Page operations already reflected on disk.
    pub records_skipped: usize,
    pub operations_committed: usize,
    /// Operations the log shows as rolled back before the crash.
    pub operations_rolled_back: usize,
    /// Operations rolled back by recovery itself.
    pub operations_undone: usize,
    pub compensations_written: usize,
    /// Where the log stopped being readable, if it was damaged.
    pub truncated_tail: Option<Lsn>,
    pub max_operation_id: Option<OperationId>,
}

/// Page operations of an operation without a commit or rollback record.
#[derive(Default)]
struct OpenOperation {
    page_operations: Vec<(Lsn, PageOperationRecord)>,
    compensated: HashSet<Lsn>,
}

pub struct Recovery {
    wal: Arc<WriteAheadLog>,
    read_cache: ReadCache,
    operations: AtomicOperationsManager,
}

impl Recovery {
    pub fn new(operations: AtomicOperationsManager) -> Self {
        Recovery {
            wal: Arc::clone(operations.wal()),
            read_cache: operations.read_cache().clone(),
            operations,
        }
    }

    /// Bring page files to the state of all committed operations.
    ///
    /// Safe to run repeatedly: redo is gated on page LSNs and undo skips page
    /// operations that already have a compensation record.
    pub fn recover(&self, redo_lsn: Lsn) -> Result<RecoveryStats> {
        let mut stats = RecoveryStats {
            start_lsn: redo_lsn,
            ..RecoveryStats::default()
        };
        info!("Starting recovery from {}", redo_lsn);

        let open = self.redo_pass(redo_lsn, &mut stats)?;
        self.undo_pass(open, &mut stats)?;

        self.wal
            .flush_all()
            .context("Failed to flush WAL after recovery")?;
        self.read_cache
            .write_cache()
            .flush_all()
            .context("Failed to write back recovered pages")?;
        if let Some(max) = stats.max_operation_id {
            self.operations.advance_ids_past(max);
        }

        info!(
            "Recovery finished: {} record(s) scanned, {} redone, {} operation(s) undone",
            stats.records_scanned, stats.records_redone, stats.operations_undone
        );
        Ok(stats)
    }

    fn redo_pass(
        &self,
        redo_lsn: Lsn,
        stats: &mut RecoveryStats,
    ) -> Result<HashMap<OperationId, OpenOperation>> {
        let mut open: HashMap<OperationId, OpenOperation> = HashMap::new();
        let mut reader = self
            .wal
            .read(redo_lsn)
            .with_context(|| format!("Failed to open WAL for recovery at {}", redo_lsn))?;

        for entry in reader.by_ref() {
            let entry = entry.context("Failed to read WAL during recovery")?;
            stats.records_scanned += 1;
            stats.end_lsn = entry.lsn;
            if let Some(op_id) = entry.record.op_id() {
                stats.max_operation_id = stats.max_operation_id.max(Some(op_id));
            }

            match entry.record {
                WalRecord::AtomicOperationStart { op_id }
                | WalRecord::ComponentOperation { op_id, .. } => {
                    open.entry(op_id).or_default();
                }
                WalRecord::AtomicOperationCommit { op_id, .. } => {
                    open.remove(&op_id);
                    stats.operations_committed += 1;
                }
                WalRecord::AtomicOperationRollback { op_id } => {
                    open.remove(&op_id);
                    stats.operations_rolled_back += 1;
                }
                WalRecord::PageOperation(record) => {
                    self.redo(entry.lsn, &record, stats)?;
                    let operation = open.entry(record.op_id).or_default();
                    match record.compensates {
                        Some(original) => {
                            operation.compensated.insert(original);
                        }
                        None => operation.page_operations.push((entry.lsn, record)),
                    }
                }
                WalRecord::Checkpoint { .. } => {}
            }
        }

        stats.truncated_tail = reader.truncated_tail();
        if let Some(lsn) = stats.truncated_tail {
            warn!("Recovery stopped at damaged WAL tail {}", lsn);
        }
        Ok(open)
    }

    fn redo(
        &self,
        lsn: Lsn,
        record: &PageOperationRecord,
        stats: &mut RecoveryStats,
    ) -> Result<()> {
        let mut guard = self
            .read_cache
            .load_for_write_extending(record.key)
            .with_context(|| format!("Failed to load page {} for redo", record.key))?;
        if guard.lsn() >= lsn {
            stats.records_skipped += 1;
            return Ok(());
        }
        record
            .apply(guard.frame_mut().payload_mut())
            .with_context(|| format!("Failed to redo {} on page {}", lsn, record.key))?;
        guard.frame_mut().set_lsn(lsn);
        let frame = guard.shared_frame().clone();
        self.read_cache
            .write_cache()
            .register_dirty(record.key, &frame, lsn)?;
        stats.records_redone += 1;
        Ok(())
    }

    fn undo_pass(
        &self,
        open: HashMap<OperationId, OpenOperation>,
        stats: &mut RecoveryStats,
    ) -> Result<()> {
        if open.is_empty() {
            return Ok(());
        }
        let mut losers: Vec<OperationId> = open.keys().copied().collect();
        losers.sort();
        info!("Rolling back {} unfinished operation(s)", losers.len());

        let mut pending: Vec<(Lsn, PageOperationRecord)> = open
            .into_values()
            .flat_map(|operation| {
                let compensated = operation.compensated;
                operation
                    .page_operations
                    .into_iter()
                    .filter(move |(lsn, _)| !compensated.contains(lsn))
            })
            .collect();
        // Newest first across all operations
        pending.sort_by(|a, b| b.0.cmp(&a.0));

        let write_cache = self.read_cache.write_cache();
        for (lsn, record) in pending {
            let mut guard = self
                .read_cache
                .load_for_write_extending(record.key)
                .with_context(|| format!("Failed to load page {} for undo", record.key))?;
            let compensation = PageOperationRecord {
                op_id: record.op_id,
                key: record.key,
                prev_page_lsn: guard.lsn(),
                compensates: Some(lsn),
                operation: record.operation,
            };
            log_and_apply(&self.wal, write_cache, &mut guard, &compensation)
                .with_context(|| format!("Failed to undo {} on page {}", lsn, record.key))?;
            stats.compensations_written += 1;
        }

        for op_id in losers {
            self.wal
                .append(&WalRecord::AtomicOperationRollback { op_id })
                .with_context(|| format!("Failed to log rollback of {}", op_id))?;
            debug!("Recovery rolled back {}", op_id);
            stats.operations_undone += 1;
        }
        Ok(())
    }
}
