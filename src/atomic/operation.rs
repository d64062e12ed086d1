//! The atomic operation handle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, error, warn};
use parking_lot::Mutex;

use super::id::OperationId;
use super::manager::{AtomicOperationsManager, ComponentWriteLock};
use crate::recovery::page_operation::{PageOperation, PageOperationRecord};
use crate::storage::cache::read_cache::RetainedPages;
use crate::storage::cache::{PageReadGuard, PageWriteGuard, WriteCache};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{FileId, PageKey};
use crate::storage::wal::{Lsn, WalRecord, WriteAheadLog};

/// Append `record` and apply it to the page held by `guard`, advancing the
/// page LSN and registering the page as dirty.
///
/// The record is checked against the page before it is logged, so an invalid
/// operation leaves neither the page nor the log changed.
pub(crate) fn log_and_apply(
    wal: &WriteAheadLog,
    write_cache: &WriteCache,
    guard: &mut PageWriteGuard,
    record: &PageOperationRecord,
) -> StorageResult<Lsn> {
    let key = guard.key();
    record.apply(guard.frame_mut().payload_mut())?;
    let lsn = match wal.append(&WalRecord::PageOperation(record.clone())) {
        Ok(lsn) => lsn,
        Err(e) => {
            // Put the page back the way it was
            let payload = guard.frame_mut().payload_mut();
            if record.is_compensation() {
                record.operation.redo(payload)?;
            } else {
                record.operation.undo(payload)?;
            }
            return Err(e);
        }
    };
    guard.frame_mut().set_lsn(lsn);
    let frame = guard.shared_frame().clone();
    write_cache.register_dirty(key, &frame, lsn)?;
    Ok(lsn)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

/// A unit of page mutations that is applied completely or not at all.
///
/// Every page the operation changes stays write-latched until the operation
/// commits or rolls back, so no other reader or writer sees its uncommitted
/// bytes. Dropping a page guard parks the latch in the operation; loading the
/// page again through the operation picks it back up. An operation holds at
/// most one guard per page at a time.
///
/// Dropping an operation that was neither committed nor rolled back rolls it
/// back. Page guards obtained from the operation must be released before it
/// ends, since rollback needs to lock the pages again.
pub struct AtomicOperation {
    manager: AtomicOperationsManager,
    id: OperationId,
    start_lsn: Lsn,
    last_lsn: Lsn,
    /// Logged page operations in the order they were applied.
    applied: Vec<(Lsn, PageOperationRecord)>,
    /// Latches of changed pages whose guards were dropped.
    retained: RetainedPages,
    component_locks: Vec<(String, ComponentWriteLock)>,
    rollback_only: bool,
    depth: usize,
    finished: bool,
}

impl AtomicOperation {
    pub(crate) fn new(manager: AtomicOperationsManager, id: OperationId, start_lsn: Lsn) -> Self {
        Self {
            manager,
            id,
            start_lsn,
            last_lsn: start_lsn,
            applied: Vec::new(),
            retained: Arc::new(Mutex::new(HashMap::new())),
            component_locks: Vec::new(),
            rollback_only: false,
            depth: 0,
            finished: false,
        }
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn start_lsn(&self) -> Lsn {
        self.start_lsn
    }

    /// LSN of the last record this operation wrote.
    pub fn last_lsn(&self) -> Lsn {
        self.last_lsn
    }

    /// Number of page operations applied so far.
    pub fn page_operations(&self) -> usize {
        self.applied.len()
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }

    /// Make the eventual commit roll back instead.
    pub fn mark_rollback_only(&mut self) {
        self.rollback_only = true;
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Load a page for reading. A page this operation changed is read
    /// through the latch the operation already holds.
    pub fn load_page_for_read(
        &self,
        file_id: FileId,
        page_index: u64,
    ) -> StorageResult<PageReadGuard> {
        match self.take_retained(PageKey::new(file_id, page_index)) {
            Some(guard) => Ok(PageReadGuard::from_retained(guard)),
            None => self.manager.read_cache().load_for_read(file_id, page_index),
        }
    }

    pub fn load_page_for_write(
        &self,
        file_id: FileId,
        page_index: u64,
    ) -> StorageResult<PageWriteGuard> {
        let key = PageKey::new(file_id, page_index);
        match self.take_retained(key) {
            Some(guard) => Ok(guard),
            None => self.manager.read_cache().load_for_write(file_id, page_index),
        }
    }

    /// Number of changed pages whose latch is parked in this operation.
    pub fn retained_pages(&self) -> usize {
        self.retained.lock().len()
    }

    fn take_retained(&self, key: PageKey) -> Option<PageWriteGuard> {
        let mut guard = self.retained.lock().remove(&key)?;
        guard.retain_in(&self.retained);
        Some(guard)
    }

    pub fn allocate_new_page(&self, file_id: FileId) -> StorageResult<(u64, PageWriteGuard)> {
        self.manager.read_cache().allocate_new_page(file_id)
    }

    /// Log `operation` against the page held by `guard` and apply it.
    pub fn apply(
        &mut self,
        guard: &mut PageWriteGuard,
        operation: PageOperation,
    ) -> StorageResult<Lsn> {
        let record = PageOperationRecord {
            op_id: self.id,
            key: guard.key(),
            prev_page_lsn: guard.lsn(),
            compensates: None,
            operation,
        };
        let lsn = log_and_apply(
            self.manager.wal(),
            self.manager.read_cache().write_cache(),
            guard,
            &record,
        )?;
        if !guard.is_retained() {
            guard.retain_in(&self.retained);
        }
        self.applied.push((lsn, record));
        self.last_lsn = lsn;
        Ok(lsn)
    }

    pub fn write_bytes(
        &mut self,
        guard: &mut PageWriteGuard,
        offset: usize,
        data: &[u8],
    ) -> StorageResult<Lsn> {
        let operation = PageOperation::write_bytes(guard.payload(), offset, data)?;
        self.apply(guard, operation)
    }

    pub fn insert_bytes(
        &mut self,
        guard: &mut PageWriteGuard,
        offset: usize,
        region_end: usize,
        data: &[u8],
    ) -> StorageResult<Lsn> {
        let operation = PageOperation::insert_bytes(guard.payload(), offset, region_end, data)?;
        self.apply(guard, operation)
    }

    pub fn remove_bytes(
        &mut self,
        guard: &mut PageWriteGuard,
        offset: usize,
        region_end: usize,
        len: usize,
    ) -> StorageResult<Lsn> {
        let operation = PageOperation::remove_bytes(guard.payload(), offset, region_end, len)?;
        self.apply(guard, operation)
    }

    pub fn add_to_counter(
        &mut self,
        guard: &mut PageWriteGuard,
        offset: usize,
        delta: i64,
    ) -> StorageResult<Lsn> {
        let operation = PageOperation::add_to_counter(guard.payload(), offset, delta)?;
        self.apply(guard, operation)
    }

    pub fn fill_bytes(
        &mut self,
        guard: &mut PageWriteGuard,
        offset: usize,
        len: usize,
        value: u8,
    ) -> StorageResult<Lsn> {
        let operation = PageOperation::fill_bytes(guard.payload(), offset, len, value)?;
        self.apply(guard, operation)
    }

    /// Log an opaque record on behalf of a higher-level component.
    pub fn log_component_operation(
        &mut self,
        component: &str,
        payload: &[u8],
    ) -> StorageResult<Lsn> {
        let lsn = self.manager.wal().append(&WalRecord::ComponentOperation {
            op_id: self.id,
            component: component.to_string(),
            payload: payload.to_vec(),
        })?;
        self.last_lsn = lsn;
        Ok(lsn)
    }

    /// Take the exclusive lock named `name` until this operation ends.
    pub fn lock_component(&mut self, name: &str) {
        if self.holds_component_lock(name) {
            return;
        }
        let guard = self.manager.component_lock(name);
        self.component_locks.push((name.to_string(), guard));
    }

    /// Take the exclusive lock named `name` if it is free. Returns whether
    /// this operation holds it afterwards.
    pub fn try_lock_component(&mut self, name: &str) -> bool {
        if self.holds_component_lock(name) {
            return true;
        }
        match self.manager.try_component_lock(name) {
            Some(guard) => {
                self.component_locks.push((name.to_string(), guard));
                true
            }
            None => false,
        }
    }

    pub fn holds_component_lock(&self, name: &str) -> bool {
        self.component_locks.iter().any(|(held, _)| held == name)
    }

    /// Run `body` as part of this operation. A failing body marks the whole
    /// operation rollback-only.
    pub fn nested<T, E, F>(&mut self, body: F) -> Result<T, E>
    where
        F: FnOnce(&mut AtomicOperation) -> Result<T, E>,
    {
        self.depth += 1;
        let result = body(self);
        self.depth -= 1;
        if result.is_err() {
            self.rollback_only = true;
        }
        result
    }

    /// Durably commit. A rollback-only operation is rolled back instead and
    /// reported as [`StorageError::RollbackOnly`].
    pub fn commit(mut self) -> StorageResult<Lsn> {
        if self.rollback_only {
            self.rollback_inner()?;
            return Err(StorageError::RollbackOnly(self.id.value()));
        }
        let lsn = self.manager.wal().append(&WalRecord::AtomicOperationCommit {
            op_id: self.id,
            commit_timestamp: now_millis(),
        })?;
        self.manager.wal().flush(lsn)?;
        self.finish(true);
        debug!(
            "Committed atomic operation {} ({} page operation(s))",
            self.id,
            self.applied.len()
        );
        Ok(lsn)
    }

    /// Undo every page operation in reverse order and log the rollback.
    pub fn rollback(mut self) -> StorageResult<()> {
        self.rollback_inner()
    }

    fn rollback_inner(&mut self) -> StorageResult<()> {
        let read_cache = self.manager.read_cache().clone();
        while let Some((lsn, record)) = self.applied.pop() {
            let mut guard = self.load_page_for_write(record.key.file_id, record.key.page_index)?;
            let compensation = PageOperationRecord {
                op_id: self.id,
                key: record.key,
                prev_page_lsn: guard.lsn(),
                compensates: Some(lsn),
                operation: record.operation,
            };
            self.last_lsn = log_and_apply(
                self.manager.wal(),
                read_cache.write_cache(),
                &mut guard,
                &compensation,
            )?;
        }
        let lsn = self
            .manager
            .wal()
            .append(&WalRecord::AtomicOperationRollback { op_id: self.id })?;
        self.last_lsn = lsn;
        self.finish(false);
        debug!("Rolled back atomic operation {}", self.id);
        Ok(())
    }

    fn finish(&mut self, committed: bool) {
        self.finished = true;
        self.release_pages();
        self.component_locks.clear();
        self.manager.finish(self.id, committed);
    }

    fn release_pages(&mut self) {
        let mut pages: Vec<PageWriteGuard> = self
            .retained
            .lock()
            .drain()
            .map(|(_, guard)| guard)
            .collect();
        for page in &mut pages {
            page.release_on_drop();
        }
        drop(pages);
    }
}

impl Drop for AtomicOperation {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!("Atomic operation {} dropped without commit, rolling back", self.id);
        if let Err(e) = self.rollback_inner() {
            error!("Rollback of atomic operation {} failed: {}", self.id, e);
            if !self.finished {
                // Recovery undoes whatever is left on next open
                self.finish(false);
            }
        }
    }
}
