//! Atomic operation manager: lifecycle, component locks and freezing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, info, warn};
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};

use super::freezer::{FreezeId, OperationsFreezer};
use super::id::{OperationId, OperationIdGenerator};
use super::operation::AtomicOperation;
use super::state::{OperationInfo, OperationState};
use crate::storage::cache::ReadCache;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::wal::{Lsn, WalRecord, WriteAheadLog};

/// Shared hold on a named component lock, released on drop.
pub type ComponentReadLock = ArcRwLockReadGuard<RawRwLock, ()>;
pub(crate) type ComponentWriteLock = ArcRwLockWriteGuard<RawRwLock, ()>;

/// Leaves the component freezer when a component operation body returns or
/// unwinds.
struct ComponentOperationScope<'a>(&'a OperationsFreezer);

impl Drop for ComponentOperationScope<'_> {
    fn drop(&mut self) {
        self.0.end_operation();
    }
}

/// Starts atomic operations and tracks them until they finish.
#[derive(Clone)]
pub struct AtomicOperationsManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    wal: Arc<WriteAheadLog>,
    read_cache: ReadCache,
    id_generator: OperationIdGenerator,
    operations: DashMap<OperationId, OperationInfo>,
    recovered: AtomicBool,
    component_locks: DashMap<String, Arc<RwLock<()>>>,
    atomic_freezer: OperationsFreezer,
    component_freezer: OperationsFreezer,
}

impl AtomicOperationsManager {
    /// Create a manager that refuses work until [`mark_recovered`] is called.
    ///
    /// [`mark_recovered`]: AtomicOperationsManager::mark_recovered
    pub fn new(wal: Arc<WriteAheadLog>, read_cache: ReadCache) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                wal,
                read_cache,
                id_generator: OperationIdGenerator::new(),
                operations: DashMap::new(),
                recovered: AtomicBool::new(false),
                component_locks: DashMap::new(),
                atomic_freezer: OperationsFreezer::new(),
                component_freezer: OperationsFreezer::new(),
            }),
        }
    }

    pub fn wal(&self) -> &Arc<WriteAheadLog> {
        &self.inner.wal
    }

    pub fn read_cache(&self) -> &ReadCache {
        &self.inner.read_cache
    }

    /// Allow operations to start. Called once recovery has finished.
    pub fn mark_recovered(&self) {
        self.inner.recovered.store(true, Ordering::Release);
    }

    pub fn is_recovered(&self) -> bool {
        self.inner.recovered.load(Ordering::Acquire)
    }

    /// Make sure no id at or below `id` is handed out again.
    pub fn advance_ids_past(&self, id: OperationId) {
        self.inner.id_generator.advance_past(id);
    }

    /// Begin a new atomic operation. Blocks while operations are frozen.
    pub fn start_atomic_operation(&self) -> StorageResult<AtomicOperation> {
        if !self.is_recovered() {
            return Err(StorageError::RecoveryPending);
        }
        self.inner.atomic_freezer.start_operation();

        let id = self.inner.id_generator.next();
        // Registered before the start record so a concurrent checkpoint
        // never misses it; the end LSN is a lower bound of the start LSN.
        match self.inner.operations.entry(id) {
            Entry::Occupied(_) => panic!("Atomic operation id {} reused", id),
            Entry::Vacant(entry) => {
                entry.insert(OperationInfo::new(id, self.inner.wal.end_lsn()));
            }
        }

        let start = WalRecord::AtomicOperationStart { op_id: id };
        let start_lsn = match self.inner.wal.append(&start) {
            Ok(lsn) => lsn,
            Err(e) => {
                self.inner.operations.remove(&id);
                self.operation_ended();
                return Err(e);
            }
        };
        if let Some(mut info) = self.inner.operations.get_mut(&id) {
            info.start_lsn = start_lsn;
        }
        debug!("Started atomic operation {} at {}", id, start_lsn);
        Ok(AtomicOperation::new(self.clone(), id, start_lsn))
    }

    /// Run `body` in a new atomic operation, committing on `Ok` and rolling
    /// back on `Err`.
    pub fn execute_inside_atomic_operation<F, E>(&self, body: F) -> Result<(), E>
    where
        F: FnOnce(&mut AtomicOperation) -> Result<(), E>,
        E: From<StorageError>,
    {
        self.calculate_inside_atomic_operation(body)
    }

    /// Like [`execute_inside_atomic_operation`] but returns the body's value.
    ///
    /// [`execute_inside_atomic_operation`]: AtomicOperationsManager::execute_inside_atomic_operation
    pub fn calculate_inside_atomic_operation<F, T, E>(&self, body: F) -> Result<T, E>
    where
        F: FnOnce(&mut AtomicOperation) -> Result<T, E>,
        E: From<StorageError>,
    {
        let mut operation = self.start_atomic_operation()?;
        match body(&mut operation) {
            Ok(value) => {
                operation.commit()?;
                Ok(value)
            }
            Err(e) => {
                operation.rollback()?;
                Err(e)
            }
        }
    }

    /// Run `body` as a component operation inside `operation`: the
    /// component's exclusive lock is taken and held until `operation` ends.
    /// A failing body marks `operation` rollback-only.
    pub fn execute_inside_component_operation<F, E>(
        &self,
        operation: &mut AtomicOperation,
        component: &str,
        body: F,
    ) -> Result<(), E>
    where
        F: FnOnce(&mut AtomicOperation) -> Result<(), E>,
    {
        self.calculate_inside_component_operation(operation, component, body)
    }

    pub fn calculate_inside_component_operation<F, T, E>(
        &self,
        operation: &mut AtomicOperation,
        component: &str,
        body: F,
    ) -> Result<T, E>
    where
        F: FnOnce(&mut AtomicOperation) -> Result<T, E>,
    {
        operation.lock_component(component);
        self.run_component_operation(operation, component, body)
    }

    /// Like [`execute_inside_component_operation`] but gives up instead of
    /// waiting when another operation holds the component. Returns whether
    /// the body ran.
    ///
    /// [`execute_inside_component_operation`]: AtomicOperationsManager::execute_inside_component_operation
    pub fn try_execute_inside_component_operation<F, E>(
        &self,
        operation: &mut AtomicOperation,
        component: &str,
        body: F,
    ) -> Result<bool, E>
    where
        F: FnOnce(&mut AtomicOperation) -> Result<(), E>,
    {
        if !operation.try_lock_component(component) {
            debug!(
                "Component {} is busy, skipping operation in {}",
                component,
                operation.id()
            );
            return Ok(false);
        }
        self.run_component_operation(operation, component, body)?;
        Ok(true)
    }

    fn run_component_operation<F, T, E>(
        &self,
        operation: &mut AtomicOperation,
        component: &str,
        body: F,
    ) -> Result<T, E>
    where
        F: FnOnce(&mut AtomicOperation) -> Result<T, E>,
    {
        self.inner.component_freezer.start_operation();
        let _scope = ComponentOperationScope(&self.inner.component_freezer);
        let result = operation.nested(body);
        if result.is_err() {
            warn!(
                "Component operation on {} failed, atomic operation {} will roll back",
                component,
                operation.id()
            );
        }
        result
    }

    /// Record the end of an operation. Panics if `id` is unknown or already
    /// finished.
    pub(crate) fn finish(&self, id: OperationId, committed: bool) {
        {
            let mut info = self
                .inner
                .operations
                .get_mut(&id)
                .unwrap_or_else(|| panic!("Unknown atomic operation {}", id));
            if committed {
                info.commit();
            } else {
                info.roll_back();
            }
            debug!(
                "Atomic operation {} finished as {} after {:?}",
                id,
                info.state,
                info.duration()
            );
        }
        self.operation_ended();
    }

    fn operation_ended(&self) {
        self.inner.atomic_freezer.end_operation();
    }

    pub fn state(&self, id: OperationId) -> Option<OperationState> {
        self.inner.operations.get(&id).map(|info| info.state)
    }

    pub fn info(&self, id: OperationId) -> Option<OperationInfo> {
        self.inner.operations.get(&id).map(|info| info.clone())
    }

    pub fn active_operations(&self) -> Vec<OperationId> {
        let mut active: Vec<OperationId> = self
            .inner
            .operations
            .iter()
            .filter(|info| info.state.is_active())
            .map(|info| info.id)
            .collect();
        active.sort();
        active
    }

    /// Earliest start LSN among active operations.
    pub fn min_active_start_lsn(&self) -> Option<Lsn> {
        self.inner
            .operations
            .iter()
            .filter(|info| info.state.is_active())
            .map(|info| info.start_lsn)
            .min()
    }

    /// Forget finished operations. Returns how many were removed.
    pub fn cleanup_finished(&self) -> usize {
        let before = self.inner.operations.len();
        self.inner.operations.retain(|_, info| info.state.is_active());
        before - self.inner.operations.len()
    }

    /// Block new operations and wait until running ones have finished.
    /// Must not be called from a thread that holds an active operation.
    pub fn freeze_atomic_operations(&self) -> FreezeId {
        let id = self.inner.atomic_freezer.freeze();
        info!("Atomic operations frozen ({:?})", id);
        id
    }

    pub fn release_atomic_operations(&self, id: FreezeId) {
        if self.inner.atomic_freezer.release(id) {
            info!("Atomic operations released ({:?})", id);
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.atomic_freezer.is_frozen()
    }

    /// Block new component operations and wait until running ones have
    /// returned. Atomic operations themselves keep running.
    pub fn freeze_component_operations(&self) -> FreezeId {
        let id = self.inner.component_freezer.freeze();
        info!("Component operations frozen ({:?})", id);
        id
    }

    pub fn release_component_operations(&self, id: FreezeId) {
        if self.inner.component_freezer.release(id) {
            info!("Component operations released ({:?})", id);
        }
    }

    pub fn is_component_frozen(&self) -> bool {
        self.inner.component_freezer.is_frozen()
    }

    /// Take the shared lock of `component`. Any number of readers may hold
    /// it; an operation holding the exclusive lock keeps them out.
    pub fn acquire_read_lock(&self, component: &str) -> ComponentReadLock {
        self.component_rwlock(component).read_arc()
    }

    pub fn release_read_lock(&self, lock: ComponentReadLock) {
        drop(lock);
    }

    fn component_rwlock(&self, name: &str) -> Arc<RwLock<()>> {
        Arc::clone(
            self.inner
                .component_locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(RwLock::new(())))
                .value(),
        )
    }

    pub(crate) fn component_lock(&self, name: &str) -> ComponentWriteLock {
        self.component_rwlock(name).write_arc()
    }

    pub(crate) fn try_component_lock(&self, name: &str) -> Option<ComponentWriteLock> {
        self.component_rwlock(name).try_write_arc()
    }
}
