//! Read cache: bounded set of resident page frames with 2Q replacement.
//!
//! Callers pin pages through [`PageReadGuard`] / [`PageWriteGuard`]. A pinned
//! page is never evicted; the guard releases its pin when dropped. Evicting a
//! dirty page is safe because the write cache keeps its frame until the page
//! has been written back.
//!
//! A write guard can be bound to a set of [`RetainedPages`]. Dropping a bound
//! guard moves its latch and pin into the set instead of releasing them, so
//! an atomic operation keeps every page it changed locked until it ends.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use log::debug;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Condvar, Mutex, RawRwLock};
use serde::{Deserialize, Serialize};

use super::replacer::Replacer;
use super::two_q::TwoQueueReplacer;
use super::write_cache::WriteCache;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{FileId, PageFrame, PageKey, SharedFrame};

/// What to do when every resident page is pinned and a new one is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExhaustionPolicy {
    Fail,
    /// Wait for a release, up to the timeout.
    Block { timeout: Duration },
}

impl Default for ExhaustionPolicy {
    fn default() -> Self {
        ExhaustionPolicy::Block {
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub resident: usize,
}

/// Write latches parked by an atomic operation, keyed by page.
pub(crate) type RetainedPages = Arc<Mutex<HashMap<PageKey, PageWriteGuard>>>;

struct PolicyState {
    replacer: Box<dyn Replacer>,
    /// Slots claimed by misses that are still loading.
    reserved: usize,
}

#[derive(Clone)]
pub struct ReadCache {
    inner: Arc<ReadCacheInner>,
}

struct ReadCacheInner {
    entries: DashMap<PageKey, SharedFrame>,
    policy: Mutex<PolicyState>,
    released: Condvar,
    write_cache: WriteCache,
    capacity: usize,
    exhaustion: ExhaustionPolicy,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ReadCache {
    pub fn new(write_cache: WriteCache, capacity: usize, exhaustion: ExhaustionPolicy) -> Self {
        let capacity = capacity.max(1);
        Self::with_replacer(
            write_cache,
            Box::new(TwoQueueReplacer::new(capacity)),
            capacity,
            exhaustion,
        )
    }

    pub fn with_replacer(
        write_cache: WriteCache,
        replacer: Box<dyn Replacer>,
        capacity: usize,
        exhaustion: ExhaustionPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(ReadCacheInner {
                entries: DashMap::new(),
                policy: Mutex::new(PolicyState {
                    replacer,
                    reserved: 0,
                }),
                released: Condvar::new(),
                write_cache,
                capacity,
                exhaustion,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
            }),
        }
    }

    pub fn write_cache(&self) -> &WriteCache {
        &self.inner.write_cache
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn load_for_read(&self, file_id: FileId, page_index: u64) -> StorageResult<PageReadGuard> {
        let key = PageKey::new(file_id, page_index);
        let frame = self.pin(key, false)?;
        Ok(PageReadGuard {
            cache: self.clone(),
            key,
            latch: Some(ReadLatch::Shared(frame.read_arc())),
        })
    }

    pub fn load_for_write(
        &self,
        file_id: FileId,
        page_index: u64,
    ) -> StorageResult<PageWriteGuard> {
        self.load_for_write_inner(PageKey::new(file_id, page_index), false)
    }

    /// Load for write, creating the page if it lies past the end of its file.
    /// Used by recovery, where the file may be shorter than the log implies.
    pub(crate) fn load_for_write_extending(&self, key: PageKey) -> StorageResult<PageWriteGuard> {
        self.load_for_write_inner(key, true)
    }

    fn load_for_write_inner(&self, key: PageKey, extend: bool) -> StorageResult<PageWriteGuard> {
        let frame = self.pin(key, extend)?;
        Ok(PageWriteGuard {
            cache: self.clone(),
            key,
            frame: Arc::clone(&frame),
            guard: Some(frame.write_arc()),
            retainer: None,
        })
    }

    /// Extend `file_id` by one page and return it loaded for write.
    pub fn allocate_new_page(&self, file_id: FileId) -> StorageResult<(u64, PageWriteGuard)> {
        let page_index = self.inner.write_cache.allocate(file_id)?;
        let guard = self.load_for_write_inner(PageKey::new(file_id, page_index), true)?;
        Ok((page_index, guard))
    }

    pub fn release_from_read(&self, guard: PageReadGuard) {
        drop(guard);
    }

    pub fn release_from_write(&self, guard: PageWriteGuard) {
        drop(guard);
    }

    /// Pin `key`, loading it on a miss. The frame lock is not taken here.
    fn pin(&self, key: PageKey, extend: bool) -> StorageResult<SharedFrame> {
        loop {
            {
                let mut policy = self.inner.policy.lock();
                if let Some(frame) = self.inner.entries.get(&key).map(|e| Arc::clone(e.value())) {
                    policy.replacer.record_access(key);
                    policy.replacer.pin(key);
                    self.inner.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(frame);
                }
                self.reserve_slot(&mut policy)?;
            }
            self.inner.misses.fetch_add(1, Ordering::Relaxed);

            // Load under the map entry so one page is never loaded twice
            let loaded = match self.inner.entries.entry(key) {
                dashmap::mapref::entry::Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
                dashmap::mapref::entry::Entry::Vacant(entry) => self
                    .inner
                    .write_cache
                    .load(key, extend)
                    .map(|frame| Arc::clone(entry.insert(frame).value())),
            };

            let mut policy = self.inner.policy.lock();
            policy.reserved -= 1;
            let frame = match loaded {
                Ok(frame) => frame,
                Err(e) => {
                    self.inner.released.notify_all();
                    return Err(e);
                }
            };
            // Someone may have evicted the page between insert and pin
            let still_resident = self
                .inner
                .entries
                .get(&key)
                .is_some_and(|e| Arc::ptr_eq(e.value(), &frame));
            if still_resident {
                policy.replacer.record_access(key);
                policy.replacer.pin(key);
                return Ok(frame);
            }
        }
    }

    /// Make room for one more resident page, evicting or waiting as the
    /// exhaustion policy says.
    fn reserve_slot(
        &self,
        policy: &mut parking_lot::MutexGuard<'_, PolicyState>,
    ) -> StorageResult<()> {
        let deadline = match self.inner.exhaustion {
            ExhaustionPolicy::Block { timeout } => Some(Instant::now() + timeout),
            ExhaustionPolicy::Fail => None,
        };
        loop {
            if self.inner.entries.len() + policy.reserved < self.inner.capacity {
                policy.reserved += 1;
                return Ok(());
            }
            if let Some(victim) = policy.replacer.evict() {
                self.inner.entries.remove(&victim);
                self.inner.evictions.fetch_add(1, Ordering::Relaxed);
                debug!("Evicted page {}", victim);
                continue;
            }
            let exhausted = StorageError::CacheExhausted {
                capacity: self.inner.capacity,
            };
            match deadline {
                None => return Err(exhausted),
                Some(deadline) => {
                    if self.inner.released.wait_until(policy, deadline).timed_out() {
                        return Err(exhausted);
                    }
                }
            }
        }
    }

    fn unpin(&self, key: PageKey) {
        let mut policy = self.inner.policy.lock();
        policy.replacer.unpin(key);
        self.inner.released.notify_all();
    }

    /// Drop every unpinned resident page of a file. Returns how many pages
    /// were dropped.
    pub fn clear_file(&self, file_id: FileId) -> usize {
        let mut policy = self.inner.policy.lock();
        let keys: Vec<PageKey> = self
            .inner
            .entries
            .iter()
            .map(|e| *e.key())
            .filter(|key| key.file_id == file_id)
            .collect();
        let mut dropped = 0;
        for key in keys {
            if policy.replacer.is_pinned(key) {
                continue;
            }
            policy.replacer.remove(key);
            self.inner.entries.remove(&key);
            dropped += 1;
        }
        self.inner.released.notify_all();
        dropped
    }

    /// Drop a file's cached pages and cut the file to zero pages.
    pub fn truncate_file(&self, file_id: FileId) -> StorageResult<()> {
        self.clear_file(file_id);
        self.inner.write_cache.truncate_file(file_id)
    }

    pub fn resident_pages(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_resident(&self, file_id: FileId, page_index: u64) -> bool {
        self.inner
            .entries
            .contains_key(&PageKey::new(file_id, page_index))
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            evictions: self.inner.evictions.load(Ordering::Relaxed),
            resident: self.inner.entries.len(),
        }
    }
}

enum ReadLatch {
    Shared(ArcRwLockReadGuard<RawRwLock, PageFrame>),
    /// Read access through a latch the reading operation already owns.
    Retained(PageWriteGuard),
}

/// Shared pin on a page. Many readers may hold the same page.
pub struct PageReadGuard {
    cache: ReadCache,
    key: PageKey,
    latch: Option<ReadLatch>,
}

impl PageReadGuard {
    pub fn key(&self) -> PageKey {
        self.key
    }

    /// Read through a write latch held by the caller. Dropping the read guard
    /// drops `guard`, which hands the latch back to its retainer.
    pub(crate) fn from_retained(guard: PageWriteGuard) -> Self {
        PageReadGuard {
            cache: guard.cache.clone(),
            key: guard.key,
            latch: Some(ReadLatch::Retained(guard)),
        }
    }
}

impl Deref for PageReadGuard {
    type Target = PageFrame;

    fn deref(&self) -> &Self::Target {
        match self.latch.as_ref() {
            Some(ReadLatch::Shared(guard)) => guard,
            Some(ReadLatch::Retained(guard)) => guard,
            None => unreachable!("page guard used after release"),
        }
    }
}

impl Drop for PageReadGuard {
    fn drop(&mut self) {
        match self.latch.take() {
            Some(ReadLatch::Shared(guard)) => {
                drop(guard);
                self.cache.unpin(self.key);
            }
            Some(ReadLatch::Retained(guard)) => drop(guard),
            None => {}
        }
    }
}

/// Exclusive pin on a page. Mutation goes through logged page operations;
/// the raw frame is only reachable inside the crate.
pub struct PageWriteGuard {
    cache: ReadCache,
    key: PageKey,
    frame: SharedFrame,
    guard: Option<ArcRwLockWriteGuard<RawRwLock, PageFrame>>,
    retainer: Option<RetainedPages>,
}

impl PageWriteGuard {
    pub fn key(&self) -> PageKey {
        self.key
    }

    /// Park the latch in `retained` when this guard is dropped.
    pub(crate) fn retain_in(&mut self, retained: &RetainedPages) {
        self.retainer = Some(Arc::clone(retained));
    }

    /// Release the latch on drop even if the guard was bound to a retainer.
    pub(crate) fn release_on_drop(&mut self) {
        self.retainer = None;
    }

    pub(crate) fn is_retained(&self) -> bool {
        self.retainer.is_some()
    }

    pub(crate) fn shared_frame(&self) -> &SharedFrame {
        &self.frame
    }

    pub(crate) fn frame_mut(&mut self) -> &mut PageFrame {
        match self.guard.as_mut() {
            Some(guard) => guard,
            None => unreachable!("page guard used after release"),
        }
    }
}

impl Deref for PageWriteGuard {
    type Target = PageFrame;

    fn deref(&self) -> &Self::Target {
        match self.guard.as_ref() {
            Some(guard) => guard,
            None => unreachable!("page guard used after release"),
        }
    }
}

impl Drop for PageWriteGuard {
    fn drop(&mut self) {
        if let (Some(retainer), Some(guard)) = (self.retainer.take(), self.guard.take()) {
            // The pin moves along with the latch
            let parked = PageWriteGuard {
                cache: self.cache.clone(),
                key: self.key,
                frame: Arc::clone(&self.frame),
                guard: Some(guard),
                retainer: None,
            };
            retainer.lock().insert(self.key, parked);
            return;
        }
        self.guard.take();
        self.cache.unpin(self.key);
    }
}
