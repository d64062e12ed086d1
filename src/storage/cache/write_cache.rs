//! Write cache: owner of page files and of the dirty page table.
//!
//! Pages mutated under a logged operation are registered here and written
//! back later, either explicitly or by the background flusher. A page is never
//! written before the WAL is durable through the page's LSN.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};

use crate::config::CacheConfig;
use crate::storage::disk::{checksum, ChecksumMode, FileEntry, FileRegistry, PageFile};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::memory::ByteBufferPool;
use crate::storage::page::{shared_frame, FileId, PageKey, SharedFrame};
use crate::storage::wal::{Lsn, WriteAheadLog};

struct OpenFile {
    entry: FileEntry,
    file: Mutex<PageFile>,
}

struct DirtyEntry {
    frame: SharedFrame,
    /// LSN of the first mutation since the page was last written back.
    first_lsn: Lsn,
    last_lsn: Lsn,
}

struct Flusher {
    stop: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

#[derive(Clone)]
pub struct WriteCache {
    inner: Arc<WriteCacheInner>,
}

struct WriteCacheInner {
    dir: PathBuf,
    wal: Arc<WriteAheadLog>,
    pool: Arc<ByteBufferPool>,
    registry: Mutex<FileRegistry>,
    files: DashMap<FileId, Arc<OpenFile>>,
    dirty: DashMap<PageKey, DirtyEntry>,
    flush_interval: Duration,
    max_dirty_pages: usize,
    failure: Mutex<Option<String>>,
    flusher: Mutex<Option<Flusher>>,
    wake: Mutex<bool>,
    wake_cond: Condvar,
}

impl WriteCache {
    /// Open the page files registered in `dir`.
    pub fn open(
        dir: &Path,
        wal: Arc<WriteAheadLog>,
        pool: Arc<ByteBufferPool>,
        config: &CacheConfig,
    ) -> StorageResult<Self> {
        fs::create_dir_all(dir)?;
        let registry = FileRegistry::load_or_create(dir)?;

        let files = DashMap::new();
        for entry in registry.entries() {
            let path = dir.join(&entry.name);
            let file = if path.exists() {
                PageFile::open(entry.id, &path)?
            } else {
                warn!(
                    "Page file {:?} is registered but missing, recreating it empty",
                    path
                );
                PageFile::create(entry.id, &path)?
            };
            files.insert(
                entry.id,
                Arc::new(OpenFile {
                    entry: entry.clone(),
                    file: Mutex::new(file),
                }),
            );
        }
        debug!("Write cache opened {} page file(s) in {:?}", files.len(), dir);

        Ok(Self {
            inner: Arc::new(WriteCacheInner {
                dir: dir.to_path_buf(),
                wal,
                pool,
                registry: Mutex::new(registry),
                files,
                dirty: DashMap::new(),
                flush_interval: config.flush_interval,
                max_dirty_pages: config.max_dirty_pages,
                failure: Mutex::new(None),
                flusher: Mutex::new(None),
                wake: Mutex::new(false),
                wake_cond: Condvar::new(),
            }),
        })
    }

    pub fn pool(&self) -> &Arc<ByteBufferPool> {
        &self.inner.pool
    }

    pub fn wal(&self) -> &Arc<WriteAheadLog> {
        &self.inner.wal
    }

    /// Fails once the background flusher has hit an error.
    pub fn check_failed(&self) -> StorageResult<()> {
        match self.inner.failure.lock().as_ref() {
            Some(message) => Err(StorageError::Durability(format!(
                "background page flush failed: {}",
                message
            ))),
            None => Ok(()),
        }
    }

    /// Create and register a new page file.
    pub fn add_file(&self, name: &str, checksum_mode: ChecksumMode) -> StorageResult<FileId> {
        let mut registry = self.inner.registry.lock();
        if registry.by_name(name).is_some() {
            return Err(StorageError::FileExists(name.to_string()));
        }
        let entry = registry.register(name, checksum_mode)?;
        let file = PageFile::create(entry.id, &self.inner.dir.join(name))?;
        let id = entry.id;
        self.inner.files.insert(
            id,
            Arc::new(OpenFile {
                entry,
                file: Mutex::new(file),
            }),
        );
        info!("Added page file {} as {} ({:?})", name, id, checksum_mode);
        Ok(id)
    }

    /// Resolve a registered file by name.
    pub fn open_file(&self, name: &str) -> StorageResult<FileId> {
        self.file_id(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))
    }

    pub fn file_id(&self, name: &str) -> Option<FileId> {
        self.inner.registry.lock().by_name(name).map(|entry| entry.id)
    }

    pub fn checksum_mode(&self, file_id: FileId) -> StorageResult<ChecksumMode> {
        Ok(self.file(file_id)?.entry.checksum_mode)
    }

    fn file(&self, file_id: FileId) -> StorageResult<Arc<OpenFile>> {
        self.inner
            .files
            .get(&file_id)
            .map(|file| Arc::clone(file.value()))
            .ok_or(StorageError::UnknownFileId(file_id))
    }

    /// Number of pages the file currently holds on disk.
    pub fn filled_up_to(&self, file_id: FileId) -> StorageResult<u64> {
        self.file(file_id)?.file.lock().num_pages()
    }

    /// Extend a file by one zeroed page and return the new page index.
    pub fn allocate(&self, file_id: FileId) -> StorageResult<u64> {
        self.check_failed()?;
        self.file(file_id)?.file.lock().allocate_page()
    }

    /// Return the frame of a page: the dirty frame if one is registered,
    /// otherwise a fresh copy read from disk and checked per the file's
    /// checksum mode. With `extend`, a page past the end of the file is
    /// created as a blank page instead of failing.
    pub fn load(&self, key: PageKey, extend: bool) -> StorageResult<SharedFrame> {
        self.check_failed()?;
        if let Some(entry) = self.inner.dirty.get(&key) {
            return Ok(Arc::clone(&entry.frame));
        }

        let open = self.file(key.file_id)?;
        let mut buffer = self.inner.pool.acquire(false);
        {
            let mut file = open.file.lock();
            if key.page_index >= file.num_pages()? {
                if !extend {
                    return Err(StorageError::PageNotFound(key));
                }
                file.truncate(key.page_index + 1)?;
            }
            file.read_page(key.page_index, &mut buffer)?;
        }
        checksum::verify(key, &buffer, open.entry.checksum_mode)?;
        Ok(shared_frame(buffer))
    }

    /// Record that `frame` was mutated by the logged change at `lsn`. The
    /// caller holds the frame's write lock.
    pub fn register_dirty(&self, key: PageKey, frame: &SharedFrame, lsn: Lsn) -> StorageResult<()> {
        self.check_failed()?;
        let dirty_pages = {
            let mut entry = self.inner.dirty.entry(key).or_insert_with(|| DirtyEntry {
                frame: Arc::clone(frame),
                first_lsn: lsn,
                last_lsn: lsn,
            });
            entry.frame = Arc::clone(frame);
            entry.last_lsn = entry.last_lsn.max(lsn);
            drop(entry);
            self.inner.dirty.len()
        };
        if dirty_pages > self.inner.max_dirty_pages {
            self.wake_flusher();
        }
        Ok(())
    }

    pub fn is_dirty(&self, key: PageKey) -> bool {
        self.inner.dirty.contains_key(&key)
    }

    pub fn dirty_pages(&self) -> usize {
        self.inner.dirty.len()
    }

    /// Oldest LSN whose effect may not be on disk yet.
    pub fn min_dirty_lsn(&self) -> Option<Lsn> {
        self.inner.dirty.iter().map(|entry| entry.first_lsn).min()
    }

    /// Write one page image back without syncing. Returns the page LSN that
    /// was written, or None if the page is not dirty or is latched by a
    /// writer. A latched page stays dirty for a later pass.
    fn write_back(&self, key: PageKey) -> StorageResult<Option<Lsn>> {
        let Some(frame) = self.inner.dirty.get(&key).map(|entry| Arc::clone(&entry.frame)) else {
            return Ok(None);
        };

        let (mut image, page_lsn) = {
            let Some(guard) = frame.try_read() else {
                debug!("Skipping write-back of latched page {}", key);
                return Ok(None);
            };
            (self.inner.pool.acquire_copy(guard.data()), guard.lsn())
        };

        // Write-ahead rule
        self.inner.wal.flush(page_lsn)?;

        let open = self.file(key.file_id)?;
        checksum::stamp(&mut image, open.entry.checksum_mode)?;
        open.file.lock().write_page(key.page_index, &image)?;
        Ok(Some(page_lsn))
    }

    /// Drop the dirty entry unless a newer mutation arrived after `written`.
    fn mark_clean(&self, key: PageKey, written: Lsn) {
        self.inner
            .dirty
            .remove_if(&key, |_, entry| entry.last_lsn <= written);
    }

    pub fn flush_page(&self, key: PageKey) -> StorageResult<bool> {
        self.check_failed()?;
        let Some(written) = self.write_back(key)? else {
            return Ok(false);
        };
        self.file(key.file_id)?.file.lock().sync()?;
        self.mark_clean(key, written);
        Ok(true)
    }

    /// Write back every dirty page of one file.
    pub fn flush_file(&self, file_id: FileId) -> StorageResult<usize> {
        self.flush_matching(|key| key.file_id == file_id)
    }

    pub fn flush_all(&self) -> StorageResult<usize> {
        self.flush_matching(|_| true)
    }

    fn flush_matching<F: Fn(&PageKey) -> bool>(&self, filter: F) -> StorageResult<usize> {
        self.check_failed()?;
        let mut keys: Vec<PageKey> = self
            .inner
            .dirty
            .iter()
            .map(|entry| *entry.key())
            .filter(|key| filter(key))
            .collect();
        keys.sort_unstable();

        let mut written: BTreeMap<FileId, Vec<(PageKey, Lsn)>> = BTreeMap::new();
        for key in keys {
            if let Some(lsn) = self.write_back(key)? {
                written.entry(key.file_id).or_default().push((key, lsn));
            }
        }

        let mut count = 0;
        for (file_id, pages) in written {
            self.file(file_id)?.file.lock().sync()?;
            for (key, lsn) in pages {
                self.mark_clean(key, lsn);
                count += 1;
            }
        }
        Ok(count)
    }

    /// Drop every page of a file, on disk and in the dirty table.
    pub fn truncate_file(&self, file_id: FileId) -> StorageResult<()> {
        let open = self.file(file_id)?;
        self.inner.dirty.retain(|key, _| key.file_id != file_id);
        open.file.lock().truncate(0)?;
        info!("Truncated page file {}", open.entry.name);
        Ok(())
    }

    /// Start the background flusher thread.
    pub fn start_flusher(&self) -> StorageResult<()> {
        let mut flusher = self.inner.flusher.lock();
        if flusher.is_some() {
            return Ok(());
        }
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let target: Weak<WriteCacheInner> = Arc::downgrade(&self.inner);
        let interval = self.inner.flush_interval;
        let handle = thread::Builder::new()
            .name("vibestore-flush".into())
            .spawn(move || flusher_loop(target, thread_stop, interval))?;
        *flusher = Some(Flusher { stop, handle });
        Ok(())
    }

    /// Stop the background flusher, waiting for an in-flight pass.
    pub fn stop_flusher(&self) {
        let Some(flusher) = self.inner.flusher.lock().take() else {
            return;
        };
        flusher.stop.store(true, Ordering::Release);
        self.wake_flusher();
        if flusher.handle.join().is_err() {
            error!("Background flusher panicked");
        }
    }

    fn wake_flusher(&self) {
        *self.inner.wake.lock() = true;
        self.inner.wake_cond.notify_all();
    }

    /// Stop the flusher and write back everything.
    pub fn close(&self) -> StorageResult<()> {
        self.stop_flusher();
        self.flush_all()?;
        Ok(())
    }
}

fn flusher_loop(target: Weak<WriteCacheInner>, stop: Arc<AtomicBool>, interval: Duration) {
    loop {
        let Some(inner) = target.upgrade() else {
            break;
        };
        {
            let mut woken = inner.wake.lock();
            if !*woken && !stop.load(Ordering::Acquire) {
                inner.wake_cond.wait_for(&mut woken, interval);
            }
            *woken = false;
        }
        if stop.load(Ordering::Acquire) {
            break;
        }

        let cache = WriteCache { inner };
        match cache.flush_all() {
            Ok(0) => {}
            Ok(pages) => debug!("Background flush wrote {} page(s)", pages),
            Err(e) => {
                error!("Background flush failed: {}", e);
                *cache.inner.failure.lock() = Some(e.to_string());
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomic::OperationId;
    use crate::storage::page::PAGE_HEADER_SIZE;
    use crate::storage::wal::{WalConfig, WalRecord};
    use crate::storage::PAGE_SIZE;
    use anyhow::Result;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        wal: Arc<WriteAheadLog>,
        cache: WriteCache,
    }

    fn open_cache(dir: &Path, config: &CacheConfig) -> Result<WriteCache> {
        let wal = Arc::new(WriteAheadLog::open(WalConfig {
            wal_dir: dir.join("wal"),
            max_segment_size: 1024 * 1024,
            sync_on_flush: false,
        })?);
        let pool = ByteBufferPool::new(PAGE_SIZE, 16);
        Ok(WriteCache::open(&dir.join("data"), wal, pool, config)?)
    }

    fn fixture(config: CacheConfig) -> Result<Fixture> {
        let dir = TempDir::new()?;
        let cache = open_cache(dir.path(), &config)?;
        Ok(Fixture {
            wal: Arc::clone(cache.wal()),
            dir,
            cache,
        })
    }

    /// Mutate a loaded page the way a logged operation would.
    fn dirty_page(cache: &WriteCache, key: PageKey, byte: u8) -> Result<Lsn> {
        let frame = cache.load(key, true)?;
        let lsn = cache.wal().append(&WalRecord::AtomicOperationStart {
            op_id: OperationId::new(byte as u64),
        })?;
        let mut guard = frame.write();
        guard.payload_mut()[0] = byte;
        guard.set_lsn(lsn);
        cache.register_dirty(key, &frame, lsn)?;
        Ok(lsn)
    }

    #[test]
    fn test_add_and_open_files() -> Result<()> {
        let f = fixture(CacheConfig::default())?;
        let id = f.cache.add_file("users.pages", ChecksumMode::StoreAndThrow)?;
        assert_eq!(f.cache.open_file("users.pages")?, id);
        assert_eq!(f.cache.checksum_mode(id)?, ChecksumMode::StoreAndThrow);
        assert!(matches!(
            f.cache.add_file("users.pages", ChecksumMode::Off),
            Err(StorageError::FileExists(_))
        ));
        assert!(matches!(
            f.cache.open_file("missing"),
            Err(StorageError::FileNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_flush_respects_write_ahead_rule() -> Result<()> {
        let f = fixture(CacheConfig::default())?;
        let id = f.cache.add_file("a", ChecksumMode::Store)?;
        let key = PageKey::new(id, 0);

        let lsn = dirty_page(&f.cache, key, 7)?;
        assert!(f.wal.flushed_lsn() < lsn);
        assert_eq!(f.cache.min_dirty_lsn(), Some(lsn));

        assert!(f.cache.flush_page(key)?);
        assert!(f.wal.flushed_lsn() >= lsn);
        assert!(!f.cache.is_dirty(key));
        assert_eq!(f.cache.min_dirty_lsn(), None);

        let frame = f.cache.load(key, false)?;
        let guard = frame.read();
        assert_eq!(guard.payload()[0], 7);
        assert_eq!(guard.lsn(), lsn);
        Ok(())
    }

    #[test]
    fn test_flush_skips_latched_page() -> Result<()> {
        let f = fixture(CacheConfig::default())?;
        let id = f.cache.add_file("a", ChecksumMode::Store)?;
        let latched = PageKey::new(id, 0);
        let free = PageKey::new(id, 1);
        dirty_page(&f.cache, latched, 1)?;
        dirty_page(&f.cache, free, 2)?;

        let frame = f.cache.load(latched, false)?;
        let writer = frame.write();
        assert_eq!(f.cache.flush_all()?, 1);
        assert!(f.cache.is_dirty(latched));
        assert!(!f.cache.is_dirty(free));
        assert!(!f.cache.flush_page(latched)?);

        drop(writer);
        assert_eq!(f.cache.flush_all()?, 1);
        assert_eq!(f.cache.dirty_pages(), 0);
        Ok(())
    }

    #[test]
    fn test_load_returns_dirty_frame() -> Result<()> {
        let f = fixture(CacheConfig::default())?;
        let id = f.cache.add_file("a", ChecksumMode::Store)?;
        let key = PageKey::new(id, 2);

        dirty_page(&f.cache, key, 3)?;
        let first = f.cache.load(key, false)?;
        let second = f.cache.load(key, false)?;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(f.cache.filled_up_to(id)?, 3);
        Ok(())
    }

    #[test]
    fn test_missing_page_without_extend() -> Result<()> {
        let f = fixture(CacheConfig::default())?;
        let id = f.cache.add_file("a", ChecksumMode::Store)?;
        assert!(matches!(
            f.cache.load(PageKey::new(id, 0), false),
            Err(StorageError::PageNotFound(_))
        ));
        assert!(matches!(
            f.cache.load(PageKey::new(99, 0), false),
            Err(StorageError::UnknownFileId(99))
        ));
        Ok(())
    }

    #[test]
    fn test_checksum_modes_on_corrupted_page() -> Result<()> {
        let f = fixture(CacheConfig::default())?;
        let strict = f.cache.add_file("strict", ChecksumMode::StoreAndThrow)?;
        let lenient = f.cache.add_file("lenient", ChecksumMode::Store)?;

        for id in [strict, lenient] {
            dirty_page(&f.cache, PageKey::new(id, 0), 9)?;
        }
        f.cache.flush_all()?;

        // Flip one bit of the payload on disk
        for name in ["strict", "lenient"] {
            let path = f.dir.path().join("data").join(name);
            let mut bytes = fs::read(&path)?;
            bytes[PAGE_HEADER_SIZE + 100] ^= 0x01;
            fs::write(&path, bytes)?;
        }

        assert!(matches!(
            f.cache.load(PageKey::new(strict, 0), false),
            Err(StorageError::ChecksumMismatch { .. })
        ));
        let frame = f.cache.load(PageKey::new(lenient, 0), false)?;
        assert_eq!(frame.read().payload()[100], 0x01);
        Ok(())
    }

    #[test]
    fn test_reopen_keeps_registry_and_pages() -> Result<()> {
        let dir = TempDir::new()?;
        let key = {
            let cache = open_cache(dir.path(), &CacheConfig::default())?;
            let id = cache.add_file("kept", ChecksumMode::StoreAndVerify)?;
            let key = PageKey::new(id, 1);
            dirty_page(&cache, key, 42)?;
            cache.close()?;
            key
        };

        let cache = open_cache(dir.path(), &CacheConfig::default())?;
        assert_eq!(cache.file_id("kept"), Some(key.file_id));
        assert_eq!(cache.load(key, false)?.read().payload()[0], 42);
        Ok(())
    }

    #[test]
    fn test_truncate_file() -> Result<()> {
        let f = fixture(CacheConfig::default())?;
        let id = f.cache.add_file("a", ChecksumMode::Store)?;
        assert_eq!(f.cache.allocate(id)?, 0);
        assert_eq!(f.cache.allocate(id)?, 1);
        dirty_page(&f.cache, PageKey::new(id, 1), 1)?;

        f.cache.truncate_file(id)?;
        assert_eq!(f.cache.filled_up_to(id)?, 0);
        assert_eq!(f.cache.dirty_pages(), 0);
        Ok(())
    }

    #[test]
    fn test_background_flusher_writes_pages() -> Result<()> {
        let f = fixture(CacheConfig {
            flush_interval: Duration::from_millis(10),
            ..CacheConfig::default()
        })?;
        let id = f.cache.add_file("a", ChecksumMode::Store)?;
        f.cache.start_flusher()?;

        for page in 0..4 {
            dirty_page(&f.cache, PageKey::new(id, page), page as u8 + 1)?;
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while f.cache.dirty_pages() > 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        f.cache.stop_flusher();
        assert_eq!(f.cache.dirty_pages(), 0);
        f.cache.check_failed()?;
        Ok(())
    }
}
