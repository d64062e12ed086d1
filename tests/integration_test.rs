use std::fs::{self, OpenOptions};
use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;
use vibestore::conflict::{Document, FieldValue, VersionedRecord};
use vibestore::storage::cache::ExhaustionPolicy;
use vibestore::storage::page::{PAGE_HEADER_SIZE, PAGE_PAYLOAD_SIZE};
use vibestore::storage::{ChecksumMode, FileId, StorageError, StorageResult};
use vibestore::{CacheConfig, Engine, EngineConfig};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config(dir: &Path) -> EngineConfig {
    EngineConfig {
        cache: CacheConfig {
            capacity_pages: 64,
            exhaustion: ExhaustionPolicy::Fail,
            ..CacheConfig::default()
        },
        ..EngineConfig::new(dir)
    }
}

fn snapshot(engine: &Engine, file: FileId, pages: u64) -> Result<Vec<Vec<u8>>> {
    (0..pages)
        .map(|page| {
            let guard = engine.read_cache().load_for_read(file, page)?;
            Ok(guard.payload().to_vec())
        })
        .collect()
}

/// Commit a random overwrite of one page and return the bytes written.
fn commit_random_write(
    engine: &Engine,
    file: FileId,
    page: u64,
    rng: &mut StdRng,
) -> Result<(usize, Vec<u8>)> {
    let offset = rng.gen_range(0..PAGE_PAYLOAD_SIZE - 512);
    let data: Vec<u8> = (0..rng.gen_range(1..512)).map(|_| rng.gen()).collect();
    engine
        .atomic_operations()
        .execute_inside_atomic_operation(|op| -> StorageResult<()> {
            let mut guard = op.load_page_for_write(file, page)?;
            op.write_bytes(&mut guard, offset, &data)?;
            Ok(())
        })?;
    Ok((offset, data))
}

fn allocate_pages(engine: &Engine, file: FileId, pages: u64) -> Result<()> {
    engine
        .atomic_operations()
        .execute_inside_atomic_operation(|op| -> StorageResult<()> {
            for _ in 0..pages {
                op.allocate_new_page(file)?;
            }
            Ok(())
        })?;
    Ok(())
}

#[test]
fn test_committed_changes_survive_crash() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    let mut rng = StdRng::seed_from_u64(42);

    let expected = {
        let engine = Engine::open(config(dir.path()))?;
        let file = engine.add_file_with_checksum("crash.pages", ChecksumMode::StoreAndThrow)?;
        allocate_pages(&engine, file, 8)?;
        for i in 0..100 {
            commit_random_write(&engine, file, i % 8, &mut rng)?;
        }
        let expected = snapshot(&engine, file, 8)?;
        engine.abandon();
        expected
    };

    let engine = Engine::open(config(dir.path()))?;
    let file = engine.open_file("crash.pages")?;
    assert_eq!(engine.recovery_stats().operations_undone, 0);
    assert_eq!(snapshot(&engine, file, 8)?, expected);
    Ok(())
}

#[test]
fn test_rolled_back_and_unfinished_operations_leave_no_trace() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    let mut rng = StdRng::seed_from_u64(7);

    let expected = {
        let engine = Engine::open(config(dir.path()))?;
        let file = engine.add_file("losers.pages")?;
        allocate_pages(&engine, file, 4)?;
        for page in 0..4 {
            commit_random_write(&engine, file, page, &mut rng)?;
        }
        let expected = snapshot(&engine, file, 4)?;

        // Explicit rollback
        let mut op = engine.atomic_operations().start_atomic_operation()?;
        let mut guard = op.load_page_for_write(file, 0)?;
        op.fill_bytes(&mut guard, 0, 1024, 0xAA)?;
        drop(guard);
        op.rollback()?;

        // Failing body
        let failed = engine
            .atomic_operations()
            .execute_inside_atomic_operation(|op| -> StorageResult<()> {
                let mut guard = op.load_page_for_write(file, 1)?;
                op.insert_bytes(&mut guard, 10, 4000, b"never")?;
                op.write_bytes(&mut guard, PAGE_PAYLOAD_SIZE, b"out of bounds")?;
                Ok(())
            });
        assert!(matches!(failed, Err(StorageError::InvalidPageOperation(_))));

        // Still running at the crash, its records durable
        let mut op = engine.atomic_operations().start_atomic_operation()?;
        for page in 2..4 {
            let mut guard = op.load_page_for_write(file, page)?;
            op.remove_bytes(&mut guard, 0, 2048, 100)?;
            op.add_to_counter(&mut guard, 4000, -1)?;
        }
        engine.wal().flush_all()?;
        engine.flush()?;
        std::mem::forget(op);

        assert_eq!(snapshot(&engine, file, 2)?, expected[..2].to_vec());
        engine.abandon();
        expected
    };

    let engine = Engine::open(config(dir.path()))?;
    let file = engine.open_file("losers.pages")?;
    assert_eq!(engine.recovery_stats().operations_undone, 1);
    assert_eq!(engine.recovery_stats().compensations_written, 4);
    assert_eq!(snapshot(&engine, file, 4)?, expected);
    Ok(())
}

#[test]
fn test_uncommitted_changes_stay_private_across_rollback_and_crash() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;

    {
        let engine = Engine::open(config(dir.path()))?;
        let file = engine.add_file("private.pages")?;
        allocate_pages(&engine, file, 1)?;
        let ops = engine.atomic_operations().clone();
        ops.execute_inside_atomic_operation(|op| -> StorageResult<()> {
            let mut guard = op.load_page_for_write(file, 0)?;
            op.write_bytes(&mut guard, 0, b"base")?;
            Ok(())
        })?;

        let mut pending = ops.start_atomic_operation()?;
        let mut guard = pending.load_page_for_write(file, 0)?;
        pending.write_bytes(&mut guard, 0, b"AAAA")?;
        drop(guard);

        let reader = {
            let cache = engine.read_cache().clone();
            thread::spawn(move || -> StorageResult<Vec<u8>> {
                let guard = cache.load_for_read(file, 0)?;
                Ok(guard.payload()[..4].to_vec())
            })
        };
        let writer = {
            let ops = ops.clone();
            thread::spawn(move || {
                ops.execute_inside_atomic_operation(|op| -> StorageResult<()> {
                    let mut guard = op.load_page_for_write(file, 0)?;
                    op.write_bytes(&mut guard, 0, b"BBBB")?;
                    Ok(())
                })
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!reader.is_finished());
        assert!(!writer.is_finished());

        pending.rollback()?;
        writer.join().expect("writer panicked")?;
        let seen = reader.join().expect("reader panicked")?;
        assert!(seen == b"base" || seen == b"BBBB", "reader saw {:?}", seen);
        assert_eq!(&snapshot(&engine, file, 1)?[0][..4], b"BBBB");

        // Crash in the middle of an operation that overwrote the commit
        let mut loser = ops.start_atomic_operation()?;
        let mut guard = loser.load_page_for_write(file, 0)?;
        loser.write_bytes(&mut guard, 0, b"CCCC")?;
        drop(guard);
        engine.wal().flush_all()?;
        engine.flush()?;
        std::mem::forget(loser);
        engine.abandon();
    }

    let engine = Engine::open(config(dir.path()))?;
    let file = engine.open_file("private.pages")?;
    assert_eq!(engine.recovery_stats().operations_undone, 1);
    assert_eq!(&snapshot(&engine, file, 1)?[0][..4], b"BBBB");
    Ok(())
}

#[test]
fn test_repeated_recovery_is_idempotent() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    let mut rng = StdRng::seed_from_u64(99);

    {
        let engine = Engine::open(config(dir.path()))?;
        let file = engine.add_file("repeat.pages")?;
        allocate_pages(&engine, file, 2)?;
        for i in 0..20 {
            commit_random_write(&engine, file, i % 2, &mut rng)?;
        }
        let mut op = engine.atomic_operations().start_atomic_operation()?;
        let mut guard = op.load_page_for_write(file, 1)?;
        op.fill_bytes(&mut guard, 100, 300, 0x11)?;
        drop(guard);
        engine.wal().flush_all()?;
        std::mem::forget(op);
        engine.abandon();
    }

    let mut images = Vec::new();
    for _ in 0..3 {
        let engine = Engine::open(config(dir.path()))?;
        let file = engine.open_file("repeat.pages")?;
        images.push(snapshot(&engine, file, 2)?);
        engine.abandon();
    }
    assert_eq!(images[0], images[1]);
    assert_eq!(images[1], images[2]);
    Ok(())
}

#[test]
fn test_truncated_wal_tail_loses_only_the_last_commit() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;

    {
        let engine = Engine::open(config(dir.path()))?;
        let file = engine.add_file("tail.pages")?;
        allocate_pages(&engine, file, 1)?;
        let ops = engine.atomic_operations();
        ops.execute_inside_atomic_operation(|op| -> StorageResult<()> {
            let mut guard = op.load_page_for_write(file, 0)?;
            op.write_bytes(&mut guard, 0, b"first")?;
            Ok(())
        })?;
        ops.execute_inside_atomic_operation(|op| -> StorageResult<()> {
            let mut guard = op.load_page_for_write(file, 0)?;
            op.write_bytes(&mut guard, 0, b"second")?;
            Ok(())
        })?;
        engine.abandon();
    }

    // Tear the last record, which is the second commit
    let mut segments: Vec<_> = fs::read_dir(dir.path().join("wal"))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<_>>()?;
    segments.retain(|path| path.extension().is_some_and(|ext| ext == "log"));
    segments.sort();
    let last = segments.last().expect("a WAL segment");
    let file = OpenOptions::new().write(true).open(last)?;
    let len = file.metadata()?.len();
    file.set_len(len - 3)?;
    drop(file);

    let engine = Engine::open(config(dir.path()))?;
    let file = engine.open_file("tail.pages")?;
    assert_eq!(engine.recovery_stats().operations_undone, 1);
    let page = engine.read_cache().load_for_read(file, 0)?;
    assert_eq!(&page.payload()[..6], b"first\0");
    Ok(())
}

#[test]
fn test_checksum_modes_after_reopen() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;

    {
        let engine = Engine::open(config(dir.path()))?;
        for (name, mode) in [
            ("strict.pages", ChecksumMode::StoreAndThrow),
            ("lenient.pages", ChecksumMode::Store),
        ] {
            let file = engine.add_file_with_checksum(name, mode)?;
            engine
                .atomic_operations()
                .execute_inside_atomic_operation(|op| -> StorageResult<()> {
                    let (_, mut guard) = op.allocate_new_page(file)?;
                    op.fill_bytes(&mut guard, 0, 512, 0x42)?;
                    Ok(())
                })?;
        }
        engine.close()?;
    }

    for name in ["strict.pages", "lenient.pages"] {
        let path = dir.path().join(name);
        let mut bytes = fs::read(&path)?;
        bytes[PAGE_HEADER_SIZE + 7] ^= 0x04;
        fs::write(&path, bytes)?;
    }

    let engine = Engine::open(config(dir.path()))?;
    let strict = engine.open_file("strict.pages")?;
    assert!(matches!(
        engine.read_cache().load_for_read(strict, 0),
        Err(StorageError::ChecksumMismatch { .. })
    ));
    let lenient = engine.open_file("lenient.pages")?;
    let page = engine.read_cache().load_for_read(lenient, 0)?;
    assert_eq!(page.payload()[7], 0x42 ^ 0x04);
    Ok(())
}

#[test]
fn test_concurrent_operations_then_crash() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    const THREADS: u64 = 4;
    const INCREMENTS: u64 = 50;

    {
        let engine = Engine::open(config(dir.path()))?;
        let file = engine.add_file("counters.pages")?;
        allocate_pages(&engine, file, THREADS)?;

        thread::scope(|scope| -> Result<()> {
            let handles: Vec<_> = (0..THREADS)
                .map(|page| {
                    let ops = engine.atomic_operations().clone();
                    scope.spawn(move || -> StorageResult<()> {
                        for _ in 0..INCREMENTS {
                            ops.execute_inside_atomic_operation(|op| -> StorageResult<()> {
                                op.lock_component("counters");
                                let mut guard = op.load_page_for_write(file, page)?;
                                op.add_to_counter(&mut guard, 0, 1)?;
                                op.add_to_counter(&mut guard, 8, page as i64)?;
                                Ok(())
                            })?;
                        }
                        Ok(())
                    })
                })
                .collect();
            for handle in handles {
                handle.join().expect("worker panicked")?;
            }
            Ok(())
        })?;
        engine.abandon();
    }

    let engine = Engine::open(config(dir.path()))?;
    let file = engine.open_file("counters.pages")?;
    assert_eq!(
        engine.recovery_stats().operations_committed as u64,
        THREADS * INCREMENTS + 1
    );
    for (page, image) in snapshot(&engine, file, THREADS)?.iter().enumerate() {
        let count = u64::from_le_bytes(image[0..8].try_into()?);
        let sum = u64::from_le_bytes(image[8..16].try_into()?);
        assert_eq!(count, INCREMENTS);
        assert_eq!(sum, INCREMENTS * page as u64);
    }
    Ok(())
}

#[test]
fn test_checkpoint_bounds_recovery() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    let mut rng = StdRng::seed_from_u64(3);

    let (expected, redo_lsn) = {
        let mut config = config(dir.path());
        config.wal.max_segment_size = 8 * 1024;
        let engine = Engine::open(config)?;
        let file = engine.add_file("cp.pages")?;
        allocate_pages(&engine, file, 4)?;
        for i in 0..40 {
            commit_random_write(&engine, file, i % 4, &mut rng)?;
        }
        let segments_before = engine.wal().segments()?.len();
        let checkpoint = engine.checkpoint()?;
        assert!(engine.wal().segments()?.len() < segments_before);

        for i in 0..10 {
            commit_random_write(&engine, file, i % 4, &mut rng)?;
        }
        let expected = snapshot(&engine, file, 4)?;
        engine.abandon();
        (expected, checkpoint.redo_lsn)
    };

    let engine = Engine::open(config(dir.path()))?;
    let file = engine.open_file("cp.pages")?;
    assert_eq!(engine.recovery_stats().start_lsn, redo_lsn);
    assert_eq!(engine.recovery_stats().operations_committed, 10);
    assert_eq!(snapshot(&engine, file, 4)?, expected);
    Ok(())
}

#[test]
fn test_small_cache_prefers_hot_pages() -> Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    let mut config = config(dir.path());
    config.cache.capacity_pages = 4;
    let engine = Engine::open(config)?;
    let file = engine.add_file("hot.pages")?;
    allocate_pages(&engine, file, 10)?;
    engine.flush()?;

    let cache = engine.read_cache();
    cache.clear_file(file);
    // Page 0 becomes hot, the rest are touched once
    drop(cache.load_for_read(file, 0)?);
    drop(cache.load_for_read(file, 0)?);
    for page in 1..8 {
        drop(cache.load_for_read(file, page)?);
    }
    assert!(cache.is_resident(file, 0));
    assert!(!cache.is_resident(file, 1));
    assert_eq!(cache.resident_pages(), 4);
    Ok(())
}

#[test]
fn test_conflict_strategy_scenarios() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = Engine::open(config(dir.path()))?;
    let strategies = engine.conflict_strategies();
    let doc = |name: &str, value: i64| Document::new().with(name, FieldValue::Integer(value));

    // (a) matching versions
    let outcome = strategies.resolve(None)?.resolve(
        &VersionedRecord::document(3, doc("a", 1)),
        &VersionedRecord::document(3, doc("a", 2)),
    )?;
    assert_eq!(outcome.new_version, 4);

    // (b) stale version
    assert!(strategies
        .get("version")?
        .resolve(
            &VersionedRecord::document(3, doc("a", 1)),
            &VersionedRecord::document(2, doc("a", 2)),
        )
        .is_err());

    // (c) identical content
    let outcome = strategies.get("content")?.resolve(
        &VersionedRecord::document(3, doc("a", 1)),
        &VersionedRecord::document(2, doc("a", 1)),
    )?;
    assert_eq!(outcome.new_version, 4);
    assert_eq!(outcome.replacement, None);

    // (d) field-level merge
    let outcome = strategies.get("automerge")?.resolve(
        &VersionedRecord::document(3, doc("a", 1)),
        &VersionedRecord::document(2, doc("b", 2)),
    )?;
    let merged = Document::from_bytes(&outcome.replacement.unwrap_or_default())?;
    assert_eq!(merged, doc("a", 1).with("b", FieldValue::Integer(2)));

    assert!(matches!(
        strategies.get("nope"),
        Err(StorageError::UnknownConflictStrategy(_))
    ));
    Ok(())
}
