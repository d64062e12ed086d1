//! Write-ahead log manager.
//!
//! Appends only touch the in-memory tail: the record is framed, assigned the
//! next LSN and queued. Physical writes happen in [`WriteAheadLog::flush`],
//! where one caller at a time writes *every* queued record and fsyncs, while
//! concurrent callers wait and piggyback on that write (group commit).

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{BufMut, BytesMut};
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use super::reader::WalReader;
use super::record::WalRecord;
use super::Lsn;
use crate::storage::disk::PAGE_SIZE;
use crate::storage::error::{StorageError, StorageResult};

const WAL_FILE_PREFIX: &str = "wal_";
const WAL_FILE_EXTENSION: &str = ".log";

pub(crate) const SEGMENT_MAGIC: u32 = 0x5741_4C53;
pub(crate) const SEGMENT_FORMAT_VERSION: u32 = 1;
/// `[magic:u32][version:u32][page size:u32][segment index:u64]`
pub const SEGMENT_HEADER_SIZE: u64 = 20;

/// WAL configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalConfig {
    /// Directory where WAL segments are stored.
    pub wal_dir: PathBuf,
    /// A segment is rotated before it would grow past this size.
    pub max_segment_size: u64,
    /// Whether `flush` fsyncs segment files.
    pub sync_on_flush: bool,
}

impl Default for WalConfig {
    fn default() -> Self {
        WalConfig {
            wal_dir: PathBuf::from("wal"),
            max_segment_size: 128 * 1024 * 1024,
            sync_on_flush: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalStats {
    pub records_appended: u64,
    pub physical_flushes: u64,
}

/// Appended bytes not yet written, all belonging to one segment.
struct PendingChunk {
    segment: u64,
    start: u64,
    bytes: BytesMut,
}

struct TailState {
    segment: u64,
    /// Offset of the next record in the active segment.
    position: u64,
    pending: Vec<PendingChunk>,
    end_lsn: Lsn,
    records_appended: u64,
    closed: bool,
}

struct FlushState {
    flushed: Lsn,
    in_progress: bool,
    waiting: usize,
    physical_flushes: u64,
}

/// Open segment files, touched only by the thread performing a flush.
struct SegmentWriter {
    dir: PathBuf,
    files: BTreeMap<u64, File>,
}

impl SegmentWriter {
    fn file_for(&mut self, segment: u64) -> StorageResult<&mut File> {
        if !self.files.contains_key(&segment) {
            let path = segment_path(&self.dir, segment);
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;
            if file.metadata()?.len() == 0 {
                file.write_all(&segment_header(segment))?;
                debug!("Created WAL segment {:?}", path);
            }
            self.files.insert(segment, file);
        }
        self.files
            .get_mut(&segment)
            .ok_or_else(|| StorageError::Durability(format!("segment {} not open", segment)))
    }
}

pub struct WriteAheadLog {
    config: WalConfig,
    tail: Mutex<TailState>,
    flush_state: Mutex<FlushState>,
    flush_cond: Condvar,
    writer: Mutex<SegmentWriter>,
    failed: AtomicBool,
    /// Held by tests to stall a physical write between write and sync.
    #[cfg(test)]
    sync_gate: Mutex<()>,
}

impl WriteAheadLog {
    /// Open the log in `config.wal_dir`, creating the directory if needed.
    ///
    /// Existing segments are scanned; the first partial or corrupt record and
    /// everything after it is cut off. New records go to a fresh segment.
    pub fn open(config: WalConfig) -> StorageResult<Self> {
        fs::create_dir_all(&config.wal_dir)?;

        let mut last_lsn = Lsn::NULL;
        let mut last_segment = 0;
        let mut cut = false;
        for segment in list_segments(&config.wal_dir)? {
            let path = segment_path(&config.wal_dir, segment);
            if cut {
                warn!("Removing WAL segment {:?} past a truncated tail", path);
                fs::remove_file(&path)?;
                continue;
            }
            last_segment = segment;
            let scan = scan_segment(&path, segment)?;
            if let Some(lsn) = scan.last_lsn {
                last_lsn = lsn;
            }
            if scan.truncated {
                cut = true;
                if scan.valid_end < SEGMENT_HEADER_SIZE {
                    warn!("Removing WAL segment {:?} with a damaged header", path);
                    fs::remove_file(&path)?;
                } else {
                    warn!(
                        "Cutting partially written tail of WAL segment {:?} at offset {}",
                        path, scan.valid_end
                    );
                    let file = OpenOptions::new().write(true).open(&path)?;
                    file.set_len(scan.valid_end)?;
                    file.sync_all()?;
                }
            }
        }

        let active = last_segment + 1;
        info!(
            "Opened WAL in {:?}: last record {}, active segment {}",
            config.wal_dir, last_lsn, active
        );

        Ok(WriteAheadLog {
            tail: Mutex::new(TailState {
                segment: active,
                position: SEGMENT_HEADER_SIZE,
                pending: Vec::new(),
                end_lsn: last_lsn,
                records_appended: 0,
                closed: false,
            }),
            flush_state: Mutex::new(FlushState {
                flushed: last_lsn,
                in_progress: false,
                waiting: 0,
                physical_flushes: 0,
            }),
            flush_cond: Condvar::new(),
            writer: Mutex::new(SegmentWriter {
                dir: config.wal_dir.clone(),
                files: BTreeMap::new(),
            }),
            failed: AtomicBool::new(false),
            #[cfg(test)]
            sync_gate: Mutex::new(()),
            config,
        })
    }

    pub fn config(&self) -> &WalConfig {
        &self.config
    }

    fn check_healthy(&self) -> StorageResult<()> {
        if self.failed.load(Ordering::Acquire) {
            return Err(StorageError::Durability(
                "write-ahead log failed earlier and no longer accepts writes".into(),
            ));
        }
        Ok(())
    }

    /// Queue a record and return its LSN. The record is durable only after a
    /// `flush` covering the returned LSN.
    pub fn append(&self, record: &WalRecord) -> StorageResult<Lsn> {
        self.check_healthy()?;
        let frame = record.encode()?;

        let mut tail = self.tail.lock();
        if tail.closed {
            return Err(StorageError::Closed);
        }
        if tail.position > SEGMENT_HEADER_SIZE
            && tail.position + frame.len() as u64 > self.config.max_segment_size
        {
            tail.segment += 1;
            tail.position = SEGMENT_HEADER_SIZE;
            debug!("WAL rotated to segment {}", tail.segment);
        }

        let (segment, position) = (tail.segment, tail.position);
        let lsn = Lsn::new(segment, position);
        tail.position += frame.len() as u64;
        match tail.pending.last_mut() {
            Some(chunk) if chunk.segment == segment => chunk.bytes.put_slice(&frame),
            _ => tail.pending.push(PendingChunk {
                segment,
                start: position,
                bytes: frame,
            }),
        }
        tail.end_lsn = lsn;
        tail.records_appended += 1;
        Ok(lsn)
    }

    /// Block until every record with an LSN up to `up_to` is durable.
    pub fn flush(&self, up_to: Lsn) -> StorageResult<()> {
        self.check_healthy()?;
        let up_to = up_to.min(self.end_lsn());

        let mut state = self.flush_state.lock();
        loop {
            if state.flushed >= up_to {
                return Ok(());
            }
            self.check_healthy()?;
            if state.in_progress {
                state.waiting += 1;
                self.flush_cond.wait(&mut state);
                state.waiting -= 1;
                continue;
            }

            state.in_progress = true;
            drop(state);
            let result = self.write_pending();
            state = self.flush_state.lock();
            state.in_progress = false;

            match result {
                Ok((written_up_to, wrote)) => {
                    state.flushed = state.flushed.max(written_up_to);
                    if wrote {
                        state.physical_flushes += 1;
                    }
                    self.flush_cond.notify_all();
                }
                Err(e) => {
                    self.failed.store(true, Ordering::Release);
                    self.flush_cond.notify_all();
                    log::error!("WAL flush failed, log is now read-only: {}", e);
                    return Err(StorageError::Durability(e.to_string()));
                }
            }
        }
    }

    /// Flush everything appended so far.
    pub fn flush_all(&self) -> StorageResult<()> {
        self.flush(self.end_lsn())
    }

    /// Take every queued chunk and write it out. Returns the LSN the write
    /// covers and whether anything was written.
    fn write_pending(&self) -> StorageResult<(Lsn, bool)> {
        let (chunks, end_lsn, active) = {
            let mut tail = self.tail.lock();
            (std::mem::take(&mut tail.pending), tail.end_lsn, tail.segment)
        };
        if chunks.is_empty() {
            return Ok((end_lsn, false));
        }

        let mut writer = self.writer.lock();
        for chunk in &chunks {
            let file = writer.file_for(chunk.segment)?;
            file.seek(SeekFrom::Start(chunk.start))?;
            file.write_all(&chunk.bytes)?;
        }
        #[cfg(test)]
        drop(self.sync_gate.lock());
        for (segment, file) in writer.files.iter() {
            if self.config.sync_on_flush && chunks.iter().any(|c| c.segment == *segment) {
                file.sync_data()?;
            }
        }
        // Segments behind the active one are complete
        writer.files.retain(|segment, _| *segment >= active);
        Ok((end_lsn, true))
    }

    /// Forward reader over durable records starting at `from`.
    pub fn read(&self, from: Lsn) -> StorageResult<WalReader> {
        WalReader::new(&self.config.wal_dir, from)
    }

    /// Delete segments whose records all precede `min_required`. The active
    /// segment and segments still open for writing are kept.
    pub fn truncate(&self, min_required: Lsn) -> StorageResult<usize> {
        let active = self.tail.lock().segment;
        let writer = self.writer.lock();
        let mut removed = 0;
        for segment in list_segments(&self.config.wal_dir)? {
            if segment >= min_required.segment()
                || segment >= active
                || writer.files.contains_key(&segment)
            {
                continue;
            }
            fs::remove_file(segment_path(&self.config.wal_dir, segment))?;
            removed += 1;
        }
        if removed > 0 {
            info!(
                "Truncated {} WAL segment(s) preceding {}",
                removed, min_required
            );
        }
        Ok(removed)
    }

    /// LSN of the last appended record.
    pub fn end_lsn(&self) -> Lsn {
        self.tail.lock().end_lsn
    }

    pub fn flushed_lsn(&self) -> Lsn {
        self.flush_state.lock().flushed
    }

    /// Position of the first record in the oldest segment on disk.
    pub fn begin_lsn(&self) -> StorageResult<Lsn> {
        Ok(list_segments(&self.config.wal_dir)?
            .first()
            .map(|segment| Lsn::new(*segment, SEGMENT_HEADER_SIZE))
            .unwrap_or(Lsn::NULL))
    }

    /// Indices of the segments currently on disk.
    pub fn segments(&self) -> StorageResult<Vec<u64>> {
        list_segments(&self.config.wal_dir)
    }

    pub fn stats(&self) -> WalStats {
        let records_appended = self.tail.lock().records_appended;
        WalStats {
            records_appended,
            physical_flushes: self.flush_state.lock().physical_flushes,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Flush everything and refuse further appends.
    pub fn close(&self) -> StorageResult<()> {
        if self.tail.lock().closed {
            return Ok(());
        }
        let result = if self.is_failed() {
            Ok(())
        } else {
            self.flush_all()
        };
        self.tail.lock().closed = true;
        self.writer.lock().files.clear();
        result
    }
}

pub(crate) fn segment_path(dir: &Path, segment: u64) -> PathBuf {
    dir.join(format!(
        "{}{:010}{}",
        WAL_FILE_PREFIX, segment, WAL_FILE_EXTENSION
    ))
}

fn segment_header(segment: u64) -> BytesMut {
    let mut header = BytesMut::with_capacity(SEGMENT_HEADER_SIZE as usize);
    header.put_u32_le(SEGMENT_MAGIC);
    header.put_u32_le(SEGMENT_FORMAT_VERSION);
    header.put_u32_le(PAGE_SIZE as u32);
    header.put_u64_le(segment);
    header
}

/// Check a segment header read from disk.
pub(crate) fn header_is_valid(data: &[u8], segment: u64) -> bool {
    let header_len = SEGMENT_HEADER_SIZE as usize;
    data.len() >= header_len && data[..header_len] == segment_header(segment)[..]
}

/// Sorted indices of all segment files in `dir`.
pub(crate) fn list_segments(dir: &Path) -> StorageResult<Vec<u64>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(index) = name
            .strip_prefix(WAL_FILE_PREFIX)
            .and_then(|rest| rest.strip_suffix(WAL_FILE_EXTENSION))
            .and_then(|index| index.parse::<u64>().ok())
        {
            segments.push(index);
        }
    }
    segments.sort_unstable();
    Ok(segments)
}

struct SegmentScan {
    last_lsn: Option<Lsn>,
    valid_end: u64,
    truncated: bool,
}

fn scan_segment(path: &Path, segment: u64) -> StorageResult<SegmentScan> {
    let mut data = Vec::new();
    File::open(path)?.read_to_end(&mut data)?;
    if !header_is_valid(&data, segment) {
        return Ok(SegmentScan {
            last_lsn: None,
            valid_end: 0,
            truncated: true,
        });
    }

    let mut offset = SEGMENT_HEADER_SIZE as usize;
    let mut last_lsn = None;
    while offset < data.len() {
        let lsn = Lsn::new(segment, offset as u64);
        match WalRecord::decode_frame(lsn, &data[offset..]) {
            Ok(Some((_, len))) => {
                last_lsn = Some(lsn);
                offset += len;
            }
            Ok(None) => break,
            Err(e) => return Err(e),
        }
    }
    Ok(SegmentScan {
        last_lsn,
        valid_end: offset as u64,
        truncated: offset < data.len(),
    })
}
