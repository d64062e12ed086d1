//! Forward-only iterator over the durable part of the log.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use log::warn;

use super::manager::{header_is_valid, list_segments, segment_path, SEGMENT_HEADER_SIZE};
use super::record::{WalEntry, WalRecord};
use super::Lsn;
use crate::storage::error::StorageResult;

/// Reads records in LSN order starting at a given LSN.
///
/// Segments are loaded one at a time. Iteration ends at the first partial or
/// corrupt record; [`WalReader::truncated_tail`] then reports where. A record
/// whose CRC is valid but whose payload cannot be decoded is yielded as an
/// error.
pub struct WalReader {
    dir: PathBuf,
    remaining: VecDeque<u64>,
    from: Lsn,
    segment: u64,
    data: Option<Vec<u8>>,
    offset: usize,
    truncated_tail: Option<Lsn>,
    done: bool,
}

impl WalReader {
    pub(crate) fn new(dir: &Path, from: Lsn) -> StorageResult<Self> {
        let remaining = list_segments(dir)?
            .into_iter()
            .filter(|segment| *segment >= from.segment())
            .collect();
        Ok(Self {
            dir: dir.to_path_buf(),
            remaining,
            from,
            segment: 0,
            data: None,
            offset: 0,
            truncated_tail: None,
            done: false,
        })
    }

    /// Where the log stopped being readable, if iteration hit damage.
    pub fn truncated_tail(&self) -> Option<Lsn> {
        self.truncated_tail
    }

    /// LSN at which a new reader would resume after the last returned record.
    pub fn next_lsn(&self) -> Lsn {
        if self.data.is_some() {
            Lsn::new(self.segment, self.offset as u64)
        } else {
            match self.remaining.front() {
                Some(segment) => Lsn::new(*segment, SEGMENT_HEADER_SIZE).max(self.from),
                None => Lsn::new(self.segment + 1, SEGMENT_HEADER_SIZE),
            }
        }
    }

    fn load_next_segment(&mut self) -> StorageResult<bool> {
        let Some(segment) = self.remaining.pop_front() else {
            return Ok(false);
        };
        let data = fs::read(segment_path(&self.dir, segment))?;
        self.segment = segment;
        if !header_is_valid(&data, segment) {
            self.stop_at(Lsn::new(segment, 0));
            return Ok(false);
        }
        self.offset = if segment == self.from.segment() {
            (self.from.position() as usize).max(SEGMENT_HEADER_SIZE as usize)
        } else {
            SEGMENT_HEADER_SIZE as usize
        };
        self.data = Some(data);
        Ok(true)
    }

    fn stop_at(&mut self, lsn: Lsn) {
        warn!("WAL is truncated or damaged at {}", lsn);
        self.truncated_tail = Some(lsn);
        self.done = true;
        self.data = None;
    }
}

impl Iterator for WalReader {
    type Item = StorageResult<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            let Some(data) = self.data.as_ref() else {
                match self.load_next_segment() {
                    Ok(true) => continue,
                    Ok(false) => {
                        self.done = true;
                        return None;
                    }
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                }
            };

            if self.offset >= data.len() {
                self.data = None;
                continue;
            }

            let lsn = Lsn::new(self.segment, self.offset as u64);
            match WalRecord::decode_frame(lsn, &data[self.offset..]) {
                Ok(Some((record, len))) => {
                    self.offset += len;
                    return Some(Ok(WalEntry { lsn, record }));
                }
                Ok(None) => {
                    self.stop_at(lsn);
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomic::OperationId;
    use crate::storage::wal::{WalConfig, WriteAheadLog};
    use anyhow::Result;
    use tempfile::TempDir;

    #[test]
    fn test_restart_from_next_lsn() -> Result<()> {
        let dir = TempDir::new()?;
        let wal = WriteAheadLog::open(WalConfig {
            wal_dir: dir.path().to_path_buf(),
            max_segment_size: 64,
            sync_on_flush: false,
        })?;
        for i in 0..10 {
            wal.append(&WalRecord::AtomicOperationStart {
                op_id: OperationId::new(i),
            })?;
        }
        wal.flush_all()?;

        let mut reader = wal.read(Lsn::NULL)?;
        let first: Vec<_> = reader.by_ref().take(4).collect::<StorageResult<_>>()?;
        let resume = reader.next_lsn();

        let rest: Vec<_> = wal.read(resume)?.collect::<StorageResult<_>>()?;
        assert_eq!(first.len() + rest.len(), 10);
        assert!(rest[0].lsn > first[3].lsn);
        assert_eq!(
            rest[0].record,
            WalRecord::AtomicOperationStart {
                op_id: OperationId::new(4)
            }
        );
        Ok(())
    }

    #[test]
    fn test_empty_log() -> Result<()> {
        let dir = TempDir::new()?;
        let wal = WriteAheadLog::open(WalConfig {
            wal_dir: dir.path().to_path_buf(),
            ..WalConfig::default()
        })?;
        let mut reader = wal.read(Lsn::NULL)?;
        assert!(reader.next().is_none());
        assert!(reader.truncated_tail().is_none());
        Ok(())
    }
}
