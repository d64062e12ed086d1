use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::storage::disk::PAGE_SIZE;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{FileId, PageKey};

pub struct PageFile {
    file_id: FileId,
    path: PathBuf,
    file: File,
}

impl PageFile {
    pub fn create(file_id: FileId, path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => {
                    StorageError::FileExists(path.display().to_string())
                }
                _ => StorageError::Io(e),
            })?;

        Ok(Self {
            file_id,
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn open(file_id: FileId, path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    StorageError::FileNotFound(path.display().to_string())
                }
                _ => StorageError::Io(e),
            })?;

        Ok(Self {
            file_id,
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_page(&mut self, page_index: u64, buf: &mut [u8]) -> StorageResult<()> {
        Self::check_len(buf.len())?;

        let offset = Self::page_offset(page_index);
        let file_size = self.file.metadata()?.len();

        if offset >= file_size {
            return Err(StorageError::PageNotFound(PageKey::new(
                self.file_id,
                page_index,
            )));
        }

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;

        Ok(())
    }

    /// Write a page image, extending the file when needed. Not durable until
    /// [`PageFile::sync`].
    pub fn write_page(&mut self, page_index: u64, data: &[u8]) -> StorageResult<()> {
        Self::check_len(data.len())?;

        let offset = Self::page_offset(page_index);
        let file_size = self.file.metadata()?.len();

        // Extend file if necessary
        if offset >= file_size {
            self.file.set_len(offset + PAGE_SIZE as u64)?;
        }

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;

        Ok(())
    }

    pub fn num_pages(&self) -> StorageResult<u64> {
        let file_size = self.file.metadata()?.len();
        Ok(file_size / PAGE_SIZE as u64)
    }

    /// Extend the file by one zeroed page and return its index.
    pub fn allocate_page(&mut self) -> StorageResult<u64> {
        let current_pages = self.num_pages()?;
        self.file
            .set_len((current_pages + 1) * PAGE_SIZE as u64)?;
        Ok(current_pages)
    }

    /// Shrink or grow the file to exactly `pages` pages.
    pub fn truncate(&mut self, pages: u64) -> StorageResult<()> {
        self.file.set_len(pages * PAGE_SIZE as u64)?;
        Ok(())
    }

    pub fn sync(&self) -> StorageResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn check_len(len: usize) -> StorageResult<()> {
        if len != PAGE_SIZE {
            return Err(StorageError::InvalidPageOperation(format!(
                "buffer size must be PAGE_SIZE ({}), got {}",
                PAGE_SIZE, len
            )));
        }
        Ok(())
    }

    fn page_offset(page_index: u64) -> u64 {
        page_index * PAGE_SIZE as u64
    }
}
