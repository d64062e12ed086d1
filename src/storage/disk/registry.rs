//! Persistent mapping between file names, file ids and checksum modes.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::storage::disk::ChecksumMode;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::FileId;

pub const REGISTRY_FILE_NAME: &str = "files.registry";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub id: FileId,
    pub name: String,
    pub checksum_mode: ChecksumMode,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryData {
    next_id: FileId,
    files: Vec<FileEntry>,
}

#[derive(Debug)]
pub struct FileRegistry {
    path: PathBuf,
    data: RegistryData,
}

impl FileRegistry {
    /// Load the registry from `dir`, or start an empty one.
    pub fn load_or_create(dir: &Path) -> StorageResult<Self> {
        let path = dir.join(REGISTRY_FILE_NAME);
        let data = if path.exists() {
            let bytes = fs::read(&path)?;
            bincode::deserialize(&bytes).map_err(|e| StorageError::Corrupted {
                path: path.clone(),
                reason: e.to_string(),
            })?
        } else {
            RegistryData {
                next_id: 1,
                files: Vec::new(),
            }
        };
        Ok(Self { path, data })
    }

    /// Register a new file name and persist the registry.
    pub fn register(
        &mut self,
        name: &str,
        checksum_mode: ChecksumMode,
    ) -> StorageResult<FileEntry> {
        if self.by_name(name).is_some() {
            return Err(StorageError::FileExists(name.to_string()));
        }
        let entry = FileEntry {
            id: self.data.next_id,
            name: name.to_string(),
            checksum_mode,
        };
        self.data.next_id += 1;
        self.data.files.push(entry.clone());
        self.persist()?;
        Ok(entry)
    }

    pub fn by_name(&self, name: &str) -> Option<&FileEntry> {
        self.data.files.iter().find(|entry| entry.name == name)
    }

    pub fn by_id(&self, id: FileId) -> Option<&FileEntry> {
        self.data.files.iter().find(|entry| entry.id == id)
    }

    pub fn entries(&self) -> &[FileEntry] {
        &self.data.files
    }

    fn persist(&self) -> StorageResult<()> {
        let bytes = bincode::serialize(&self.data)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::File::open(&tmp)?.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
