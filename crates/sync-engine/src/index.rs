//! FileIndex: durable `path -> {fileId, vectorClock}` mapping for one vault.
//!
//! The index is the source of truth for file identity and causality on this
//! device. It is stored in `.sync/file_index.json` and replaced atomically
//! (write to a temp file, then rename) on every change, so a crash between two
//! actions never loses or duplicates a completed one.
//!
//! An entry whose file is missing from disk is a tombstone: the file was
//! deleted locally and the deletion has not been propagated yet.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::debug;

use crate::clock::VectorClock;
use crate::descriptor::FileId;
use crate::fs::{FileSystem, FsError};
use crate::hash::ContentHash;
use crate::SYNC_DIR;

pub const INDEX_FILE: &str = ".sync/file_index.json";
const INDEX_TMP_FILE: &str = ".sync/file_index.json.tmp";
const INDEX_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),

    #[error("File index corrupted: {0}")]
    Corrupted(String),

    #[error("Failed to serialize file index: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, IndexError>;

/// What the index remembers about one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileIndexEntry {
    pub file_id: FileId,
    pub vector_clock: VectorClock,
    /// Hash last confirmed in sync with the remote. `None` for entries created
    /// locally that the remote has not seen yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<ContentHash>,
}

impl FileIndexEntry {
    pub fn new(file_id: FileId, vector_clock: VectorClock, content_hash: Option<ContentHash>) -> Self {
        Self {
            file_id,
            vector_clock,
            content_hash,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    entries: BTreeMap<String, FileIndexEntry>,
}

/// In-memory view of the persisted index.
#[derive(Debug, Clone, Default)]
pub struct FileIndex {
    entries: BTreeMap<String, FileIndexEntry>,
    /// Reverse lookup, kept in step with `entries`
    by_id: HashMap<FileId, String>,
}

impl FileIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an index from entries, rejecting a file id mapped to two paths.
    pub fn from_entries(
        entries: impl IntoIterator<Item = (String, FileIndexEntry)>,
    ) -> Result<Self> {
        let mut index = Self::new();
        for (path, entry) in entries {
            if let Some(existing) = index.by_id.get(&entry.file_id) {
                return Err(IndexError::Corrupted(format!(
                    "file id {} is mapped to both {} and {}",
                    entry.file_id, existing, path
                )));
            }
            index.by_id.insert(entry.file_id, path.clone());
            index.entries.insert(path, entry);
        }
        Ok(index)
    }

    /// Load the index from the vault. A missing file is an empty index.
    pub async fn load<F: FileSystem>(fs: &F) -> Result<Self> {
        if !fs.exists(INDEX_FILE).await? {
            return Ok(Self::new());
        }

        let bytes = fs.read(INDEX_FILE).await?;
        let file: IndexFile = serde_json::from_slice(&bytes)
            .map_err(|e| IndexError::Corrupted(format!("unreadable {}: {}", INDEX_FILE, e)))?;
        if file.version != INDEX_FORMAT_VERSION {
            return Err(IndexError::Corrupted(format!(
                "unsupported index version {}",
                file.version
            )));
        }

        let index = Self::from_entries(file.entries)?;
        debug!("Loaded file index with {} entries", index.len());
        Ok(index)
    }

    /// Persist the index, replacing the previous file atomically.
    pub async fn save<F: FileSystem>(&self, fs: &F) -> Result<()> {
        let file = IndexFile {
            version: INDEX_FORMAT_VERSION,
            entries: self.entries.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&file)?;

        fs.mkdir(SYNC_DIR).await?;
        fs.write(INDEX_TMP_FILE, &bytes).await?;
        fs.rename(INDEX_TMP_FILE, INDEX_FILE).await?;
        Ok(())
    }

    /// Apply `change` and persist the result. On a failed write the in-memory
    /// index is left exactly as it was.
    pub async fn update<F, T>(&mut self, fs: &F, change: impl FnOnce(&mut FileIndex) -> T) -> Result<T>
    where
        F: FileSystem,
    {
        let mut next = self.clone();
        let out = change(&mut next);
        next.save(fs).await?;
        *self = next;
        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries in path order.
    pub fn get_all(&self) -> impl Iterator<Item = (&str, &FileIndexEntry)> {
        self.entries.iter().map(|(p, e)| (p.as_str(), e))
    }

    pub fn get(&self, path: &str) -> Option<&FileIndexEntry> {
        self.entries.get(path)
    }

    /// Current path and entry for a file id.
    pub fn get_by_file_id(&self, file_id: &FileId) -> Option<(&str, &FileIndexEntry)> {
        let path = self.by_id.get(file_id)?;
        self.entries.get(path).map(|e| (path.as_str(), e))
    }

    /// Assign entries by path. A file id keeps exactly one path: assigning it
    /// to a new path drops its old mapping (a rename).
    pub fn set_many(&mut self, entries: impl IntoIterator<Item = (String, FileIndexEntry)>) {
        for (path, entry) in entries {
            if let Some(old_path) = self.by_id.get(&entry.file_id) {
                if *old_path != path {
                    let old_path = old_path.clone();
                    self.entries.remove(&old_path);
                }
            }
            if let Some(displaced) = self.entries.get(&path) {
                if displaced.file_id != entry.file_id {
                    self.by_id.remove(&displaced.file_id);
                }
            }
            self.by_id.insert(entry.file_id, path.clone());
            self.entries.insert(path, entry);
        }
    }

    /// Remove the entry at `path`.
    pub fn delete(&mut self, path: &str) -> Option<FileIndexEntry> {
        let entry = self.entries.remove(path)?;
        self.by_id.remove(&entry.file_id);
        Some(entry)
    }

    /// Remove whatever path `file_id` is mapped to.
    pub fn delete_file_id(&mut self, file_id: &FileId) -> Option<(String, FileIndexEntry)> {
        let path = self.by_id.remove(file_id)?;
        let entry = self.entries.remove(&path)?;
        Some((path, entry))
    }

    /// Entry at `path`, creating an unsynced one with a fresh id if missing.
    pub fn get_or_create(&mut self, path: &str) -> &FileIndexEntry {
        if !self.entries.contains_key(path) {
            let entry = FileIndexEntry::new(FileId::new(), VectorClock::new(), None);
            self.by_id.insert(entry.file_id, path.to_string());
            self.entries.insert(path.to_string(), entry);
        }
        &self.entries[path]
    }
}
