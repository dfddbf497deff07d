//! LocalFileCollector: snapshot of the vault's files for planning.
//!
//! Tracked files are paired with their FileIndex clock, bumped for this device
//! when the content no longer matches the last synced hash. Untracked files
//! found by walking the vault get a fresh, not yet persisted file id and an
//! empty clock.
//!
//! Per-file failures never abort collection; the file is reported in
//! `Collection::skipped` and left out of the plan.

use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, warn};

use crate::clock::VectorClock;
use crate::descriptor::{FileId, LocalFileDescriptor};
use crate::device_id::DeviceId;
use crate::fs::{FileSystem, FsError};
use crate::hash::ContentHash;
use crate::index::FileIndex;
use crate::SYNC_DIR;

#[derive(Debug, Error)]
pub enum CollectionError {
    #[error("File is {size} bytes, over the {limit} byte limit")]
    Oversized { size: u64, limit: u64 },

    #[error("Failed to read file: {0}")]
    Io(#[from] FsError),
}

/// Result of one collection pass.
#[derive(Debug, Default)]
pub struct Collection {
    /// Descriptors sorted by path
    pub files: Vec<LocalFileDescriptor>,
    pub skipped: Vec<(String, CollectionError)>,
}

impl Collection {
    pub fn get(&self, path: &str) -> Option<&LocalFileDescriptor> {
        self.files.iter().find(|f| f.path == path)
    }
}

pub struct LocalFileCollector<'a, F: FileSystem> {
    fs: &'a F,
    device_id: &'a DeviceId,
    max_file_size: u64,
}

/// Hidden entries (and the engine's own state directory) are never synced.
fn is_ignored(name: &str) -> bool {
    name.starts_with('.') || name == SYNC_DIR
}

impl<'a, F: FileSystem> LocalFileCollector<'a, F> {
    pub fn new(fs: &'a F, device_id: &'a DeviceId, max_file_size: u64) -> Self {
        Self {
            fs,
            device_id,
            max_file_size,
        }
    }

    pub async fn collect(&self, index: &FileIndex) -> Collection {
        let mut collection = Collection::default();

        for (path, entry) in index.get_all() {
            match self.read_file(path).await {
                Ok(Some((size, content_hash))) => {
                    let changed = entry.content_hash.as_ref() != Some(&content_hash);
                    let vector_clock = if changed {
                        debug!("Local change detected: {}", path);
                        entry.vector_clock.increment(self.device_id)
                    } else {
                        entry.vector_clock.clone()
                    };
                    collection.files.push(LocalFileDescriptor {
                        file_id: entry.file_id,
                        path: path.to_string(),
                        size,
                        content_hash,
                        vector_clock,
                    });
                }
                Ok(None) => debug!("Tracked file missing (tombstone): {}", path),
                Err(e) => {
                    warn!("Skipping {}: {}", path, e);
                    collection.skipped.push((path.to_string(), e));
                }
            }
        }

        for path in self.walk(&mut collection.skipped).await {
            if index.get(&path).is_some() {
                continue;
            }
            match self.read_file(&path).await {
                Ok(Some((size, content_hash))) => {
                    debug!("Untracked file discovered: {}", path);
                    collection.files.push(LocalFileDescriptor {
                        file_id: FileId::new(),
                        path,
                        size,
                        content_hash,
                        vector_clock: VectorClock::new(),
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Skipping {}: {}", path, e);
                    collection.skipped.push((path, e));
                }
            }
        }

        collection.files.sort_by(|a, b| a.path.cmp(&b.path));
        collection
    }

    /// Size and hash of a file; `None` when it does not exist as a file.
    async fn read_file(&self, path: &str) -> Result<Option<(u64, ContentHash)>, CollectionError> {
        let stat = match self.fs.stat(path).await {
            Ok(stat) if stat.is_dir => return Ok(None),
            Ok(stat) => stat,
            Err(FsError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if stat.size > self.max_file_size {
            return Err(CollectionError::Oversized {
                size: stat.size,
                limit: self.max_file_size,
            });
        }

        let content = match self.fs.read(path).await {
            Ok(content) => content,
            Err(FsError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some((content.len() as u64, ContentHash::of(&content))))
    }

    /// Every non-hidden file path in the vault.
    async fn walk(&self, skipped: &mut Vec<(String, CollectionError)>) -> Vec<String> {
        let mut files = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![String::new()];

        while let Some(dir) = stack.pop() {
            let entries = match self.fs.list(&dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Failed to list {:?}: {}", dir, e);
                    skipped.push((dir, e.into()));
                    continue;
                }
            };

            for entry in entries {
                if is_ignored(&entry.name) {
                    continue;
                }
                let path = if dir.is_empty() {
                    entry.name
                } else {
                    format!("{}/{}", dir, entry.name)
                };
                if entry.is_dir {
                    stack.push(path);
                } else if seen.insert(path.clone()) {
                    files.push(path);
                }
            }
        }

        files
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::FileIndexEntry;
    use crate::fs::InMemoryFs;

    fn device() -> DeviceId {
        "D1".parse().unwrap()
    }

    #[tokio::test]
    async fn test_unchanged_tracked_file_keeps_clock() {
        let fs = InMemoryFs::new();
        fs.write("a.md", b"hello").await.unwrap();

        let mut index = FileIndex::new();
        let entry = FileIndexEntry::new(
            FileId::new(),
            VectorClock::from([("D1", 1)]),
            Some(ContentHash::of(b"hello")),
        );
        index.set_many([("a.md".to_string(), entry.clone())]);

        let device = device();
        let collection = LocalFileCollector::new(&fs, &device, 1024)
            .collect(&index)
            .await;

        assert_eq!(collection.files.len(), 1);
        let file = &collection.files[0];
        assert_eq!(file.file_id, entry.file_id);
        assert_eq!(file.vector_clock, entry.vector_clock);
        assert_eq!(file.size, 5);
    }

    #[tokio::test]
    async fn test_changed_tracked_file_increments_clock() {
        let fs = InMemoryFs::new();
        fs.write("a.md", b"edited").await.unwrap();

        let mut index = FileIndex::new();
        index.set_many([(
            "a.md".to_string(),
            FileIndexEntry::new(
                FileId::new(),
                VectorClock::from([("D1", 1)]),
                Some(ContentHash::of(b"hello")),
            ),
        )]);

        let device = device();
        let collection = LocalFileCollector::new(&fs, &device, 1024)
            .collect(&index)
            .await;

        assert_eq!(collection.files[0].vector_clock, VectorClock::from([("D1", 2)]));
    }

    #[tokio::test]
    async fn test_tombstones_and_oversized_files_are_skipped() {
        let fs = InMemoryFs::new();
        fs.write("big.md", &[b'x'; 100]).await.unwrap();

        let mut index = FileIndex::new();
        index.get_or_create("gone.md");
        index.get_or_create("big.md");

        let device = device();
        let collection = LocalFileCollector::new(&fs, &device, 10)
            .collect(&index)
            .await;

        assert!(collection.files.is_empty());
        assert_eq!(collection.skipped.len(), 1);
        assert_eq!(collection.skipped[0].0, "big.md");
        assert!(matches!(
            collection.skipped[0].1,
            CollectionError::Oversized { size: 100, limit: 10 }
        ));
    }

    #[tokio::test]
    async fn test_unreadable_file_does_not_abort() {
        let fs = InMemoryFs::new();
        fs.write("bad.md", b"x").await.unwrap();
        fs.write("good.md", b"y").await.unwrap();
        fs.fail_reads("bad.md");

        let device = device();
        let collection = LocalFileCollector::new(&fs, &device, 1024)
            .collect(&FileIndex::new())
            .await;

        assert_eq!(collection.files.len(), 1);
        assert_eq!(collection.files[0].path, "good.md");
        assert!(matches!(collection.skipped[0].1, CollectionError::Io(_)));
    }

    #[tokio::test]
    async fn test_discovers_untracked_files_and_ignores_hidden() {
        let fs = InMemoryFs::new();
        fs.write("notes/a.md", b"a").await.unwrap();
        fs.write("b.md", b"b").await.unwrap();
        fs.write(".sync/file_index.json", b"{}").await.unwrap();
        fs.write(".obsidian/app.json", b"{}").await.unwrap();
        fs.write("notes/.draft.md", b"d").await.unwrap();

        let device = device();
        let collection = LocalFileCollector::new(&fs, &device, 1024)
            .collect(&FileIndex::new())
            .await;

        let paths: Vec<&str> = collection.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["b.md", "notes/a.md"]);
        assert!(collection.files.iter().all(|f| f.vector_clock.is_empty()));
        assert_ne!(collection.files[0].file_id, collection.files[1].file_id);
    }
}
