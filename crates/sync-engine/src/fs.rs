//! FileSystem trait abstraction over the vault directory.
//!
//! All paths are vault-relative and use `/` as the separator.
//!
//! Implementations:
//! - `InMemoryFs` - For testing
//! - `NativeFs` (in sync-cli) - Uses tokio::fs rooted at the vault

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Is a directory: {0}")]
    IsDirectory(String),

    #[error("Path escapes the vault: {0}")]
    OutsideVault(String),

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// File metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// File size in bytes
    pub size: u64,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// Directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// File or directory name (not full path)
    pub name: String,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// Platform-independent filesystem abstraction.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Read file contents
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Write file contents (creates parent directories if needed)
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;

    /// List directory contents
    async fn list(&self, path: &str) -> Result<Vec<FileEntry>>;

    /// Delete a file or empty directory
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Get file metadata
    async fn stat(&self, path: &str) -> Result<FileStat>;

    /// Create directory (and parents if needed)
    async fn mkdir(&self, path: &str) -> Result<()>;

    /// Move a file, replacing the destination if it exists
    async fn rename(&self, from: &str, to: &str) -> Result<()>;
}

/// Parent directory of a vault-relative path (`""` for top-level files).
pub fn parent_dir(path: &str) -> &str {
    match path.trim_matches('/').rfind('/') {
        Some(pos) => &path.trim_matches('/')[..pos],
        None => "",
    }
}

/// In-memory filesystem for testing
pub struct InMemoryFs {
    files: RwLock<BTreeMap<String, Vec<u8>>>,
    dirs: RwLock<BTreeSet<String>>,
    /// Paths whose reads fail with an IO error
    failing_reads: RwLock<HashSet<String>>,
}

impl InMemoryFs {
    pub fn new() -> Self {
        let mut dirs = BTreeSet::new();
        dirs.insert(String::new()); // Root directory
        Self {
            files: RwLock::new(BTreeMap::new()),
            dirs: RwLock::new(dirs),
            failing_reads: RwLock::new(HashSet::new()),
        }
    }

    /// Make every subsequent read of `path` fail (simulates an unreadable file)
    pub fn fail_reads(&self, path: &str) {
        self.failing_reads
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(Self::normalize_path(path));
    }

    /// All file paths currently stored, sorted
    pub fn file_paths(&self) -> Vec<String> {
        self.files
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    fn normalize_path(path: &str) -> String {
        path.trim_matches('/').to_string()
    }

    fn mkdir_all(&self, path: &str) {
        let mut dirs = self.dirs.write().unwrap_or_else(|e| e.into_inner());
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(part);
            dirs.insert(current.clone());
        }
    }
}

impl Default for InMemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileSystem for InMemoryFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let path = Self::normalize_path(path);
        if self
            .failing_reads
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&path)
        {
            return Err(FsError::Io(format!("injected read failure: {}", path)));
        }
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        files.get(&path).cloned().ok_or(FsError::NotFound(path))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let path = Self::normalize_path(path);
        if self
            .dirs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&path)
        {
            return Err(FsError::IsDirectory(path));
        }

        self.mkdir_all(parent_dir(&path));
        self.files
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path, content.to_vec());
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let path = Self::normalize_path(path);
        let dirs = self.dirs.read().unwrap_or_else(|e| e.into_inner());
        if !dirs.contains(&path) {
            return Err(FsError::NotFound(path));
        }

        let direct_child = |candidate: &str| -> Option<String> {
            let rest = if path.is_empty() {
                candidate
            } else {
                candidate.strip_prefix(&path)?.strip_prefix('/')?
            };
            (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
        };

        let mut entries: Vec<FileEntry> = dirs
            .iter()
            .filter_map(|d| direct_child(d.as_str()))
            .map(|name| FileEntry { name, is_dir: true })
            .collect();

        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        entries.extend(
            files
                .keys()
                .filter_map(|f| direct_child(f.as_str()))
                .map(|name| FileEntry {
                    name,
                    is_dir: false,
                }),
        );

        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);

        if self
            .files
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&path)
            .is_some()
        {
            return Ok(());
        }

        if self
            .dirs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&path)
        {
            return Ok(());
        }

        Err(FsError::NotFound(path))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let path = Self::normalize_path(path);
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        let dirs = self.dirs.read().unwrap_or_else(|e| e.into_inner());
        Ok(files.contains_key(&path) || dirs.contains(&path))
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let path = Self::normalize_path(path);

        if let Some(content) = self
            .files
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&path)
        {
            return Ok(FileStat {
                size: content.len() as u64,
                is_dir: false,
            });
        }

        if self
            .dirs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&path)
        {
            return Ok(FileStat {
                size: 0,
                is_dir: true,
            });
        }

        Err(FsError::NotFound(path))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        self.mkdir_all(&Self::normalize_path(path));
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = Self::normalize_path(from);
        let to = Self::normalize_path(to);

        let content = self
            .files
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&from)
            .ok_or(FsError::NotFound(from))?;

        self.mkdir_all(parent_dir(&to));
        self.files
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(to, content);
        Ok(())
    }
}

// Implement FileSystem for Arc<T> where T: FileSystem
// This allows tests to keep a handle on the filesystem an engine owns
#[async_trait]
impl<T: FileSystem + ?Sized> FileSystem for std::sync::Arc<T> {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        (**self).read(path).await
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        (**self).write(path, content).await
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        (**self).list(path).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        (**self).delete(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        (**self).exists(path).await
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        (**self).stat(path).await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        (**self).mkdir(path).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        (**self).rename(from, to).await
    }
}
