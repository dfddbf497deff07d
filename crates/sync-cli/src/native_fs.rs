//! Native filesystem implementation using tokio::fs.

use async_trait::async_trait;
use std::io;
use std::path::{Component, Path, PathBuf};
use sync_engine::fs::{FileEntry, FileStat, FileSystem, FsError, Result};
use tokio::fs;

/// Vault directory on the local disk. Every path is resolved under
/// `base_path`; anything that would leave it is refused.
pub struct NativeFs {
    base_path: PathBuf,
}

impl NativeFs {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        let mut full = self.base_path.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => full.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(FsError::OutsideVault(path.to_string()));
                }
            }
        }
        Ok(full)
    }
}

fn map_io(path: &str, e: io::Error) -> FsError {
    match e.kind() {
        io::ErrorKind::NotFound => FsError::NotFound(path.to_string()),
        _ => FsError::Io(format!("{}: {}", path, e)),
    }
}

#[async_trait]
impl FileSystem for NativeFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full_path = self.full_path(path)?;
        if fs::metadata(&full_path).await.map_err(|e| map_io(path, e))?.is_dir() {
            return Err(FsError::IsDirectory(path.to_string()));
        }
        fs::read(&full_path).await.map_err(|e| map_io(path, e))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let full_path = self.full_path(path)?;

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| map_io(path, e))?;
        }

        fs::write(&full_path, content)
            .await
            .map_err(|e| map_io(path, e))
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let full_path = self.full_path(path)?;
        let mut entries = Vec::new();

        let mut dir = fs::read_dir(&full_path)
            .await
            .map_err(|e| map_io(path, e))?;

        while let Some(entry) = dir.next_entry().await.map_err(|e| map_io(path, e))? {
            let name = entry.file_name().to_string_lossy().to_string();
            let metadata = entry.metadata().await.map_err(|e| map_io(path, e))?;

            entries.push(FileEntry {
                name,
                is_dir: metadata.is_dir(),
            });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path)?;
        let metadata = fs::metadata(&full_path)
            .await
            .map_err(|e| map_io(path, e))?;

        if metadata.is_dir() {
            fs::remove_dir(&full_path).await.map_err(|e| map_io(path, e))
        } else {
            fs::remove_file(&full_path).await.map_err(|e| map_io(path, e))
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let full_path = self.full_path(path)?;
        fs::try_exists(&full_path).await.map_err(|e| map_io(path, e))
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let full_path = self.full_path(path)?;
        let metadata = fs::metadata(&full_path)
            .await
            .map_err(|e| map_io(path, e))?;

        Ok(FileStat {
            size: metadata.len(),
            is_dir: metadata.is_dir(),
        })
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path)?;
        fs::create_dir_all(&full_path)
            .await
            .map_err(|e| map_io(path, e))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from_path = self.full_path(from)?;
        let to_path = self.full_path(to)?;

        if let Some(parent) = to_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| map_io(to, e))?;
        }

        fs::rename(&from_path, &to_path)
            .await
            .map_err(|e| map_io(from, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn vault() -> (TempDir, NativeFs) {
        let dir = TempDir::new().unwrap();
        let fs = NativeFs::new(dir.path().to_path_buf());
        (dir, fs)
    }

    #[tokio::test]
    async fn test_write_creates_parents() {
        let (_dir, fs) = vault();
        fs.write("notes/deep/a.md", b"hello").await.unwrap();

        assert_eq!(fs.read("notes/deep/a.md").await.unwrap(), b"hello");
        assert!(fs.stat("notes/deep").await.unwrap().is_dir);

        let entries = fs.list("notes").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "deep");
    }

    #[tokio::test]
    async fn test_escaping_paths_are_refused() {
        let (_dir, fs) = vault();
        assert!(matches!(
            fs.write("../outside.md", b"x").await,
            Err(FsError::OutsideVault(_))
        ));
        assert!(matches!(
            fs.read("a/../../etc/passwd").await,
            Err(FsError::OutsideVault(_))
        ));
        // A leading slash is vault-relative
        fs.write("/rooted.md", b"x").await.unwrap();
        assert!(fs.exists("rooted.md").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let (_dir, fs) = vault();
        assert!(matches!(fs.read("nope.md").await, Err(FsError::NotFound(_))));
        assert!(!fs.exists("nope.md").await.unwrap());
    }

    #[tokio::test]
    async fn test_rename_replaces_destination() {
        let (_dir, fs) = vault();
        fs.write("a.md", b"new").await.unwrap();
        fs.write("sub/b.md", b"old").await.unwrap();

        fs.rename("a.md", "sub/b.md").await.unwrap();
        assert!(!fs.exists("a.md").await.unwrap());
        assert_eq!(fs.read("sub/b.md").await.unwrap(), b"new");
    }
}
