//! DirRemote: a remote vault kept in a plain directory.
//!
//! Layout:
//! - `manifest.json` - the remote file listing
//! - `blobs/<fileId>/<contentHash>` - uploaded content
//!
//! Uploads land in the blob store straight away; the listing only changes
//! when a report is committed with `apply_report`, which refuses uploads whose
//! expected hash no longer matches the manifest.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use sync_engine::{
    ActionKind, ContentHash, FileId, FileSystem, FsError, RemoteFileDescriptor, RemoteStore,
    SyncReport, TransferError,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::native_fs::NativeFs;

const MANIFEST_FILE: &str = "manifest.json";
const MANIFEST_TMP_FILE: &str = "manifest.json.tmp";
const URL_SCHEME: &str = "dir://";

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    files: Vec<RemoteFileDescriptor>,
}

pub struct DirRemote {
    root: NativeFs,
    /// Serializes manifest read-modify-write
    manifest_lock: Mutex<()>,
}

fn unavailable(e: FsError) -> TransferError {
    TransferError::Unavailable(e.to_string())
}

impl DirRemote {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root: NativeFs::new(root),
            manifest_lock: Mutex::new(()),
        }
    }

    fn blob_path(url: &str) -> Result<String, TransferError> {
        let rest = url
            .strip_prefix(URL_SCHEME)
            .ok_or_else(|| TransferError::NotFound(url.to_string()))?;
        let (file_id, hash) = rest
            .split_once('/')
            .ok_or_else(|| TransferError::NotFound(url.to_string()))?;
        let file_id: FileId = file_id
            .parse()
            .map_err(|_| TransferError::NotFound(url.to_string()))?;
        if hash.is_empty() || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(TransferError::NotFound(url.to_string()));
        }
        Ok(format!("blobs/{}/{}", file_id, hash))
    }

    fn url_for(file_id: &FileId, content_hash: &ContentHash) -> String {
        format!("{}{}/{}", URL_SCHEME, file_id, content_hash)
    }

    async fn load_manifest(&self) -> Result<Manifest, TransferError> {
        match self.root.read(MANIFEST_FILE).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                TransferError::Unavailable(format!("Invalid remote manifest: {}", e))
            }),
            Err(FsError::NotFound(_)) => Ok(Manifest::default()),
            Err(e) => Err(unavailable(e)),
        }
    }

    async fn save_manifest(&self, manifest: &Manifest) -> Result<(), TransferError> {
        let json = serde_json::to_vec_pretty(manifest)
            .map_err(|e| TransferError::Unavailable(e.to_string()))?;
        self.root
            .write(MANIFEST_TMP_FILE, &json)
            .await
            .map_err(unavailable)?;
        self.root
            .rename(MANIFEST_TMP_FILE, MANIFEST_FILE)
            .await
            .map_err(unavailable)
    }

    /// Commit a sync report to the manifest. Returns the uploads that were
    /// rejected because the remote changed underneath them.
    pub async fn apply_report(&self, report: &SyncReport) -> Result<Vec<FileId>, TransferError> {
        let _guard = self.manifest_lock.lock().await;
        let mut manifest = self.load_manifest().await?;
        let mut rejected = Vec::new();

        for completed in &report.completed {
            if !matches!(completed.action, ActionKind::Upload | ActionKind::Conflict) {
                continue;
            }

            let position = manifest
                .files
                .iter()
                .position(|f| f.file_id == completed.file_id);
            let current = position.map(|i| &manifest.files[i].content_hash);
            if current != completed.expected_hash.as_ref() {
                warn!(
                    "Rejecting stale upload of {} (expected {:?})",
                    completed.path, completed.expected_hash
                );
                rejected.push(completed.file_id);
                continue;
            }

            let url = Self::url_for(&completed.file_id, &completed.content_hash);
            if !self
                .root
                .exists(&Self::blob_path(&url)?)
                .await
                .map_err(unavailable)?
            {
                warn!("Rejecting upload of {} with no blob", completed.path);
                rejected.push(completed.file_id);
                continue;
            }

            let descriptor = RemoteFileDescriptor {
                file_id: completed.file_id,
                path: completed.path.clone(),
                size: completed.size,
                content_hash: completed.content_hash.clone(),
                vector_clock: completed.vector_clock.clone(),
                url: None,
            };
            match position {
                Some(i) => manifest.files[i] = descriptor,
                None => manifest.files.push(descriptor),
            }
        }

        manifest
            .files
            .retain(|f| !report.deleted.contains(&f.file_id));
        manifest.files.sort_by(|a, b| a.path.cmp(&b.path));

        self.save_manifest(&manifest).await?;
        info!(
            "Committed report: remote now lists {} files ({} rejected)",
            manifest.files.len(),
            rejected.len()
        );
        Ok(rejected)
    }
}

#[async_trait]
impl RemoteStore for DirRemote {
    async fn list_files(&self) -> Result<Vec<RemoteFileDescriptor>, TransferError> {
        let manifest = self.load_manifest().await?;
        debug!("Remote manifest lists {} files", manifest.files.len());
        Ok(manifest.files)
    }

    fn upload_url(&self, file_id: &FileId, content_hash: &ContentHash) -> String {
        Self::url_for(file_id, content_hash)
    }

    fn download_url(&self, file_id: &FileId, content_hash: &ContentHash) -> String {
        Self::url_for(file_id, content_hash)
    }

    async fn put(&self, url: &str, content: &[u8]) -> Result<(), TransferError> {
        let path = Self::blob_path(url)?;
        self.root.write(&path, content).await.map_err(unavailable)
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>, TransferError> {
        let path = Self::blob_path(url)?;
        match self.root.read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(FsError::NotFound(_)) => Err(TransferError::NotFound(url.to_string())),
            Err(e) => Err(unavailable(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_engine::{CompletedFile, VectorClock};
    use tempfile::TempDir;

    fn completed(file_id: FileId, path: &str, content: &[u8], expected: Option<ContentHash>) -> CompletedFile {
        CompletedFile {
            file_id,
            action: ActionKind::Upload,
            path: path.into(),
            title: path.into(),
            size: content.len() as u64,
            content_hash: ContentHash::of(content),
            vector_clock: VectorClock::from([("D1", 1)]),
            expected_hash: expected,
        }
    }

    #[tokio::test]
    async fn test_empty_directory_lists_nothing() {
        let dir = TempDir::new().unwrap();
        let remote = DirRemote::new(dir.path().to_path_buf());
        assert!(remote.list_files().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upload_is_listed_after_commit() {
        let dir = TempDir::new().unwrap();
        let remote = DirRemote::new(dir.path().to_path_buf());
        let id = FileId::new();
        let hash = ContentHash::of(b"hello");

        let url = remote.upload_url(&id, &hash);
        remote.put(&url, b"hello").await.unwrap();
        assert!(remote.list_files().await.unwrap().is_empty());

        let report = SyncReport {
            completed: vec![completed(id, "a.md", b"hello", None)],
            ..Default::default()
        };
        assert!(remote.apply_report(&report).await.unwrap().is_empty());

        let listed = remote.list_files().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].file_id, id);
        assert_eq!(remote.get(&remote.download_url(&id, &hash)).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_stale_upload_is_rejected() {
        let dir = TempDir::new().unwrap();
        let remote = DirRemote::new(dir.path().to_path_buf());
        let id = FileId::new();

        for content in [&b"v1"[..], &b"v2"[..]] {
            let url = remote.upload_url(&id, &ContentHash::of(content));
            remote.put(&url, content).await.unwrap();
        }

        let first = SyncReport {
            completed: vec![completed(id, "a.md", b"v1", None)],
            ..Default::default()
        };
        remote.apply_report(&first).await.unwrap();

        // Expects the file not to exist yet, but v1 is already there
        let stale = SyncReport {
            completed: vec![completed(id, "a.md", b"v2", None)],
            ..Default::default()
        };
        assert_eq!(remote.apply_report(&stale).await.unwrap(), vec![id]);
        assert_eq!(
            remote.list_files().await.unwrap()[0].content_hash,
            ContentHash::of(b"v1")
        );
    }

    #[tokio::test]
    async fn test_foreign_urls_are_not_found() {
        let dir = TempDir::new().unwrap();
        let remote = DirRemote::new(dir.path().to_path_buf());
        assert!(matches!(
            remote.get("https://example.com/x").await,
            Err(TransferError::NotFound(_))
        ));
        let id = FileId::new();
        assert!(matches!(
            remote.get(&format!("dir://{}/../../etc", id)).await,
            Err(TransferError::NotFound(_))
        ));
    }
}
