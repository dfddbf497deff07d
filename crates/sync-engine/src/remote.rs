//! RemoteStore trait abstraction over the remote file index and blob transport.
//!
//! Transfers are content addressed: a URL is derived from `(fileId,
//! contentHash)`, so repeating a transfer after a partial failure writes the
//! same bytes to the same place.
//!
//! Implementations:
//! - `InMemoryRemote` - For testing
//! - `DirRemote` (in sync-cli) - A directory with a manifest and blob store

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;
use thiserror::Error;
use tracing::{debug, warn};

use crate::action::ActionKind;
use crate::clock::VectorClock;
use crate::descriptor::{FileId, RemoteFileDescriptor};
use crate::executor::SyncReport;
use crate::fs::FsError;
use crate::hash::ContentHash;
use crate::index::IndexError;

/// Failure of a single transfer. Recorded per action; never aborts a batch.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Remote unavailable: {0}")]
    Unavailable(String),

    #[error("Not found on remote: {0}")]
    NotFound(String),

    #[error("Content hash mismatch for {path}: expected {expected}, got {actual}")]
    HashMismatch {
        path: String,
        expected: ContentHash,
        actual: ContentHash,
    },

    #[error("Path {path} is already tracked as file {occupant}")]
    PathOccupied { path: String, occupant: FileId },

    #[error("Untracked file with different content is in the way at {0}")]
    UntrackedInTheWay(String),

    #[error("File changed since planning: {0}")]
    ChangedSincePlan(String),

    #[error("Local filesystem error: {0}")]
    Fs(#[from] FsError),

    #[error("File index error: {0}")]
    Index(#[from] IndexError),
}

/// Remote side of a vault: its file listing plus blob transport.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Current remote file index.
    async fn list_files(&self) -> Result<Vec<RemoteFileDescriptor>, TransferError>;

    /// Where to upload `content_hash` bytes for `file_id`.
    fn upload_url(&self, file_id: &FileId, content_hash: &ContentHash) -> String;

    /// Where to fetch `content_hash` bytes for `file_id`.
    fn download_url(&self, file_id: &FileId, content_hash: &ContentHash) -> String;

    async fn put(&self, url: &str, content: &[u8]) -> Result<(), TransferError>;

    async fn get(&self, url: &str) -> Result<Vec<u8>, TransferError>;
}

#[async_trait]
impl<T: RemoteStore + ?Sized> RemoteStore for std::sync::Arc<T> {
    async fn list_files(&self) -> Result<Vec<RemoteFileDescriptor>, TransferError> {
        (**self).list_files().await
    }

    fn upload_url(&self, file_id: &FileId, content_hash: &ContentHash) -> String {
        (**self).upload_url(file_id, content_hash)
    }

    fn download_url(&self, file_id: &FileId, content_hash: &ContentHash) -> String {
        (**self).download_url(file_id, content_hash)
    }

    async fn put(&self, url: &str, content: &[u8]) -> Result<(), TransferError> {
        (**self).put(url, content).await
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>, TransferError> {
        (**self).get(url).await
    }
}

/// In-memory remote for testing.
///
/// Uploaded blobs only become visible in the listing once a report is folded
/// in with `apply_report`, the same way a server confirms a completed upload.
#[derive(Default)]
pub struct InMemoryRemote {
    files: RwLock<BTreeMap<FileId, RemoteFileDescriptor>>,
    blobs: RwLock<HashMap<String, Vec<u8>>>,
    /// Files whose transfers fail
    failing: RwLock<HashSet<FileId>>,
    listing_fails: RwLock<bool>,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn url_for(file_id: &FileId, content_hash: &ContentHash) -> String {
        format!("mem://{}/{}", file_id, content_hash)
    }

    fn file_id_of(url: &str) -> Option<FileId> {
        url.strip_prefix("mem://")?.split('/').next()?.parse().ok()
    }

    /// Seed a file as if another device had synced it.
    pub fn insert_file(&self, path: &str, content: &[u8], vector_clock: VectorClock) -> RemoteFileDescriptor {
        self.insert_with_id(FileId::new(), path, content, vector_clock)
    }

    /// Seed or replace a file under a known id.
    pub fn insert_with_id(
        &self,
        file_id: FileId,
        path: &str,
        content: &[u8],
        vector_clock: VectorClock,
    ) -> RemoteFileDescriptor {
        let content_hash = ContentHash::of(content);
        let url = Self::url_for(&file_id, &content_hash);
        let descriptor = RemoteFileDescriptor {
            file_id,
            path: path.to_string(),
            size: content.len() as u64,
            content_hash,
            vector_clock,
            url: Some(url.clone()),
        };

        self.blobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(url, content.to_vec());
        self.files
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(file_id, descriptor.clone());
        descriptor
    }

    /// Remove a file from the listing (deleted by another device).
    pub fn remove_file(&self, file_id: &FileId) -> Option<RemoteFileDescriptor> {
        self.files
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(file_id)
    }

    pub fn file(&self, file_id: &FileId) -> Option<RemoteFileDescriptor> {
        self.files
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(file_id)
            .cloned()
    }

    pub fn blob(&self, url: &str) -> Option<Vec<u8>> {
        self.blobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(url)
            .cloned()
    }

    /// Make every transfer for `file_id` fail.
    pub fn fail_transfers(&self, file_id: FileId) {
        self.failing
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(file_id);
    }

    /// Make `list_files` fail (or succeed again).
    pub fn fail_listing(&self, fail: bool) {
        *self.listing_fails.write().unwrap_or_else(|e| e.into_inner()) = fail;
    }

    fn check_failing(&self, url: &str) -> Result<(), TransferError> {
        let failing = self.failing.read().unwrap_or_else(|e| e.into_inner());
        match Self::file_id_of(url) {
            Some(id) if failing.contains(&id) => Err(TransferError::Unavailable(format!(
                "injected transfer failure: {}",
                url
            ))),
            _ => Ok(()),
        }
    }

    /// Fold a sync report into the listing. Returns the uploads rejected
    /// because the remote no longer holds the hash they expected to replace.
    pub fn apply_report(&self, report: &SyncReport) -> Vec<FileId> {
        let mut rejected = Vec::new();
        let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
        let blobs = self.blobs.read().unwrap_or_else(|e| e.into_inner());

        for completed in &report.completed {
            if !matches!(completed.action, ActionKind::Upload | ActionKind::Conflict) {
                continue;
            }

            let current = files.get(&completed.file_id).map(|d| &d.content_hash);
            if current != completed.expected_hash.as_ref() {
                warn!(
                    "Rejecting stale upload of {} (expected {:?})",
                    completed.path, completed.expected_hash
                );
                rejected.push(completed.file_id);
                continue;
            }

            let url = Self::url_for(&completed.file_id, &completed.content_hash);
            if !blobs.contains_key(&url) {
                warn!("Rejecting upload of {} with no blob", completed.path);
                rejected.push(completed.file_id);
                continue;
            }

            files.insert(
                completed.file_id,
                RemoteFileDescriptor {
                    file_id: completed.file_id,
                    path: completed.path.clone(),
                    size: completed.size,
                    content_hash: completed.content_hash.clone(),
                    vector_clock: completed.vector_clock.clone(),
                    url: Some(url),
                },
            );
        }

        for file_id in &report.deleted {
            files.remove(file_id);
        }

        debug!("Remote now lists {} files", files.len());
        rejected
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
    async fn list_files(&self) -> Result<Vec<RemoteFileDescriptor>, TransferError> {
        if *self.listing_fails.read().unwrap_or_else(|e| e.into_inner()) {
            return Err(TransferError::Unavailable("injected listing failure".into()));
        }
        let mut files: Vec<_> = self
            .files
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    fn upload_url(&self, file_id: &FileId, content_hash: &ContentHash) -> String {
        Self::url_for(file_id, content_hash)
    }

    fn download_url(&self, file_id: &FileId, content_hash: &ContentHash) -> String {
        Self::url_for(file_id, content_hash)
    }

    async fn put(&self, url: &str, content: &[u8]) -> Result<(), TransferError> {
        self.check_failing(url)?;
        self.blobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(url.to_string(), content.to_vec());
        Ok(())
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>, TransferError> {
        self.check_failing(url)?;
        self.blobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(url)
            .cloned()
            .ok_or_else(|| TransferError::NotFound(url.to_string()))
    }
}
