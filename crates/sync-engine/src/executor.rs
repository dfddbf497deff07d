//! ActionExecutor: carries out a `SyncPlan` against the vault and the remote.
//!
//! Every action runs independently. A failed action is recorded in the report
//! and the batch continues. Actions that touch a common path share a lane and
//! run one after another in plan order; lanes run concurrently. FileIndex writes go through the engine's async
//! mutex and are persisted right after the action they belong to succeeds, so
//! the index always reflects exactly the completed actions.

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::action::{ActionKind, ClockMerge, SyncAction, SyncPlan};
use crate::activity::ActivityTracker;
use crate::clock::{ClockOrdering, VectorClock};
use crate::descriptor::FileId;
use crate::device_id::DeviceId;
use crate::events::{EventBus, SyncEvent};
use crate::fs::{parent_dir, FileSystem};
use crate::hash::ContentHash;
use crate::index::{FileIndex, FileIndexEntry, IndexError};
use crate::remote::{RemoteStore, TransferError};
use crate::title::extract_title;

/// Cooperative cancellation, checked before each action starts.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A transfer that finished, in the shape a server needs to confirm it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedFile {
    pub file_id: FileId,
    pub action: ActionKind,
    pub path: String,
    pub title: String,
    pub size: u64,
    pub content_hash: ContentHash,
    pub vector_clock: VectorClock,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_hash: Option<ContentHash>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionFailure {
    pub action: SyncAction,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub completed: Vec<CompletedFile>,
    pub deleted: Vec<FileId>,
    pub errors: Vec<ActionFailure>,
    /// The pass stopped early; actions not started are absent from the report
    pub cancelled: bool,
    /// Clock merges could not be persisted; they are planned again next pass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock_merge_error: Option<String>,
}

impl SyncReport {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty() && !self.cancelled && self.clock_merge_error.is_none()
    }
}

enum Outcome {
    Completed(CompletedFile),
    Deleted(FileId),
    Failed(ActionFailure),
    Cancelled,
}

pub struct ActionExecutor<'a, F: FileSystem, R: RemoteStore> {
    fs: &'a F,
    remote: &'a R,
    index: &'a Mutex<FileIndex>,
    device_id: &'a DeviceId,
    tracker: &'a ActivityTracker,
    events: &'a EventBus,
    max_concurrent: usize,
}

fn verify(path: &str, expected: &ContentHash, content: &[u8]) -> Result<(), TransferError> {
    let actual = ContentHash::of(content);
    if actual != *expected {
        return Err(TransferError::HashMismatch {
            path: path.to_string(),
            expected: expected.clone(),
            actual,
        });
    }
    Ok(())
}

impl<'a, F: FileSystem, R: RemoteStore> ActionExecutor<'a, F, R> {
    pub fn new(
        fs: &'a F,
        remote: &'a R,
        index: &'a Mutex<FileIndex>,
        device_id: &'a DeviceId,
        tracker: &'a ActivityTracker,
        events: &'a EventBus,
    ) -> Self {
        Self {
            fs,
            remote,
            index,
            device_id,
            tracker,
            events,
            max_concurrent: 1,
        }
    }

    /// Run up to `n` actions at once (minimum 1).
    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.max_concurrent = n.max(1);
        self
    }

    pub async fn execute(&self, plan: &SyncPlan, cancel: &CancelFlag) -> SyncReport {
        let mut report = SyncReport::default();

        if let Err(e) = self.apply_clock_merges(&plan.clock_merges).await {
            warn!("Failed to persist clock merges: {}", e);
            report.clock_merge_error = Some(e.to_string());
        }

        let lanes = lanes(&plan.actions, &*self.index.lock().await);
        let outcomes: Vec<Vec<Outcome>> = stream::iter(lanes)
            .map(|lane| self.run_lane(lane, cancel))
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;

        for outcome in outcomes.into_iter().flatten() {
            match outcome {
                Outcome::Completed(file) => report.completed.push(file),
                Outcome::Deleted(file_id) => report.deleted.push(file_id),
                Outcome::Failed(failure) => report.errors.push(failure),
                Outcome::Cancelled => report.cancelled = true,
            }
        }
        report.completed.sort_by(|a, b| a.path.cmp(&b.path));

        info!(
            "Executed plan: {} completed, {} deleted, {} failed{}",
            report.completed.len(),
            report.deleted.len(),
            report.errors.len(),
            if report.cancelled { " (cancelled)" } else { "" }
        );
        report
    }

    async fn run_lane(&self, lane: Vec<&SyncAction>, cancel: &CancelFlag) -> Vec<Outcome> {
        let mut outcomes = Vec::with_capacity(lane.len());
        for action in lane {
            outcomes.push(self.run(action, cancel).await);
        }
        outcomes
    }

    async fn run(&self, action: &SyncAction, cancel: &CancelFlag) -> Outcome {
        if cancel.is_cancelled() {
            return Outcome::Cancelled;
        }

        let file_id = action.file_id();
        let path = action.path().to_string();
        self.tracker
            .start_activity(file_id, &path, action.kind(), action.size());
        debug!("Starting {} of {}", action.kind(), path);

        let result = match action {
            SyncAction::Upload {
                file_id,
                path,
                upload_url,
                content_hash,
                local_vector_clock,
                expected_hash,
                ..
            } => {
                self.upload(
                    *file_id,
                    path,
                    upload_url,
                    content_hash,
                    local_vector_clock,
                    expected_hash,
                )
                .await
            }
            SyncAction::Download {
                file_id,
                path,
                url,
                content_hash,
                remote_vector_clock,
                ..
            } => {
                self.download(*file_id, path, url, content_hash, remote_vector_clock)
                    .await
            }
            SyncAction::Delete { file_id, path } => self.delete(*file_id, path).await,
            SyncAction::Conflict { .. } => self.conflict(action).await,
        };

        match result {
            Ok(outcome) => {
                self.tracker.complete_activity(&file_id, action.size());
                self.events.emit(SyncEvent::ActionCompleted {
                    action: action.kind(),
                    file_id,
                    path,
                });
                outcome
            }
            Err(e) => {
                warn!("{} of {} failed: {}", action.kind(), path, e);
                let error = e.to_string();
                self.tracker.fail_activity(&file_id, &error);
                self.events.emit(SyncEvent::ActionFailed {
                    action: action.kind(),
                    file_id,
                    path,
                    error: error.clone(),
                });
                Outcome::Failed(ActionFailure {
                    action: action.clone(),
                    error,
                })
            }
        }
    }

    async fn upload(
        &self,
        file_id: FileId,
        path: &str,
        upload_url: &str,
        planned_hash: &ContentHash,
        local_clock: &VectorClock,
        expected_hash: &Option<ContentHash>,
    ) -> Result<Outcome, TransferError> {
        let content = self.fs.read(path).await?;
        let content_hash = ContentHash::of(&content);
        if content_hash != *planned_hash {
            return Err(TransferError::ChangedSincePlan(path.to_string()));
        }

        self.remote.put(upload_url, &content).await?;

        let mut index = self.index.lock().await;
        let vector_clock = self.upload_clock(&index, file_id, local_clock);
        index
            .update(self.fs, |i| {
                i.set_many([(
                    path.to_string(),
                    FileIndexEntry::new(file_id, vector_clock.clone(), Some(content_hash.clone())),
                )])
            })
            .await?;

        Ok(Outcome::Completed(CompletedFile {
            file_id,
            action: ActionKind::Upload,
            path: path.to_string(),
            title: extract_title(path, &content),
            size: content.len() as u64,
            content_hash,
            vector_clock,
            expected_hash: expected_hash.clone(),
        }))
    }

    /// Clock recorded for an upload. A local edit bumps this device's counter
    /// once: the collector already did it when the clock is ahead of the index.
    fn upload_clock(&self, index: &FileIndex, file_id: FileId, local_clock: &VectorClock) -> VectorClock {
        match index.get_by_file_id(&file_id) {
            Some((_, entry)) if local_clock.compare(&entry.vector_clock) == ClockOrdering::After => {
                local_clock.clone()
            }
            _ => local_clock.increment(self.device_id),
        }
    }

    /// Refuse to write over a path that holds something else.
    async fn check_target(
        &self,
        index: &FileIndex,
        file_id: FileId,
        path: &str,
        incoming: &ContentHash,
    ) -> Result<(), TransferError> {
        if let Some(occupant) = index.get(path) {
            if occupant.file_id != file_id {
                return Err(TransferError::PathOccupied {
                    path: path.to_string(),
                    occupant: occupant.file_id,
                });
            }
            return Ok(());
        }

        match self.fs.stat(path).await {
            Ok(stat) if stat.is_dir => Err(TransferError::UntrackedInTheWay(path.to_string())),
            Ok(_) => {
                let existing = self.fs.read(path).await?;
                if ContentHash::of(&existing) == *incoming {
                    Ok(())
                } else {
                    Err(TransferError::UntrackedInTheWay(path.to_string()))
                }
            }
            Err(_) => Ok(()),
        }
    }

    async fn download(
        &self,
        file_id: FileId,
        path: &str,
        url: &str,
        content_hash: &ContentHash,
        remote_clock: &VectorClock,
    ) -> Result<Outcome, TransferError> {
        let content = self.remote.get(url).await?;
        verify(path, content_hash, &content)?;

        let mut index = self.index.lock().await;
        self.check_target(&index, file_id, path, content_hash).await?;

        let stale = index
            .get_by_file_id(&file_id)
            .map(|(p, _)| p.to_string())
            .filter(|p| p != path);

        self.fs.mkdir(parent_dir(path)).await?;
        self.fs.write(path, &content).await?;

        if let Some(stale) = stale {
            if matches!(self.fs.stat(&stale).await, Ok(stat) if !stat.is_dir) {
                debug!("Removing renamed file {} -> {}", stale, path);
                self.fs.delete(&stale).await?;
            }
        }

        index
            .update(self.fs, |i| {
                i.set_many([(
                    path.to_string(),
                    FileIndexEntry::new(file_id, remote_clock.clone(), Some(content_hash.clone())),
                )])
            })
            .await?;

        Ok(Outcome::Completed(CompletedFile {
            file_id,
            action: ActionKind::Download,
            path: path.to_string(),
            title: extract_title(path, &content),
            size: content.len() as u64,
            content_hash: content_hash.clone(),
            vector_clock: remote_clock.clone(),
            expected_hash: None,
        }))
    }

    async fn delete(&self, file_id: FileId, path: &str) -> Result<Outcome, TransferError> {
        let mut index = self.index.lock().await;

        let tracked_elsewhere = index.get(path).is_some_and(|e| e.file_id != file_id);
        if !tracked_elsewhere && matches!(self.fs.stat(path).await, Ok(stat) if !stat.is_dir) {
            self.fs.delete(path).await?;
        }

        index
            .update(self.fs, |i| {
                i.delete_file_id(&file_id);
            })
            .await?;

        Ok(Outcome::Deleted(file_id))
    }

    async fn conflict(&self, action: &SyncAction) -> Result<Outcome, TransferError> {
        let SyncAction::Conflict {
            file_id,
            path,
            url,
            upload_url,
            content_hash,
            local_content_hash,
            remote_vector_clock,
            local_vector_clock,
            conflict_rename,
            ..
        } = action
        else {
            return Err(TransferError::Unavailable(format!(
                "{} action routed as conflict",
                action.kind()
            )));
        };

        let remote_content = self.remote.get(url).await?;
        verify(conflict_rename, content_hash, &remote_content)?;

        let local_content = self.fs.read(path).await?;
        let local_hash = ContentHash::of(&local_content);
        if local_content_hash.as_ref().is_some_and(|planned| *planned != local_hash) {
            return Err(TransferError::ChangedSincePlan(path.clone()));
        }

        {
            let index = self.index.lock().await;
            if let Some(occupant) = index.get(path).filter(|e| e.file_id != *file_id) {
                return Err(TransferError::PathOccupied {
                    path: path.clone(),
                    occupant: occupant.file_id,
                });
            }
            if index.get(conflict_rename).is_some() || self.fs.exists(conflict_rename).await? {
                return Err(TransferError::UntrackedInTheWay(conflict_rename.clone()));
            }
        }

        self.remote.put(upload_url, &local_content).await?;

        let mut index = self.index.lock().await;
        self.fs.write(conflict_rename, &remote_content).await?;

        let merged = local_vector_clock.merge(remote_vector_clock);
        let copy_id = FileId::new();
        index
            .update(self.fs, |i| {
                i.set_many([
                    (
                        conflict_rename.clone(),
                        FileIndexEntry::new(copy_id, VectorClock::new(), None),
                    ),
                    (
                        path.clone(),
                        FileIndexEntry::new(*file_id, merged.clone(), Some(local_hash.clone())),
                    ),
                ])
            })
            .await?;
        info!("Resolved conflict on {}: remote copy kept as {}", path, conflict_rename);

        Ok(Outcome::Completed(CompletedFile {
            file_id: *file_id,
            action: ActionKind::Conflict,
            path: path.clone(),
            title: extract_title(path, &local_content),
            size: local_content.len() as u64,
            content_hash: local_hash,
            vector_clock: merged,
            expected_hash: Some(content_hash.clone()),
        }))
    }

    async fn apply_clock_merges(&self, merges: &[ClockMerge]) -> Result<(), IndexError> {
        if merges.is_empty() {
            return Ok(());
        }

        let mut index = self.index.lock().await;
        index
            .update(self.fs, |i| {
                for merge in merges {
                    let (path, clock) = match i.get_by_file_id(&merge.file_id) {
                        Some((path, entry)) => (
                            path.to_string(),
                            entry.vector_clock.merge(&merge.remote_vector_clock),
                        ),
                        None => (merge.path.clone(), merge.remote_vector_clock.clone()),
                    };
                    i.set_many([(
                        path,
                        FileIndexEntry::new(merge.file_id, clock, Some(merge.content_hash.clone())),
                    )]);
                }
            })
            .await?;

        debug!("Merged clocks for {} identical files", merges.len());
        Ok(())
    }
}

/// Group actions that touch a common path (including the path a download or
/// delete moves a tracked file away from). Each lane keeps plan order.
fn lanes<'p>(actions: &'p [SyncAction], index: &FileIndex) -> Vec<Vec<&'p SyncAction>> {
    fn root(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    let mut parent: Vec<usize> = (0..actions.len()).collect();
    let mut first_toucher: HashMap<&str, usize> = HashMap::new();
    for (i, action) in actions.iter().enumerate() {
        let mut touched = vec![action.path()];
        if let SyncAction::Conflict { conflict_rename, .. } = action {
            touched.push(conflict_rename);
        }
        if let Some((tracked, _)) = index.get_by_file_id(&action.file_id()) {
            touched.push(tracked);
        }

        for path in touched {
            match first_toucher.get(path) {
                Some(&j) => {
                    let (a, b) = (root(&mut parent, i), root(&mut parent, j));
                    parent[a.max(b)] = a.min(b);
                }
                None => {
                    first_toucher.insert(path, i);
                }
            }
        }
    }

    let mut lanes: BTreeMap<usize, Vec<&SyncAction>> = BTreeMap::new();
    for (i, action) in actions.iter().enumerate() {
        let lane = root(&mut parent, i);
        lanes.entry(lane).or_default().push(action);
    }
    lanes.into_values().collect()
}
