//! SyncPlanner: classifies every known file into the minimal action.
//!
//! The planner is pure: it reads the collection, the remote listing and the
//! FileIndex, and produces a `SyncPlan`. Nothing is transferred or persisted.
//!
//! Decision table, per file id:
//!
//! | index | local | remote | action                                        |
//! |-------|-------|--------|-----------------------------------------------|
//! | -     | yes   | -      | upload                                        |
//! | -     | -     | yes    | download                                      |
//! | yes   | -     | -      | delete (drop the entry)                       |
//! | yes   | -     | yes    | download if remote is After the entry, else delete |
//! | yes   | yes   | -      | upload if changed since last sync, else delete |
//! | any   | yes   | yes    | by clock comparison (see `compare_pair`)       |
//!
//! An untracked local file sitting at the path of an untracked remote file is
//! a path collision and is resolved before the table applies.
//!
//! The remote may list one path for several file ids (two devices created
//! the same name before seeing each other). The lowest id keeps the path; the
//! others are planned as if the remote had them where this device tracks them,
//! or at a fresh conflict name, and an upload then publishes that path.
//! Downloads never land on a path another file keeps after the pass: they go
//! back to where the file already is, or to a conflict name.

use std::collections::{BTreeSet, HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::action::{ActionKind, ClockMerge, SyncAction, SyncPlan};
use crate::clock::{ClockOrdering, VectorClock};
use crate::collector::Collection;
use crate::descriptor::{FileId, LocalFileDescriptor, RemoteFileDescriptor};
use crate::device_id::DeviceId;
use crate::hash::ContentHash;
use crate::index::FileIndex;
use crate::remote::RemoteStore;
use crate::title::file_stem;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("Remote listing contains file id {0} more than once")]
    DuplicateRemoteFileId(FileId),
}

pub struct SyncPlanner<'a, R: RemoteStore + ?Sized> {
    remote: &'a R,
    device_id: &'a DeviceId,
    conflict_suffix: &'a str,
}

/// Everything the planner looks up while classifying.
struct Inputs<'p> {
    local_by_id: HashMap<FileId, &'p LocalFileDescriptor>,
    remote_by_id: HashMap<FileId, &'p RemoteFileDescriptor>,
    /// Paths that exist but could not be collected; never treated as deleted
    skipped: HashSet<&'p str>,
    /// Paths a conflict copy must not take
    taken: HashSet<String>,
    /// Ids planned away from the path the remote lists them at
    displaced: HashSet<FileId>,
}

impl<'a, R: RemoteStore + ?Sized> SyncPlanner<'a, R> {
    pub fn new(remote: &'a R, device_id: &'a DeviceId, conflict_suffix: &'a str) -> Self {
        Self {
            remote,
            device_id,
            conflict_suffix,
        }
    }

    pub fn plan(
        &self,
        collection: &Collection,
        remote: &[RemoteFileDescriptor],
        index: &FileIndex,
    ) -> Result<SyncPlan, PlanError> {
        let mut taken: HashSet<String> = collection
            .files
            .iter()
            .map(|l| l.path.clone())
            .chain(remote.iter().map(|r| r.path.clone()))
            .chain(index.get_all().map(|(p, _)| p.to_string()))
            .chain(collection.skipped.iter().map(|(p, _)| p.clone()))
            .collect();

        let (remote, displaced) = self.separate_shared_paths(remote, index, &mut taken)?;
        let remote_by_id = remote.iter().map(|r| (r.file_id, r)).collect();
        let remote_by_path: HashMap<&str, &RemoteFileDescriptor> =
            remote.iter().map(|r| (r.path.as_str(), r)).collect();

        let local_by_id: HashMap<FileId, &LocalFileDescriptor> =
            collection.files.iter().map(|l| (l.file_id, l)).collect();

        let mut inputs = Inputs {
            local_by_id,
            remote_by_id,
            skipped: collection.skipped.iter().map(|(p, _)| p.as_str()).collect(),
            taken,
            displaced,
        };

        let mut plan = SyncPlan::default();
        let mut resolved: HashSet<FileId> = HashSet::new();

        // Path collisions: untracked on both sides, same path
        for local in &collection.files {
            if index.get_by_file_id(&local.file_id).is_some() {
                continue;
            }
            let Some(remote) = remote_by_path.get(local.path.as_str()) else {
                continue;
            };
            if index.get_by_file_id(&remote.file_id).is_some()
                || inputs.local_by_id.contains_key(&remote.file_id)
            {
                continue;
            }

            debug!("Path collision at {}", local.path);
            let action = if local.content_hash == remote.content_hash {
                self.download(remote, &local.path)
            } else {
                let local_clock = local.vector_clock.increment(self.device_id);
                self.conflict(remote.file_id, local, &local_clock, remote, &mut inputs)
            };
            plan.actions.push(action);
            resolved.insert(local.file_id);
            resolved.insert(remote.file_id);
        }

        let ids: BTreeSet<FileId> = inputs
            .local_by_id
            .keys()
            .chain(inputs.remote_by_id.keys())
            .copied()
            .chain(index.get_all().map(|(_, e)| e.file_id))
            .filter(|id| !resolved.contains(id))
            .collect();

        for file_id in ids {
            let local = inputs.local_by_id.get(&file_id).copied();
            let remote = inputs.remote_by_id.get(&file_id).copied();
            let entry = index.get_by_file_id(&file_id);

            match (entry, local, remote) {
                (_, Some(local), Some(remote)) => {
                    self.compare_pair(local, remote, &mut inputs, &mut plan);
                }
                (None, Some(local), None) => {
                    plan.actions.push(self.upload(local, None));
                }
                (None, None, Some(remote)) => {
                    plan.actions.push(self.download(remote, &remote.path));
                }
                (Some((path, _)), None, _) if inputs.skipped.contains(path) => {
                    debug!("Not planning {}: it could not be collected", path);
                }
                (Some((path, _)), None, None) => {
                    plan.actions.push(SyncAction::Delete {
                        file_id,
                        path: path.to_string(),
                    });
                }
                (Some((path, entry)), None, Some(remote)) => {
                    // Deleted here; only a strictly newer remote edit survives
                    if remote.vector_clock.compare(&entry.vector_clock) == ClockOrdering::After {
                        debug!("Resurrecting {}: remote edit is newer than local delete", path);
                        plan.actions.push(self.download(remote, &remote.path));
                    } else {
                        plan.actions.push(SyncAction::Delete {
                            file_id,
                            path: path.to_string(),
                        });
                    }
                }
                (Some((_, entry)), Some(local), None) => {
                    // Deleted elsewhere; a local edit wins over the deletion
                    if entry.content_hash.as_ref() == Some(&local.content_hash) {
                        plan.actions.push(SyncAction::Delete {
                            file_id,
                            path: local.path.clone(),
                        });
                    } else {
                        plan.actions.push(self.upload(local, None));
                    }
                }
                (None, None, None) => {}
            }
        }

        self.redirect_blocked_downloads(collection, &resolved, &mut inputs, &mut plan);

        // Deletes first so a path freed in this pass can be reused by a download
        plan.actions.sort_by(|a, b| {
            let not_delete = |action: &SyncAction| action.kind() != ActionKind::Delete;
            a.path()
                .cmp(b.path())
                .then_with(|| not_delete(a).cmp(&not_delete(b)))
                .then_with(|| a.file_id().cmp(&b.file_id()))
        });
        plan.clock_merges.sort_by(|a, b| a.path.cmp(&b.path));
        plan.bytes_total = plan.actions.iter().map(SyncAction::size).sum();

        info!(
            "Planned {} actions and {} clock merges ({} bytes)",
            plan.actions.len(),
            plan.clock_merges.len(),
            plan.bytes_total
        );
        Ok(plan)
    }

    /// Both sides hold the file: decide from the clocks.
    fn compare_pair(
        &self,
        local: &LocalFileDescriptor,
        remote: &RemoteFileDescriptor,
        inputs: &mut Inputs<'_>,
        plan: &mut SyncPlan,
    ) {
        match local.vector_clock.compare(&remote.vector_clock) {
            ClockOrdering::Equal if local.content_hash != remote.content_hash => {
                // Same history, different bytes: treat the local copy as a new edit
                let local_clock = local.vector_clock.increment(self.device_id);
                let action = self.conflict(local.file_id, local, &local_clock, remote, inputs);
                plan.actions.push(action);
            }
            ClockOrdering::Equal if local.path != remote.path => {
                debug!("Remote rename {} -> {}", local.path, remote.path);
                plan.actions.push(self.download(remote, &remote.path));
            }
            ClockOrdering::Equal if inputs.displaced.contains(&local.file_id) => {
                debug!("Publishing {} at {}", local.file_id, local.path);
                plan.actions
                    .push(self.upload(local, Some(remote.content_hash.clone())));
            }
            ClockOrdering::Equal => {}
            ClockOrdering::Before => {
                plan.actions.push(self.download(remote, &remote.path));
            }
            ClockOrdering::After => {
                plan.actions
                    .push(self.upload(local, Some(remote.content_hash.clone())));
            }
            ClockOrdering::Concurrent
                if local.content_hash == remote.content_hash && local.path != remote.path =>
            {
                // Same bytes, moved elsewhere: follow the rename, keeping both histories
                debug!("Remote rename {} -> {} with concurrent clocks", local.path, remote.path);
                let mut action = self.download(remote, &remote.path);
                if let SyncAction::Download {
                    remote_vector_clock, ..
                } = &mut action
                {
                    *remote_vector_clock = local.vector_clock.merge(&remote.vector_clock);
                }
                plan.actions.push(action);
            }
            ClockOrdering::Concurrent if local.content_hash == remote.content_hash => {
                plan.clock_merges.push(ClockMerge {
                    file_id: local.file_id,
                    path: local.path.clone(),
                    content_hash: local.content_hash.clone(),
                    remote_vector_clock: remote.vector_clock.clone(),
                });
            }
            ClockOrdering::Concurrent => {
                let action =
                    self.conflict(local.file_id, local, &local.vector_clock, remote, inputs);
                plan.actions.push(action);
            }
        }
    }

    /// Give every remote file a path of its own. Where ids share a path the
    /// lowest keeps it; each other id goes where the index tracks it, or to a
    /// fresh conflict name. Returns the rewritten listing and the moved ids.
    fn separate_shared_paths(
        &self,
        remote: &[RemoteFileDescriptor],
        index: &FileIndex,
        taken: &mut HashSet<String>,
    ) -> Result<(Vec<RemoteFileDescriptor>, HashSet<FileId>), PlanError> {
        let mut seen = HashSet::new();
        let mut keepers: HashMap<&str, FileId> = HashMap::new();
        for r in remote {
            if !seen.insert(r.file_id) {
                return Err(PlanError::DuplicateRemoteFileId(r.file_id));
            }
            keepers
                .entry(r.path.as_str())
                .and_modify(|keeper| *keeper = (*keeper).min(r.file_id))
                .or_insert(r.file_id);
        }

        let mut displaced = HashSet::new();
        let mut separated = Vec::with_capacity(remote.len());
        for r in remote {
            let mut r = r.clone();
            if keepers.get(r.path.as_str()) != Some(&r.file_id) {
                let target = match index.get_by_file_id(&r.file_id) {
                    Some((path, _)) if path != r.path => path.to_string(),
                    _ => self.allocate_conflict_path(&r.path, taken),
                };
                warn!(
                    "Remote lists {} for more than one file; planning {} at {}",
                    r.path, r.file_id, target
                );
                displaced.insert(r.file_id);
                r.path = target;
            }
            separated.push(r);
        }
        Ok((separated, displaced))
    }

    /// Move downloads off paths that another file keeps after this pass.
    ///
    /// A blocked file already present here stays where it is (an upload
    /// publishes that path when the bytes already match); anything else is
    /// fetched to a fresh conflict name.
    fn redirect_blocked_downloads(
        &self,
        collection: &Collection,
        resolved: &HashSet<FileId>,
        inputs: &mut Inputs<'_>,
        plan: &mut SyncPlan,
    ) {
        // Path -> file held there after the pass; None when not tracked
        let mut held: HashMap<String, Option<FileId>> = HashMap::new();
        for local in &collection.files {
            if !resolved.contains(&local.file_id) {
                held.insert(local.path.clone(), Some(local.file_id));
            }
        }
        for (path, _) in &collection.skipped {
            held.entry(path.clone()).or_insert(None);
        }
        for action in &plan.actions {
            let file_id = action.file_id();
            match action {
                SyncAction::Delete { path, .. } => {
                    if held.get(path) == Some(&Some(file_id)) {
                        held.remove(path);
                    }
                }
                SyncAction::Download { path, .. } => {
                    // A move frees the path the file leaves
                    if let Some(local) = inputs.local_by_id.get(&file_id) {
                        if local.path != *path && held.get(&local.path) == Some(&Some(file_id)) {
                            held.remove(&local.path);
                        }
                    }
                }
                SyncAction::Conflict {
                    path,
                    conflict_rename,
                    ..
                } => {
                    held.insert(path.clone(), Some(file_id));
                    held.insert(conflict_rename.clone(), None);
                }
                SyncAction::Upload { .. } => {}
            }
        }

        let mut downloads: Vec<usize> = plan
            .actions
            .iter()
            .enumerate()
            .filter(|(_, a)| a.kind() == ActionKind::Download)
            .map(|(i, _)| i)
            .collect();
        downloads.sort_by(|&a, &b| {
            let (a, b) = (&plan.actions[a], &plan.actions[b]);
            a.path().cmp(b.path()).then_with(|| a.file_id().cmp(&b.file_id()))
        });

        for i in downloads {
            let file_id = plan.actions[i].file_id();
            let path = plan.actions[i].path().to_string();
            let free = |held: &HashMap<String, Option<FileId>>, path: &str| match held.get(path) {
                None => true,
                Some(occupant) => *occupant == Some(file_id),
            };
            if free(&held, &path) {
                held.insert(path, Some(file_id));
                continue;
            }

            let local = inputs.local_by_id.get(&file_id).copied();
            let remote = inputs.remote_by_id.get(&file_id).copied();
            match (local, remote) {
                (Some(local), Some(remote)) if free(&held, &local.path) => {
                    info!("{} is taken; keeping {} at {}", path, file_id, local.path);
                    if local.content_hash == remote.content_hash {
                        let mut upload = self.upload(local, Some(remote.content_hash.clone()));
                        if let SyncAction::Upload {
                            local_vector_clock, ..
                        } = &mut upload
                        {
                            *local_vector_clock = local.vector_clock.merge(&remote.vector_clock);
                        }
                        plan.actions[i] = upload;
                    } else {
                        plan.actions[i] = self.download(remote, &local.path);
                    }
                    held.insert(local.path.clone(), Some(file_id));
                }
                (_, Some(remote)) => {
                    let target = self.allocate_conflict_path(&path, &mut inputs.taken);
                    info!("{} is taken; fetching {} to {}", path, file_id, target);
                    plan.actions[i] = self.download(remote, &target);
                    held.insert(target, Some(file_id));
                }
                (_, None) => {
                    warn!("Download of {} at {} is blocked and has no remote entry", file_id, path);
                }
            }
        }
    }

    fn upload(
        &self,
        local: &LocalFileDescriptor,
        expected_hash: Option<ContentHash>,
    ) -> SyncAction {
        SyncAction::Upload {
            file_id: local.file_id,
            path: local.path.clone(),
            upload_url: self.remote.upload_url(&local.file_id, &local.content_hash),
            content_hash: local.content_hash.clone(),
            local_vector_clock: local.vector_clock.clone(),
            expected_hash,
            size: local.size,
        }
    }

    fn download(&self, remote: &RemoteFileDescriptor, path: &str) -> SyncAction {
        SyncAction::Download {
            file_id: remote.file_id,
            path: path.to_string(),
            url: self.download_url(remote),
            content_hash: remote.content_hash.clone(),
            remote_vector_clock: remote.vector_clock.clone(),
            size: remote.size,
        }
    }

    fn conflict(
        &self,
        file_id: FileId,
        local: &LocalFileDescriptor,
        local_clock: &VectorClock,
        remote: &RemoteFileDescriptor,
        inputs: &mut Inputs<'_>,
    ) -> SyncAction {
        let conflict_rename = self.allocate_conflict_path(&local.path, &mut inputs.taken);
        info!("Conflict on {}: remote copy goes to {}", local.path, conflict_rename);
        SyncAction::Conflict {
            file_id,
            path: local.path.clone(),
            url: self.download_url(remote),
            upload_url: self.remote.upload_url(&file_id, &local.content_hash),
            content_hash: remote.content_hash.clone(),
            local_content_hash: Some(local.content_hash.clone()),
            remote_vector_clock: remote.vector_clock.clone(),
            local_vector_clock: local_clock.clone(),
            conflict_rename,
            size: remote.size + local.size,
        }
    }

    fn download_url(&self, remote: &RemoteFileDescriptor) -> String {
        remote
            .url
            .clone()
            .unwrap_or_else(|| self.remote.download_url(&remote.file_id, &remote.content_hash))
    }

    /// First free `"<stem> (<suffix>[ n]).<ext>"` next to `path`.
    fn allocate_conflict_path(&self, path: &str, taken: &mut HashSet<String>) -> String {
        let mut n = 1;
        loop {
            let candidate = conflict_path(path, self.conflict_suffix, n);
            if taken.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }
}

/// Name of the `n`th conflict copy of `path`.
pub fn conflict_path(path: &str, suffix: &str, n: usize) -> String {
    let (dir, name) = match path.rfind('/') {
        Some(pos) => (&path[..=pos], &path[pos + 1..]),
        None => ("", path),
    };
    let stem = file_stem(name);
    let ext = &name[stem.len()..];
    if n <= 1 {
        format!("{}{} ({}){}", dir, stem, suffix, ext)
    } else {
        format!("{}{} ({} {}){}", dir, stem, suffix, n, ext)
    }
}
