//! Sync actions: what the planner decides and the executor carries out.
//!
//! `SyncAction` is the typed form; each variant holds exactly the fields its
//! executor path needs. `SyncActionDto` is the camelCase wire form, and
//! converting from it validates that the required fields are present.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

use crate::clock::VectorClock;
use crate::descriptor::FileId;
use crate::hash::ContentHash;
use crate::index::FileIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Upload,
    Download,
    Delete,
    Conflict,
}

impl Display for ActionKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            ActionKind::Upload => "upload",
            ActionKind::Download => "download",
            ActionKind::Delete => "delete",
            ActionKind::Conflict => "conflict",
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ActionError {
    #[error("{action} action for {path} is missing {field}")]
    MissingField {
        action: ActionKind,
        path: String,
        field: &'static str,
    },

    #[error("Conflict action for {path} violates conflict policy: {reason}")]
    ConflictPolicyViolation { path: String, reason: String },
}

/// One planned step for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum SyncAction {
    /// Send local bytes to the remote.
    Upload {
        file_id: FileId,
        path: String,
        upload_url: String,
        /// Hash of the local bytes when planned
        content_hash: ContentHash,
        local_vector_clock: VectorClock,
        /// Remote hash this upload replaces, for optimistic concurrency
        expected_hash: Option<ContentHash>,
        size: u64,
    },
    /// Fetch remote bytes (new file, newer version, rename or resurrection).
    Download {
        file_id: FileId,
        path: String,
        url: String,
        content_hash: ContentHash,
        remote_vector_clock: VectorClock,
        size: u64,
    },
    /// Drop the file locally and from the index.
    Delete { file_id: FileId, path: String },
    /// Keep local bytes at `path`, preserve the remote version at
    /// `conflict_rename` under a new file id.
    Conflict {
        file_id: FileId,
        path: String,
        url: String,
        upload_url: String,
        /// Remote version's hash
        content_hash: ContentHash,
        local_content_hash: Option<ContentHash>,
        remote_vector_clock: VectorClock,
        local_vector_clock: VectorClock,
        conflict_rename: String,
        size: u64,
    },
}

impl SyncAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            SyncAction::Upload { .. } => ActionKind::Upload,
            SyncAction::Download { .. } => ActionKind::Download,
            SyncAction::Delete { .. } => ActionKind::Delete,
            SyncAction::Conflict { .. } => ActionKind::Conflict,
        }
    }

    pub fn file_id(&self) -> FileId {
        match self {
            SyncAction::Upload { file_id, .. }
            | SyncAction::Download { file_id, .. }
            | SyncAction::Delete { file_id, .. }
            | SyncAction::Conflict { file_id, .. } => *file_id,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            SyncAction::Upload { path, .. }
            | SyncAction::Download { path, .. }
            | SyncAction::Delete { path, .. }
            | SyncAction::Conflict { path, .. } => path,
        }
    }

    /// Bytes this action is expected to transfer.
    pub fn size(&self) -> u64 {
        match self {
            SyncAction::Upload { size, .. }
            | SyncAction::Download { size, .. }
            | SyncAction::Conflict { size, .. } => *size,
            SyncAction::Delete { .. } => 0,
        }
    }

    /// Convert a wire action. The local clock is not on the wire; it is taken
    /// from the index (empty for files the index does not know).
    pub fn from_wire(dto: SyncActionDto, index: &FileIndex) -> Result<Self, ActionError> {
        let local_vector_clock = index
            .get_by_file_id(&dto.file_id)
            .map(|(_, entry)| entry.vector_clock.clone())
            .unwrap_or_default();

        let SyncActionDto {
            action,
            file_id,
            path,
            url,
            upload_url,
            content_hash,
            remote_vector_clock,
            conflict_rename,
            expected_hash,
            local_content_hash,
            size,
        } = dto;
        let size = size.unwrap_or(0);

        let missing = |field: &'static str| ActionError::MissingField {
            action,
            path: path.clone(),
            field,
        };
        let violation = |reason: &str| ActionError::ConflictPolicyViolation {
            path: path.clone(),
            reason: reason.to_string(),
        };

        match action {
            ActionKind::Upload => Ok(SyncAction::Upload {
                upload_url: upload_url.ok_or_else(|| missing("uploadUrl"))?,
                content_hash: content_hash.ok_or_else(|| missing("contentHash"))?,
                file_id,
                path,
                local_vector_clock,
                expected_hash,
                size,
            }),
            ActionKind::Download => Ok(SyncAction::Download {
                url: url.ok_or_else(|| missing("url"))?,
                content_hash: content_hash.ok_or_else(|| missing("contentHash"))?,
                remote_vector_clock: remote_vector_clock
                    .ok_or_else(|| missing("remoteVectorClock"))?,
                file_id,
                path,
                size,
            }),
            ActionKind::Delete => Ok(SyncAction::Delete { file_id, path }),
            ActionKind::Conflict => {
                let url = url.ok_or_else(|| violation("missing url"))?;
                let upload_url = upload_url.ok_or_else(|| violation("missing uploadUrl"))?;
                let content_hash = content_hash.ok_or_else(|| violation("missing contentHash"))?;
                let remote_vector_clock =
                    remote_vector_clock.ok_or_else(|| violation("missing remoteVectorClock"))?;
                let conflict_rename =
                    conflict_rename.ok_or_else(|| violation("missing conflictRename"))?;
                if conflict_rename.trim().is_empty() {
                    return Err(violation("conflictRename is empty"));
                }
                if conflict_rename == path {
                    return Err(violation("conflictRename equals path"));
                }
                Ok(SyncAction::Conflict {
                    file_id,
                    path,
                    url,
                    upload_url,
                    content_hash,
                    local_content_hash,
                    remote_vector_clock,
                    local_vector_clock,
                    conflict_rename,
                    size,
                })
            }
        }
    }

    pub fn to_wire(&self) -> SyncActionDto {
        let mut dto = SyncActionDto::new(self.kind(), self.file_id(), self.path());
        match self {
            SyncAction::Upload {
                upload_url,
                content_hash,
                expected_hash,
                size,
                ..
            } => {
                dto.upload_url = Some(upload_url.clone());
                dto.content_hash = Some(content_hash.clone());
                dto.expected_hash = expected_hash.clone();
                dto.size = Some(*size);
            }
            SyncAction::Download {
                url,
                content_hash,
                remote_vector_clock,
                size,
                ..
            } => {
                dto.url = Some(url.clone());
                dto.content_hash = Some(content_hash.clone());
                dto.remote_vector_clock = Some(remote_vector_clock.clone());
                dto.size = Some(*size);
            }
            SyncAction::Delete { .. } => {}
            SyncAction::Conflict {
                url,
                upload_url,
                content_hash,
                local_content_hash,
                remote_vector_clock,
                conflict_rename,
                size,
                ..
            } => {
                dto.url = Some(url.clone());
                dto.upload_url = Some(upload_url.clone());
                dto.content_hash = Some(content_hash.clone());
                dto.local_content_hash = local_content_hash.clone();
                dto.remote_vector_clock = Some(remote_vector_clock.clone());
                dto.conflict_rename = Some(conflict_rename.clone());
                dto.size = Some(*size);
            }
        }
        dto
    }
}

/// Wire form of a sync action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncActionDto {
    pub action: ActionKind,
    pub file_id: FileId,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<ContentHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_vector_clock: Option<VectorClock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_rename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_hash: Option<ContentHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_content_hash: Option<ContentHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl SyncActionDto {
    pub fn new(action: ActionKind, file_id: FileId, path: impl Into<String>) -> Self {
        Self {
            action,
            file_id,
            path: path.into(),
            url: None,
            upload_url: None,
            content_hash: None,
            remote_vector_clock: None,
            conflict_rename: None,
            expected_hash: None,
            local_content_hash: None,
            size: None,
        }
    }
}

/// A file whose clocks are concurrent but whose content is identical: only the
/// index clock needs merging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockMerge {
    pub file_id: FileId,
    pub path: String,
    pub content_hash: ContentHash,
    pub remote_vector_clock: VectorClock,
}

/// Planner output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPlan {
    pub actions: Vec<SyncAction>,
    pub clock_merges: Vec<ClockMerge>,
    pub bytes_total: u64,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.clock_merges.is_empty()
    }

    /// The action planned for a path, if any.
    pub fn action_for(&self, path: &str) -> Option<&SyncAction> {
        self.actions.iter().find(|a| a.path() == path)
    }

    pub fn to_wire(&self) -> Vec<SyncActionDto> {
        self.actions.iter().map(SyncAction::to_wire).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::FileIndexEntry;

    fn conflict_dto() -> SyncActionDto {
        let mut dto = SyncActionDto::new(ActionKind::Conflict, FileId::new(), "a.md");
        dto.url = Some("mem://x/remote".into());
        dto.upload_url = Some("mem://x/local".into());
        dto.content_hash = Some(ContentHash::of(b"remote"));
        dto.remote_vector_clock = Some(VectorClock::from([("D2", 1)]));
        dto.conflict_rename = Some("a (conflict).md".into());
        dto
    }

    #[test]
    fn test_wire_shape() {
        let dto = conflict_dto();
        let json = serde_json::to_value(&dto).unwrap();
        assert_eq!(json["action"], "conflict");
        assert_eq!(json["conflictRename"], "a (conflict).md");
        assert_eq!(json["remoteVectorClock"]["D2"], 1);
        assert!(json.get("expectedHash").is_none());

        let parsed: SyncActionDto = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, dto);
    }

    #[test]
    fn test_conflict_from_wire_takes_local_clock_from_index() {
        let dto = conflict_dto();
        let mut index = FileIndex::new();
        index.set_many([(
            "a.md".to_string(),
            FileIndexEntry::new(dto.file_id, VectorClock::from([("D1", 2)]), None),
        )]);

        let action = SyncAction::from_wire(dto, &index).unwrap();
        match action {
            SyncAction::Conflict {
                local_vector_clock,
                conflict_rename,
                ..
            } => {
                assert_eq!(local_vector_clock, VectorClock::from([("D1", 2)]));
                assert_eq!(conflict_rename, "a (conflict).md");
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_conflict_missing_fields_violates_policy() {
        let mut dto = conflict_dto();
        dto.conflict_rename = None;
        assert!(matches!(
            SyncAction::from_wire(dto, &FileIndex::new()),
            Err(ActionError::ConflictPolicyViolation { .. })
        ));

        let mut dto = conflict_dto();
        dto.upload_url = None;
        assert!(matches!(
            SyncAction::from_wire(dto, &FileIndex::new()),
            Err(ActionError::ConflictPolicyViolation { .. })
        ));
    }

    #[test]
    fn test_conflict_rename_onto_itself_violates_policy() {
        let mut dto = conflict_dto();
        dto.conflict_rename = Some("a.md".into());
        let err = SyncAction::from_wire(dto, &FileIndex::new()).unwrap_err();
        assert!(err.to_string().contains("conflictRename equals path"));
    }

    #[test]
    fn test_download_requires_url() {
        let mut dto = SyncActionDto::new(ActionKind::Download, FileId::new(), "b.md");
        dto.content_hash = Some(ContentHash::of(b"b"));
        dto.remote_vector_clock = Some(VectorClock::new());

        assert_eq!(
            SyncAction::from_wire(dto, &FileIndex::new()),
            Err(ActionError::MissingField {
                action: ActionKind::Download,
                path: "b.md".into(),
                field: "url",
            })
        );
    }

    #[test]
    fn test_delete_needs_nothing_else() {
        let dto = SyncActionDto::new(ActionKind::Delete, FileId::new(), "c.md");
        let action = SyncAction::from_wire(dto.clone(), &FileIndex::new()).unwrap();
        assert_eq!(action.kind(), ActionKind::Delete);
        assert_eq!(action.to_wire(), dto);
    }

    #[test]
    fn test_upload_to_wire_and_back() {
        let action = SyncAction::Upload {
            file_id: FileId::new(),
            path: "notes/a.md".into(),
            upload_url: "mem://a".into(),
            content_hash: ContentHash::of(b"a"),
            local_vector_clock: VectorClock::new(),
            expected_hash: Some(ContentHash::of(b"old")),
            size: 1,
        };

        let back = SyncAction::from_wire(action.to_wire(), &FileIndex::new()).unwrap();
        assert_eq!(back, action);
    }
}
