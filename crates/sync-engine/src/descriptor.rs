//! File identities and the descriptors exchanged between collector, remote and
//! planner.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use uuid::Uuid;

use crate::clock::VectorClock;
use crate::hash::ContentHash;

/// Stable identity of a file across renames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(Uuid);

impl FileId {
    /// Mint a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for FileId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for FileId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl Display for FileId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FileId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A file as it currently exists on this device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalFileDescriptor {
    pub file_id: FileId,
    pub path: String,
    pub size: u64,
    pub content_hash: ContentHash,
    pub vector_clock: VectorClock,
}

/// A file as the remote currently knows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFileDescriptor {
    pub file_id: FileId,
    pub path: String,
    pub size: u64,
    pub content_hash: ContentHash,
    pub vector_clock: VectorClock,
    /// Download location, when the remote hands one out with the listing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}
