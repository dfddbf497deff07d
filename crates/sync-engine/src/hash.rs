//! Content hashes for content-addressed transfers.
//!
//! A file version is identified on the wire by its SHA-256 digest. Two
//! versions with the same hash are byte-identical, which is what lets the
//! planner skip false conflicts and the executor verify downloads.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::{self, Display, Formatter};

/// Lowercase hex SHA-256 of a file's bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Compute hash from content bytes.
    pub fn of(content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content);
        Self(hex::encode(hasher.finalize()))
    }

    /// Wrap a digest received from elsewhere (remote listing, wire action).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Does `content` hash to this digest?
    pub fn matches(&self, content: &[u8]) -> bool {
        Self::of(content) == *self
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
