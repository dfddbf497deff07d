//! DeviceId: identifies this device in every vector clock it touches.
//!
//! Generated ids are 16 lowercase hex characters (a random non-zero u64), but
//! any short token without whitespace or `/` is accepted so ids minted by other
//! clients keep working.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;
use tracing::info;

use crate::fs::{FileSystem, FsError};
use crate::SYNC_DIR;

/// Where the device id is persisted inside the vault.
pub const DEVICE_ID_FILE: &str = ".sync/device_id";

const MAX_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum DeviceIdError {
    #[error("Device ID must not be empty")]
    Empty,
    #[error("Device ID longer than 64 characters")]
    TooLong,
    #[error("Device ID contains invalid character {0:?}")]
    InvalidChar(char),
    #[error("Failed to persist device ID: {0}")]
    Fs(#[from] FsError),
}

/// A unique identifier for a device participating in sync.
///
/// # Examples
/// ```
/// use sync_engine::DeviceId;
///
/// let id = DeviceId::generate();
/// assert_eq!(id.as_str().len(), 16);
///
/// let parsed: DeviceId = "laptop-1".parse().unwrap();
/// assert_eq!(parsed.to_string(), "laptop-1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    /// Generate a new random device ID. Never derived from a zero value.
    pub fn generate() -> Self {
        use rand::Rng;
        loop {
            let id: u64 = rand::rng().random();
            if id != 0 {
                return Self(format!("{:016x}", id));
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Read the vault's device ID, creating and persisting one on first use.
    pub async fn load_or_create<F: FileSystem>(fs: &F) -> Result<Self, DeviceIdError> {
        if fs.exists(DEVICE_ID_FILE).await? {
            let bytes = fs.read(DEVICE_ID_FILE).await?;
            let raw = String::from_utf8_lossy(&bytes);
            return raw.trim().parse();
        }

        let id = Self::generate();
        id.save(fs).await?;
        info!("Generated device ID: {}", id);
        Ok(id)
    }

    /// Persist this ID as the vault's device ID, replacing any existing one.
    pub async fn save<F: FileSystem>(&self, fs: &F) -> Result<(), DeviceIdError> {
        fs.mkdir(SYNC_DIR).await?;
        fs.write(DEVICE_ID_FILE, self.0.as_bytes()).await?;
        Ok(())
    }
}

impl Display for DeviceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DeviceId {
    type Err = DeviceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(DeviceIdError::Empty);
        }
        if s.len() > MAX_LEN {
            return Err(DeviceIdError::TooLong);
        }
        if let Some(c) = s.chars().find(|c| c.is_whitespace() || *c == '/') {
            return Err(DeviceIdError::InvalidChar(c));
        }
        Ok(Self(s.to_string()))
    }
}

impl serde::Serialize for DeviceId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for DeviceId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFs;

    #[test]
    fn test_generate_is_hex() {
        let id = DeviceId::generate();
        assert_eq!(id.as_str().len(), 16);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id.as_str(), "0000000000000000");
    }

    #[test]
    fn test_parse_accepts_short_tokens() {
        let id: DeviceId = "D1".parse().unwrap();
        assert_eq!(id.as_str(), "D1");
    }

    #[test]
    fn test_parse_rejects_invalid() {
        assert!(matches!("".parse::<DeviceId>(), Err(DeviceIdError::Empty)));
        assert!(matches!(
            "a".repeat(65).parse::<DeviceId>(),
            Err(DeviceIdError::TooLong)
        ));
        assert!(matches!(
            "my laptop".parse::<DeviceId>(),
            Err(DeviceIdError::InvalidChar(' '))
        ));
        assert!(matches!(
            "a/b".parse::<DeviceId>(),
            Err(DeviceIdError::InvalidChar('/'))
        ));
    }

    #[test]
    fn test_serde_roundtrip() {
        let original = DeviceId::generate();
        let json = serde_json::to_string(&original).unwrap();
        let parsed: DeviceId = serde_json::from_str(&json).unwrap();
        assert_eq!(original, parsed);
    }

    #[tokio::test]
    async fn test_load_or_create_is_stable() {
        let fs = InMemoryFs::new();

        let first = DeviceId::load_or_create(&fs).await.unwrap();
        let second = DeviceId::load_or_create(&fs).await.unwrap();

        assert_eq!(first, second);
        assert!(fs.exists(DEVICE_ID_FILE).await.unwrap());
    }

    #[tokio::test]
    async fn test_saved_id_is_loaded() {
        let fs = InMemoryFs::new();
        let id: DeviceId = "phone".parse().unwrap();
        id.save(&fs).await.unwrap();

        assert_eq!(DeviceId::load_or_create(&fs).await.unwrap(), id);
    }

    #[tokio::test]
    async fn test_load_trims_whitespace() {
        let fs = InMemoryFs::new();
        fs.write(DEVICE_ID_FILE, b"desktop\n").await.unwrap();

        let id = DeviceId::load_or_create(&fs).await.unwrap();
        assert_eq!(id.as_str(), "desktop");
    }
}
