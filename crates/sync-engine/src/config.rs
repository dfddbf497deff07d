//! Engine configuration, stored per vault in `.sync/config.json`.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::fs::{FileSystem, FsError};
use crate::SYNC_DIR;

pub const CONFIG_FILE: &str = ".sync/config.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),

    #[error("Failed to parse .sync/config.json: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration for a vault's sync engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    /// Files larger than this are never collected (default: 50 MiB)
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Word used when naming conflict copies: `a (conflict).md`
    #[serde(default = "default_conflict_suffix")]
    pub conflict_suffix: String,

    /// How many actions may transfer at once (1 = sequential)
    #[serde(default = "default_max_concurrent_transfers")]
    pub max_concurrent_transfers: usize,

    /// Activity tracker bounds
    #[serde(default)]
    pub activity: ActivityConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityConfig {
    /// Most-recent completed/failed entries kept (default: 5)
    #[serde(default = "default_recent_capacity")]
    pub recent_capacity: usize,

    /// Queued transfers kept before the oldest is evicted (default: 1000)
    #[serde(default = "default_pending_capacity")]
    pub pending_capacity: usize,

    /// Entries older than this are swept (default: 30 minutes)
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,

    /// How often the sweep runs (default: 5 minutes)
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl ActivityConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            recent_capacity: default_recent_capacity(),
            pending_capacity: default_pending_capacity(),
            max_age_secs: default_max_age_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_max_file_size() -> u64 {
    50 * 1024 * 1024
}

fn default_conflict_suffix() -> String {
    "conflict".to_string()
}

fn default_max_concurrent_transfers() -> usize {
    1
}

fn default_recent_capacity() -> usize {
    5
}

fn default_pending_capacity() -> usize {
    1000
}

fn default_max_age_secs() -> u64 {
    30 * 60
}

fn default_sweep_interval_secs() -> u64 {
    5 * 60
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            conflict_suffix: default_conflict_suffix(),
            max_concurrent_transfers: default_max_concurrent_transfers(),
            activity: ActivityConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from the vault, falling back to defaults when absent.
    pub async fn load<F: FileSystem>(fs: &F) -> Result<Self, ConfigError> {
        if !fs.exists(CONFIG_FILE).await? {
            debug!("No {} found, using defaults", CONFIG_FILE);
            return Ok(Self::default());
        }

        let content = fs.read(CONFIG_FILE).await?;
        let config: SyncConfig = serde_json::from_slice(&content)?;
        config.validate()?;
        info!("Loaded configuration from {}", CONFIG_FILE);
        Ok(config)
    }

    /// Write this configuration into the vault (used by `init`).
    pub async fn save<F: FileSystem>(&self, fs: &F) -> Result<(), ConfigError> {
        fs.mkdir(SYNC_DIR).await?;
        let content = serde_json::to_vec_pretty(self)?;
        fs.write(CONFIG_FILE, &content).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_transfers == 0 {
            return Err(ConfigError::Invalid(
                "maxConcurrentTransfers must be at least 1".into(),
            ));
        }
        let suffix = self.conflict_suffix.trim();
        if suffix.is_empty() || suffix.contains(['/', '(', ')']) {
            return Err(ConfigError::Invalid(format!(
                "conflictSuffix {:?} is not usable in a file name",
                self.conflict_suffix
            )));
        }
        if self.activity.recent_capacity == 0 || self.activity.pending_capacity == 0 {
            return Err(ConfigError::Invalid(
                "activity capacities must be at least 1".into(),
            ));
        }
        if self.activity.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "activity.sweepIntervalSecs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFs;

    #[tokio::test]
    async fn test_missing_config_uses_defaults() {
        let fs = InMemoryFs::new();
        let config = SyncConfig::load(&fs).await.unwrap();

        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.activity.recent_capacity, 5);
        assert_eq!(config.activity.pending_capacity, 1000);
        assert_eq!(config.activity.max_age(), Duration::from_secs(1800));
        assert_eq!(config.activity.sweep_interval(), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_partial_config_fills_defaults() {
        let fs = InMemoryFs::new();
        fs.write(CONFIG_FILE, br#"{"maxFileSize": 1024, "activity": {"recentCapacity": 3}}"#)
            .await
            .unwrap();

        let config = SyncConfig::load(&fs).await.unwrap();
        assert_eq!(config.max_file_size, 1024);
        assert_eq!(config.conflict_suffix, "conflict");
        assert_eq!(config.activity.recent_capacity, 3);
        assert_eq!(config.activity.pending_capacity, 1000);
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let fs = InMemoryFs::new();
        let config = SyncConfig {
            max_concurrent_transfers: 4,
            ..SyncConfig::default()
        };
        config.save(&fs).await.unwrap();

        assert_eq!(SyncConfig::load(&fs).await.unwrap(), config);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let fs = InMemoryFs::new();
        fs.write(CONFIG_FILE, br#"{"maxConcurrentTransfers": 0}"#)
            .await
            .unwrap();
        assert!(matches!(
            SyncConfig::load(&fs).await,
            Err(ConfigError::Invalid(_))
        ));

        fs.write(CONFIG_FILE, br#"{"conflictSuffix": "a/b"}"#)
            .await
            .unwrap();
        assert!(matches!(
            SyncConfig::load(&fs).await,
            Err(ConfigError::Invalid(_))
        ));

        fs.write(CONFIG_FILE, b"not json").await.unwrap();
        assert!(matches!(
            SyncConfig::load(&fs).await,
            Err(ConfigError::Parse(_))
        ));
    }
}
