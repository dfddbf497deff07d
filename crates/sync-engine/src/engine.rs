//! SyncEngine: per-vault context that drives one sync pass.
//!
//! A pass moves the engine `idle -> planning -> syncing -> idle`. Planning
//! collects local state, fetches the remote listing and builds a plan; if any
//! of that fails the pass aborts before a single action runs. Syncing executes
//! the plan and leaves a report.
//!
//! The engine owns its FileIndex behind an async mutex and its own
//! ActivityTracker; nothing is shared between vaults.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::action::SyncPlan;
use crate::activity::{ActivityTracker, StatusDetail, SyncStatus};
use crate::collector::LocalFileCollector;
use crate::config::{ConfigError, SyncConfig};
use crate::device_id::{DeviceId, DeviceIdError};
use crate::events::{EventBus, SyncEvent};
use crate::executor::{ActionExecutor, CancelFlag, SyncReport};
use crate::fs::FileSystem;
use crate::index::{FileIndex, IndexError, INDEX_FILE};
use crate::planner::{PlanError, SyncPlanner};
use crate::remote::{RemoteStore, TransferError};

const CORRUPT_INDEX_FILE: &str = ".sync/file_index.json.corrupt";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("A sync pass is already running")]
    AlreadySyncing,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Device ID error: {0}")]
    DeviceId(#[from] DeviceIdError),

    #[error("File index error: {0}")]
    Index(#[from] IndexError),

    #[error("Cannot obtain remote state: {0}")]
    RemoteState(TransferError),

    #[error("Cannot plan against remote state: {0}")]
    Plan(#[from] PlanError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Resets the running flag when a pass ends, however it ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SyncEngine<F: FileSystem, R: RemoteStore> {
    fs: F,
    remote: R,
    config: SyncConfig,
    device_id: DeviceId,
    index: Mutex<FileIndex>,
    tracker: ActivityTracker,
    events: Arc<EventBus>,
    running: AtomicBool,
}

impl<F: FileSystem, R: RemoteStore> SyncEngine<F, R> {
    /// Open a vault using its stored configuration and device ID.
    pub async fn open(fs: F, remote: R) -> Result<Self> {
        let config = SyncConfig::load(&fs).await?;
        let device_id = DeviceId::load_or_create(&fs).await?;
        Self::open_with(fs, remote, config, device_id).await
    }

    /// Open a vault with explicit configuration and device ID.
    pub async fn open_with(fs: F, remote: R, config: SyncConfig, device_id: DeviceId) -> Result<Self> {
        config.validate()?;
        let index = Self::load_index(&fs).await?;
        info!(
            "Opened vault as device {} with {} tracked files",
            device_id,
            index.len()
        );

        Ok(Self {
            fs,
            remote,
            tracker: ActivityTracker::new(config.activity.clone()),
            config,
            device_id,
            index: Mutex::new(index),
            events: Arc::new(EventBus::new()),
            running: AtomicBool::new(false),
        })
    }

    /// Load the index, setting a corrupt one aside and starting empty. Stale
    /// clocks are worse than a full re-collection.
    async fn load_index(fs: &F) -> Result<FileIndex> {
        match FileIndex::load(fs).await {
            Ok(index) => Ok(index),
            Err(IndexError::Corrupted(reason)) => {
                warn!("{}; moving it to {} and starting fresh", reason, CORRUPT_INDEX_FILE);
                if let Err(e) = fs.rename(INDEX_FILE, CORRUPT_INDEX_FILE).await {
                    warn!("Failed to move corrupt index aside: {}", e);
                }
                Ok(FileIndex::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn fs(&self) -> &F {
        &self.fs
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn tracker(&self) -> &ActivityTracker {
        &self.tracker
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn status(&self) -> SyncStatus {
        self.tracker.status()
    }

    pub fn status_detail(&self) -> StatusDetail {
        self.tracker.status_detail()
    }

    /// Copy of the current FileIndex.
    pub async fn index_snapshot(&self) -> FileIndex {
        self.index.lock().await.clone()
    }

    fn set_status(&self, status: SyncStatus, error: Option<String>) {
        self.tracker.set_status(status);
        self.events.emit(SyncEvent::StatusChanged { status, error });
    }

    /// Collect, fetch remote state and plan without executing anything.
    pub async fn plan(&self) -> Result<SyncPlan> {
        let index = self.index.lock().await;

        let collection = LocalFileCollector::new(&self.fs, &self.device_id, self.config.max_file_size)
            .collect(&index)
            .await;
        if !collection.skipped.is_empty() {
            info!("Skipped {} files during collection", collection.skipped.len());
        }

        let remote_files = self
            .remote
            .list_files()
            .await
            .map_err(EngineError::RemoteState)?;

        let plan = SyncPlanner::new(&self.remote, &self.device_id, &self.config.conflict_suffix)
            .plan(&collection, &remote_files, &index)?;
        Ok(plan)
    }

    /// Run one full pass.
    pub async fn sync(&self) -> Result<SyncReport> {
        self.sync_with_cancel(&CancelFlag::new()).await
    }

    /// Run one full pass, stopping before the next action once `cancel` is set.
    pub async fn sync_with_cancel(&self, cancel: &CancelFlag) -> Result<SyncReport> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadySyncing);
        }
        let _running = RunningGuard(&self.running);

        info!("Starting sync pass");
        self.set_status(SyncStatus::Planning, None);

        let plan = match self.plan().await {
            Ok(plan) => plan,
            Err(e) => {
                warn!("Sync pass aborted: {}", e);
                let message = e.to_string();
                self.tracker.finish_sync(Some(message.clone()));
                self.events.emit(SyncEvent::StatusChanged {
                    status: SyncStatus::Idle,
                    error: Some(message),
                });
                return Err(e);
            }
        };

        self.tracker.start_sync(plan.actions.len(), plan.bytes_total);
        self.events.emit(SyncEvent::StatusChanged {
            status: SyncStatus::Syncing,
            error: None,
        });
        for action in &plan.actions {
            self.tracker
                .add_pending(action.file_id(), action.path(), action.kind(), action.size());
        }

        let report = ActionExecutor::new(
            &self.fs,
            &self.remote,
            &self.index,
            &self.device_id,
            &self.tracker,
            &self.events,
        )
        .with_concurrency(self.config.max_concurrent_transfers)
        .execute(&plan, cancel)
        .await;

        for action in &plan.actions {
            self.tracker.remove_pending(&action.file_id());
        }

        let error = match (report.errors.len(), &report.clock_merge_error) {
            (0, None) => None,
            (0, Some(e)) => Some(format!("Clock merges not saved: {}", e)),
            (n, _) => Some(format!("{} of {} actions failed", n, plan.actions.len())),
        };
        self.tracker.finish_sync(error.clone());
        self.events.emit(SyncEvent::PassFinished {
            completed: report.completed.len(),
            deleted: report.deleted.len(),
            failed: report.errors.len(),
            cancelled: report.cancelled,
        });
        self.events.emit(SyncEvent::StatusChanged {
            status: SyncStatus::Idle,
            error,
        });

        info!(
            "Sync pass finished: {} completed, {} deleted, {} failed",
            report.completed.len(),
            report.deleted.len(),
            report.errors.len()
        );
        Ok(report)
    }
}
