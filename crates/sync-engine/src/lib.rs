//! sync-engine: client-side vault file synchronization.
//!
//! This crate provides:
//! - Vector clocks for per-file causality across devices
//! - A durable FileIndex mapping paths to file identities
//! - Collection of local file state and planning against a remote listing
//! - Execution of upload/download/delete/conflict actions over a
//!   content-addressed `RemoteStore`
//! - Bounded activity tracking for status display
//! - FileSystem and RemoteStore trait abstractions

pub mod action;
pub mod activity;
pub mod clock;
pub mod collector;
pub mod config;
pub mod descriptor;
pub mod device_id;
pub mod engine;
pub mod events;
pub mod executor;
pub mod fs;
pub mod hash;
pub mod index;
pub mod planner;
pub mod remote;
pub mod title;

/// Directory inside the vault holding all engine state.
pub const SYNC_DIR: &str = ".sync";

pub use action::{ActionError, ActionKind, ClockMerge, SyncAction, SyncActionDto, SyncPlan};
pub use activity::{Activity, ActivityState, ActivityTracker, StatusDetail, SyncStatus};
pub use clock::{ClockOrdering, VectorClock};
pub use collector::{Collection, CollectionError, LocalFileCollector};
pub use config::{ActivityConfig, ConfigError, SyncConfig};
pub use descriptor::{FileId, LocalFileDescriptor, RemoteFileDescriptor};
pub use device_id::{DeviceId, DeviceIdError};
pub use engine::{EngineError, SyncEngine};
pub use events::{EventBus, Subscription, SyncEvent};
pub use executor::{ActionExecutor, ActionFailure, CancelFlag, CompletedFile, SyncReport};
pub use fs::{FileEntry, FileStat, FileSystem, FsError, InMemoryFs};
pub use hash::ContentHash;
pub use index::{FileIndex, FileIndexEntry, IndexError};
pub use planner::{PlanError, SyncPlanner};
pub use remote::{InMemoryRemote, RemoteStore, TransferError};
