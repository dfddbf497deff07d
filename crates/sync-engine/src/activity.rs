//! ActivityTracker: bounded, expiring view of what the engine is doing.
//!
//! Per-file states move `pending -> syncing -> completed | failed`. Pending
//! transfers are kept in insertion order up to a capacity (oldest evicted
//! first); finished ones go into a small ring of recent activity. A background
//! sweep evicts entries older than the configured age and stops itself once
//! there is nothing left to sweep.
//!
//! The tracker is owned by one engine. Cloning it shares the same state.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::debug;

use crate::action::ActionKind;
use crate::config::ActivityConfig;
use crate::descriptor::FileId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncStatus {
    Idle,
    Planning,
    Syncing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ActivityState {
    Pending,
    Syncing,
    Completed,
    Failed,
}

/// One file's transfer as shown to the user.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    pub file_id: FileId,
    pub path: String,
    pub action: ActionKind,
    pub state: ActivityState,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Milliseconds since the Unix epoch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
    /// Last state change, for expiry
    #[serde(skip)]
    touched: Instant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    pub bytes_transferred: u64,
    pub bytes_total: u64,
}

/// Immutable snapshot for display.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusDetail {
    pub status: SyncStatus,
    pub error: Option<String>,
    pub last_sync_at: Option<u64>,
    pub current: Option<Activity>,
    pub pending: Vec<Activity>,
    pub recent: Vec<Activity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overall_progress: Option<Progress>,
}

impl StatusDetail {
    pub fn failed(&self) -> impl Iterator<Item = &Activity> {
        self.recent
            .iter()
            .filter(|a| a.state == ActivityState::Failed)
    }
}

struct TrackerState {
    status: SyncStatus,
    error: Option<String>,
    last_sync_at: Option<u64>,
    pending: VecDeque<Activity>,
    /// Started but not finished; the newest is `current`
    in_flight: Vec<Activity>,
    recent: VecDeque<Activity>,
    progress: Progress,
    sweeping: bool,
}

impl TrackerState {
    fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty() && self.recent.is_empty()
    }

    fn sweep(&mut self, now: Instant, max_age: Duration) -> usize {
        let before = self.pending.len() + self.in_flight.len() + self.recent.len();
        let fresh = |a: &Activity| now.saturating_duration_since(a.touched) <= max_age;
        self.pending.retain(fresh);
        self.in_flight.retain(fresh);
        self.recent.retain(fresh);
        before - (self.pending.len() + self.in_flight.len() + self.recent.len())
    }
}

struct Inner {
    state: Mutex<TrackerState>,
    config: ActivityConfig,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Clone)]
pub struct ActivityTracker {
    inner: Arc<Inner>,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl ActivityTracker {
    pub fn new(config: ActivityConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(TrackerState {
                    status: SyncStatus::Idle,
                    error: None,
                    last_sync_at: None,
                    pending: VecDeque::new(),
                    in_flight: Vec::new(),
                    recent: VecDeque::new(),
                    progress: Progress::default(),
                    sweeping: false,
                }),
                config,
            }),
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.lock().status
    }

    pub fn set_status(&self, status: SyncStatus) {
        self.inner.lock().status = status;
    }

    /// Enter `syncing` with fresh progress counters.
    pub fn start_sync(&self, total: usize, bytes_total: u64) {
        {
            let mut state = self.inner.lock();
            state.status = SyncStatus::Syncing;
            state.error = None;
            state.progress = Progress {
                completed: 0,
                total,
                bytes_transferred: 0,
                bytes_total,
            };
        }
        self.ensure_sweeper();
    }

    /// Return to idle, recording the outcome of the pass.
    pub fn finish_sync(&self, error: Option<String>) {
        let mut state = self.inner.lock();
        state.status = SyncStatus::Idle;
        if error.is_none() {
            state.last_sync_at = Some(now_millis());
        }
        state.error = error;
        state.in_flight.clear();
    }

    pub fn add_pending(&self, file_id: FileId, path: &str, action: ActionKind, size: u64) {
        {
            let mut state = self.inner.lock();
            state.pending.retain(|a| a.file_id != file_id);
            state.pending.push_back(Activity {
                file_id,
                path: path.to_string(),
                action,
                state: ActivityState::Pending,
                size,
                error: None,
                completed_at: None,
                touched: Instant::now(),
            });
            while state.pending.len() > self.inner.config.pending_capacity {
                state.pending.pop_front();
            }
        }
        self.ensure_sweeper();
    }

    pub fn remove_pending(&self, file_id: &FileId) -> bool {
        let mut state = self.inner.lock();
        let before = state.pending.len();
        state.pending.retain(|a| a.file_id != *file_id);
        state.pending.len() != before
    }

    /// Mark a transfer as running. It becomes the current activity.
    pub fn start_activity(&self, file_id: FileId, path: &str, action: ActionKind, size: u64) {
        let mut state = self.inner.lock();
        state.pending.retain(|a| a.file_id != file_id);
        state.in_flight.push(Activity {
            file_id,
            path: path.to_string(),
            action,
            state: ActivityState::Syncing,
            size,
            error: None,
            completed_at: None,
            touched: Instant::now(),
        });
    }

    pub fn complete_activity(&self, file_id: &FileId, bytes: u64) {
        self.finish_activity(file_id, ActivityState::Completed, None, bytes);
    }

    pub fn fail_activity(&self, file_id: &FileId, error: &str) {
        self.finish_activity(file_id, ActivityState::Failed, Some(error.to_string()), 0);
    }

    fn finish_activity(&self, file_id: &FileId, outcome: ActivityState, error: Option<String>, bytes: u64) {
        {
            let mut state = self.inner.lock();
            let Some(pos) = state.in_flight.iter().position(|a| a.file_id == *file_id) else {
                debug!("No running activity for {}", file_id);
                return;
            };
            let mut activity = state.in_flight.remove(pos);
            activity.state = outcome;
            activity.error = error;
            activity.completed_at = Some(now_millis());
            activity.touched = Instant::now();

            state.progress.completed += 1;
            state.progress.bytes_transferred += bytes;

            state.recent.push_back(activity);
            while state.recent.len() > self.inner.config.recent_capacity {
                state.recent.pop_front();
            }
        }
        self.ensure_sweeper();
    }

    pub fn status_detail(&self) -> StatusDetail {
        let state = self.inner.lock();
        StatusDetail {
            status: state.status,
            error: state.error.clone(),
            last_sync_at: state.last_sync_at,
            current: state.in_flight.last().cloned(),
            pending: state.pending.iter().cloned().collect(),
            recent: state.recent.iter().rev().cloned().collect(),
            overall_progress: (state.status == SyncStatus::Syncing).then_some(state.progress),
        }
    }

    /// Evict entries older than the configured age as of `now`. Returns how
    /// many were evicted.
    pub fn sweep_expired_at(&self, now: Instant) -> usize {
        self.inner.lock().sweep(now, self.inner.config.max_age())
    }

    /// Whether the background sweep task is running.
    pub fn is_sweeping(&self) -> bool {
        self.inner.lock().sweeping
    }

    /// Start the periodic sweep unless it is already running. Outside a Tokio
    /// runtime there is nothing to spawn on and expiry only happens through
    /// `sweep_expired_at`.
    fn ensure_sweeper(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        {
            let mut state = self.inner.lock();
            if state.sweeping {
                return;
            }
            state.sweeping = true;
        }

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let interval = self.inner.config.sweep_interval();
        let max_age = self.inner.config.max_age();
        handle.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let mut state = inner.lock();
                let evicted = state.sweep(Instant::now(), max_age);
                if evicted > 0 {
                    debug!("Swept {} expired activity entries", evicted);
                }
                if state.is_empty() {
                    state.sweeping = false;
                    break;
                }
            }
        });
    }
}
