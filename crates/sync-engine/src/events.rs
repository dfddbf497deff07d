//! Progress events for a sync pass.
//!
//! The engine owns an `Arc<EventBus>` and emits a `SyncEvent` for each state
//! change and each finished action. Front ends subscribe to drive progress
//! displays or logs.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

use crate::action::ActionKind;
use crate::activity::SyncStatus;
use crate::descriptor::FileId;

/// Events emitted while a vault syncs.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// Engine moved to a new state.
    StatusChanged {
        status: SyncStatus,
        /// Error message when the engine went idle because of a failure.
        error: Option<String>,
    },
    /// One action finished successfully.
    ActionCompleted {
        action: ActionKind,
        #[serde(rename = "fileId")]
        file_id: FileId,
        path: String,
    },
    /// One action failed; the pass continues.
    ActionFailed {
        action: ActionKind,
        #[serde(rename = "fileId")]
        file_id: FileId,
        path: String,
        error: String,
    },
    /// A pass ran to the end (or was cancelled).
    PassFinished {
        completed: usize,
        deleted: usize,
        failed: usize,
        cancelled: bool,
    },
}

/// Keeps a listener attached to an `EventBus`; dropping it detaches the listener.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.detach(self.id);
        }
    }
}

type Listener = Arc<dyn Fn(SyncEvent) + Send + Sync>;

/// Fans `SyncEvent`s out to listeners, in the order they subscribed.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<(usize, Listener)>>,
    next_id: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        self: &Arc<Self>,
        listener: impl Fn(SyncEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        listeners.push((id, Arc::new(listener)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn detach(&self, id: usize) {
        // A listener panicking inside emit drops its Subscription with the read lock held
        if let Ok(mut listeners) = self.listeners.try_write() {
            listeners.retain(|(listener_id, _)| *listener_id != id);
        }
    }

    pub fn emit(&self, event: SyncEvent) {
        let listeners: Vec<Listener> = {
            let guard = self.listeners.read().unwrap_or_else(|e| e.into_inner());
            guard.iter().map(|(_, listener)| Arc::clone(listener)).collect()
        };
        // Lock released: listeners may subscribe or drop subscriptions
        for listener in listeners {
            listener(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished() -> SyncEvent {
        SyncEvent::PassFinished {
            completed: 1,
            deleted: 0,
            failed: 0,
            cancelled: false,
        }
    }

    #[test]
    fn test_listeners_see_events_in_subscription_order() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(RwLock::new(Vec::new()));

        let first = Arc::clone(&seen);
        let _a = bus.subscribe(move |_| first.write().unwrap().push("a"));
        let second = Arc::clone(&seen);
        let _b = bus.subscribe(move |_| second.write().unwrap().push("b"));

        bus.emit(finished());
        assert_eq!(*seen.read().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_dropping_subscription_detaches_listener() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);

        let subscription = bus.subscribe(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        bus.emit(finished());
        drop(subscription);
        bus.emit(finished());

        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_listener_may_subscribe_while_handling() {
        let bus = Arc::new(EventBus::new());
        let late = Arc::new(RwLock::new(Vec::new()));

        let inner_bus = Arc::clone(&bus);
        let keep = Arc::clone(&late);
        let _outer = bus.subscribe(move |_| {
            keep.write().unwrap().push(inner_bus.subscribe(|_| {}));
        });

        bus.emit(finished());
        assert_eq!(late.read().unwrap().len(), 1);
    }

    #[test]
    fn test_event_serialization() {
        let id = FileId::new();
        let event = SyncEvent::ActionFailed {
            action: ActionKind::Download,
            file_id: id,
            path: "a.md".into(),
            error: "boom".into(),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "actionFailed");
        assert_eq!(json["action"], "download");
        assert_eq!(json["fileId"], id.to_string());

        let status = SyncEvent::StatusChanged {
            status: SyncStatus::Syncing,
            error: None,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["type"], "statusChanged");
        assert_eq!(json["status"], "syncing");
    }
}
