//! Outbound notifications from the sync subsystem.
//!
//! The UI layer registers callbacks on `EventBus` instead of listening to
//! DOM events: `NoteChanged` drives re-rendering of a projected record,
//! `StorageDegraded` carries a user-facing message key when local
//! persistence keeps failing, and `QueueFlushed` reports delivery batches
//! for status indicators.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Events emitted by the sync manager and the stores.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// A note's projected record changed because a remote fragment landed.
    NoteChanged {
        #[serde(rename = "noteId")]
        note_id: String,
    },
    /// Local persistence is degraded; carries a message key the UI can
    /// translate (e.g. "storage_full"). Fired once per degradation episode.
    StorageDegraded {
        #[serde(rename = "messageKey")]
        message_key: String,
    },
    /// A flush batch completed; `accepted` counts acknowledged operations.
    QueueFlushed { accepted: usize },
}

/// Subscription handle that unsubscribes automatically when dropped.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

/// Callback registry for sync events. Wrap in `Arc` to subscribe.
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Arc<dyn Fn(SyncEvent) + Send + Sync>)>>,
    next_id: AtomicUsize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns a `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(SyncEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write avoids a deadlock if a Drop runs while emit holds the
        // read lock during panic unwinding.
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: SyncEvent) {
        // Clone the callback list so a callback may subscribe without deadlock.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_subscribe_and_emit() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        let _sub = bus.subscribe(move |_event| {
            count_clone.fetch_add(1, Ordering::Relaxed);
        });

        bus.emit(SyncEvent::NoteChanged { note_id: "n1".into() });
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_subscription_unsubscribes_on_drop() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        {
            let _sub = bus.subscribe(move |_event| {
                count_clone.fetch_add(1, Ordering::Relaxed);
            });
            bus.emit(SyncEvent::NoteChanged { note_id: "n1".into() });
        }

        bus.emit(SyncEvent::NoteChanged { note_id: "n2".into() });
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_event_serialization() {
        let event = SyncEvent::StorageDegraded {
            message_key: "storage_full".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"storageDegraded\""));
        assert!(json.contains("\"messageKey\":\"storage_full\""));
    }
}
