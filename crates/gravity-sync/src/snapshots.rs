//! Persistent snapshot store, two-tiered.
//!
//! Holds the latest CRDT snapshot per `(user, note)` as base64 text.
//! Reads prefer the primary tier; a legacy fallback-tier entry found on
//! first read is migrated forward and returned. Writes go through a
//! per-store write chain that serializes them and reports degraded
//! persistence once per failure episode.

use crate::events::EventBus;
use crate::ids::{NoteId, UserId};
use crate::storage::{self, Result, StorageBackend, WriteChain};
use std::sync::Arc;
use tracing::debug;

pub struct SnapshotStore {
    primary: Arc<dyn StorageBackend>,
    /// Fallback tier, checked for legacy entries on primary-tier misses.
    legacy: Option<Arc<dyn StorageBackend>>,
    chain: WriteChain,
    events: Arc<EventBus>,
}

impl SnapshotStore {
    pub fn new(
        primary: Arc<dyn StorageBackend>,
        legacy: Option<Arc<dyn StorageBackend>>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            primary,
            legacy,
            chain: WriteChain::new("storage_full"),
            events,
        }
    }

    /// Load the stored snapshot text for a note, migrating a legacy
    /// fallback-tier entry forward when the primary tier has none.
    pub async fn load(&self, user_id: &UserId, note_id: &NoteId) -> Result<Option<String>> {
        let key = storage::snapshot_key(user_id, note_id);
        if let Some(value) = self.primary.get(&key).await? {
            return Ok(Some(value));
        }
        if let Some(legacy) = &self.legacy {
            if let Some(value) =
                storage::migrate(legacy.as_ref(), self.primary.as_ref(), &key).await?
            {
                debug!(note = %note_id, "snapshot served from migrated legacy entry");
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// Persist the latest snapshot text for a note.
    pub async fn save(&self, user_id: &UserId, note_id: &NoteId, snapshot_b64: &str) -> Result<()> {
        let key = storage::snapshot_key(user_id, note_id);
        self.chain
            .run(&self.events, self.primary.put(&key, snapshot_b64))
            .await
    }

    /// Remove a note's snapshot from both tiers.
    pub async fn delete(&self, user_id: &UserId, note_id: &NoteId) -> Result<()> {
        let key = storage::snapshot_key(user_id, note_id);
        if let Some(legacy) = &self.legacy {
            // Best-effort; a failed legacy delete only resurfaces via migration.
            let _ = legacy.delete(&key).await;
        }
        self.chain
            .run(&self.events, self.primary.delete(&key))
            .await
    }

    pub fn is_degraded(&self) -> bool {
        self.chain.is_degraded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SyncEvent;
    use crate::storage::memory::MemoryKv;
    use crate::storage::StorageError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn user() -> UserId {
        UserId::new("u1").unwrap()
    }

    fn note() -> NoteId {
        NoteId::new("n1").unwrap()
    }

    fn store_with(legacy: Option<Arc<dyn StorageBackend>>) -> (SnapshotStore, Arc<dyn StorageBackend>) {
        let primary: Arc<dyn StorageBackend> = Arc::new(MemoryKv::new());
        let store = SnapshotStore::new(Arc::clone(&primary), legacy, Arc::new(EventBus::new()));
        (store, primary)
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let (store, _) = store_with(None);
        store.save(&user(), &note(), "c25hcA==").await.unwrap();
        let loaded = store.load(&user(), &note()).await.unwrap();
        assert_eq!(loaded.as_deref(), Some("c25hcA=="));
    }

    #[tokio::test]
    async fn test_delete_removes_entry() {
        let (store, _) = store_with(None);
        store.save(&user(), &note(), "c25hcA==").await.unwrap();
        store.delete(&user(), &note()).await.unwrap();
        assert_eq!(store.load(&user(), &note()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_legacy_entry_migrates_then_empties() {
        let legacy: Arc<dyn StorageBackend> = Arc::new(MemoryKv::new());
        let key = storage::snapshot_key(&user(), &note());
        legacy.put(&key, "bGVnYWN5").await.unwrap();

        let (store, primary) = store_with(Some(Arc::clone(&legacy)));

        // First load returns the legacy value...
        let loaded = store.load(&user(), &note()).await.unwrap();
        assert_eq!(loaded.as_deref(), Some("bGVnYWN5"));

        // ...and it now lives in the primary tier only.
        assert_eq!(primary.get(&key).await.unwrap().as_deref(), Some("bGVnYWN5"));
        assert_eq!(legacy.get(&key).await.unwrap(), None);
    }

    struct FailingKv;

    #[async_trait]
    impl StorageBackend for FailingKv {
        async fn get(&self, _key: &str) -> crate::storage::Result<Option<String>> {
            Ok(None)
        }
        async fn put(&self, _key: &str, _value: &str) -> crate::storage::Result<()> {
            Err(StorageError::WriteFailed("no space".into()))
        }
        async fn delete(&self, _key: &str) -> crate::storage::Result<()> {
            Err(StorageError::WriteFailed("no space".into()))
        }
    }

    #[tokio::test]
    async fn test_degraded_notification_fires_once() {
        let events = Arc::new(EventBus::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let _sub = events.subscribe(move |event| {
            if matches!(event, SyncEvent::StorageDegraded { .. }) {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }
        });

        let store = SnapshotStore::new(Arc::new(FailingKv), None, events);
        assert!(store.save(&user(), &note(), "eA==").await.is_err());
        assert!(store.save(&user(), &note(), "eA==").await.is_err());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(store.is_degraded());
    }
}
