//! Per-user sync metadata: remote update watermarks.
//!
//! Persists one JSON map per user, `noteId -> { lastSeenUpdateId }`, with
//! the same two-tier/migration/write-chain pattern as the snapshot store.
//! `hydrate` must run before `load`/`save` are meaningful in durable
//! mode. Reads normalize aggressively: a missing, non-numeric, or
//! negative watermark coerces to 0 so metadata loss degrades to "resync
//! this note from the beginning" instead of a crash.

use crate::events::EventBus;
use crate::ids::{NoteId, UserId};
use crate::storage::{self, Result, StorageBackend, WriteChain};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::RwLock;
use std::sync::Arc;
use tracing::warn;

/// High-water mark of the newest remote fragment merged for a note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Watermark {
    #[serde(rename = "lastSeenUpdateId")]
    pub last_seen_update_id: i64,
}

pub type WatermarkMap = HashMap<NoteId, Watermark>;

pub struct MetadataStore {
    primary: Arc<dyn StorageBackend>,
    legacy: Option<Arc<dyn StorageBackend>>,
    chain: WriteChain,
    events: Arc<EventBus>,
    cache: RwLock<HashMap<UserId, WatermarkMap>>,
}

impl MetadataStore {
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
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Warm the in-memory cache for a user from persisted state,
    /// migrating a legacy entry forward when needed.
    pub async fn hydrate(&self, user_id: &UserId) -> Result<()> {
        let key = storage::metadata_key(user_id);
        let raw = match self.primary.get(&key).await? {
            Some(raw) => Some(raw),
            None => match &self.legacy {
                Some(legacy) => {
                    storage::migrate(legacy.as_ref(), self.primary.as_ref(), &key).await?
                }
                None => None,
            },
        };

        let map = raw.map(|raw| parse_watermarks(&raw)).unwrap_or_default();
        self.cache.write().await.insert(user_id.clone(), map);
        Ok(())
    }

    /// Current watermark map for a user (empty until hydrated or saved).
    pub async fn load(&self, user_id: &UserId) -> WatermarkMap {
        self.cache
            .read()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Replace and persist a user's watermark map.
    pub async fn save(&self, user_id: &UserId, map: WatermarkMap) -> Result<()> {
        let encoded = encode_watermarks(&map);
        self.cache.write().await.insert(user_id.clone(), map);

        let key = storage::metadata_key(user_id);
        self.chain
            .run(&self.events, self.primary.put(&key, &encoded))
            .await
    }

    /// Advance a note's watermark, never letting it decrease.
    ///
    /// Updates the cache immediately; call `persist` to write the map out
    /// once a batch of advances is done.
    pub async fn advance(&self, user_id: &UserId, note_id: &NoteId, update_id: i64) {
        let mut cache = self.cache.write().await;
        let map = cache.entry(user_id.clone()).or_default();
        let entry = map
            .entry(note_id.clone())
            .or_insert(Watermark { last_seen_update_id: 0 });
        if update_id > entry.last_seen_update_id {
            entry.last_seen_update_id = update_id;
        }
    }

    /// Drop a note's watermark, e.g. when the note is deleted. Without
    /// this the dead cursor would ride along in every future pull.
    pub async fn remove_note(&self, user_id: &UserId, note_id: &NoteId) -> Result<()> {
        {
            let mut cache = self.cache.write().await;
            if let Some(map) = cache.get_mut(user_id) {
                map.remove(note_id);
            }
        }
        self.persist(user_id).await
    }

    /// Persist the cached map for a user.
    pub async fn persist(&self, user_id: &UserId) -> Result<()> {
        let map = self.load(user_id).await;
        let encoded = encode_watermarks(&map);
        let key = storage::metadata_key(user_id);
        self.chain
            .run(&self.events, self.primary.put(&key, &encoded))
            .await
    }

    /// Drop a user's metadata from cache and both tiers.
    pub async fn clear(&self, user_id: &UserId) -> Result<()> {
        self.cache.write().await.remove(user_id);
        let key = storage::metadata_key(user_id);
        if let Some(legacy) = &self.legacy {
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

fn encode_watermarks(map: &WatermarkMap) -> String {
    let by_name: HashMap<&str, &Watermark> =
        map.iter().map(|(k, v)| (k.as_str(), v)).collect();
    serde_json::to_string(&by_name).unwrap_or_else(|_| "{}".to_string())
}

/// Parse a persisted watermark map, coercing anything suspect to 0.
fn parse_watermarks(raw: &str) -> WatermarkMap {
    let value: serde_json::Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            warn!("discarding unparseable sync metadata: {}", e);
            return WatermarkMap::new();
        }
    };

    let mut map = WatermarkMap::new();
    if let serde_json::Value::Object(entries) = value {
        for (name, entry) in entries {
            let Ok(note_id) = NoteId::new(&name) else {
                continue;
            };
            let last_seen = entry
                .get("lastSeenUpdateId")
                .map(coerce_update_id)
                .unwrap_or(0);
            map.insert(note_id, Watermark { last_seen_update_id: last_seen });
        }
    }
    map
}

fn coerce_update_id(value: &serde_json::Value) -> i64 {
    match value {
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.max(0)
            } else if let Some(f) = n.as_f64() {
                if f.is_finite() && f >= 0.0 { f as i64 } else { 0 }
            } else {
                0
            }
        }
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryKv;

    fn user() -> UserId {
        UserId::new("u1").unwrap()
    }

    fn note(id: &str) -> NoteId {
        NoteId::new(id).unwrap()
    }

    fn fresh_store() -> (MetadataStore, Arc<dyn StorageBackend>) {
        let primary: Arc<dyn StorageBackend> = Arc::new(MemoryKv::new());
        let store = MetadataStore::new(Arc::clone(&primary), None, Arc::new(EventBus::new()));
        (store, primary)
    }

    #[tokio::test]
    async fn test_save_hydrate_round_trip() {
        let (store, primary) = fresh_store();
        let mut map = WatermarkMap::new();
        map.insert(note("n1"), Watermark { last_seen_update_id: 7 });
        map.insert(note("n2"), Watermark { last_seen_update_id: 3 });
        store.save(&user(), map.clone()).await.unwrap();

        // A fresh store over the same backend sees the same values.
        let rehydrated = MetadataStore::new(Arc::clone(&primary), None, Arc::new(EventBus::new()));
        rehydrated.hydrate(&user()).await.unwrap();
        assert_eq!(rehydrated.load(&user()).await, map);
    }

    #[tokio::test]
    async fn test_unhydrated_load_is_empty() {
        let (store, _) = fresh_store();
        assert!(store.load(&user()).await.is_empty());
    }

    #[tokio::test]
    async fn test_normalization_coerces_bad_entries() {
        let (store, primary) = fresh_store();
        let key = storage::metadata_key(&user());
        let raw = r#"{
            "ok": {"lastSeenUpdateId": 9},
            "negative": {"lastSeenUpdateId": -4},
            "string": {"lastSeenUpdateId": "twelve"},
            "missing": {},
            "fractional": {"lastSeenUpdateId": 6.9}
        }"#;
        primary.put(&key, raw).await.unwrap();

        store.hydrate(&user()).await.unwrap();
        let map = store.load(&user()).await;
        assert_eq!(map[&note("ok")].last_seen_update_id, 9);
        assert_eq!(map[&note("negative")].last_seen_update_id, 0);
        assert_eq!(map[&note("string")].last_seen_update_id, 0);
        assert_eq!(map[&note("missing")].last_seen_update_id, 0);
        assert_eq!(map[&note("fractional")].last_seen_update_id, 6);
    }

    #[tokio::test]
    async fn test_corrupt_metadata_degrades_to_empty() {
        let (store, primary) = fresh_store();
        let key = storage::metadata_key(&user());
        primary.put(&key, "not json at all").await.unwrap();
        store.hydrate(&user()).await.unwrap();
        assert!(store.load(&user()).await.is_empty());
    }

    #[tokio::test]
    async fn test_advance_is_monotonic() {
        let (store, _) = fresh_store();
        store.advance(&user(), &note("n1"), 6).await;
        store.advance(&user(), &note("n1"), 4).await; // stale, ignored
        store.advance(&user(), &note("n1"), 7).await;

        let map = store.load(&user()).await;
        assert_eq!(map[&note("n1")].last_seen_update_id, 7);
    }

    #[tokio::test]
    async fn test_remove_note_drops_watermark_durably() {
        let (store, primary) = fresh_store();
        store.advance(&user(), &note("n1"), 4).await;
        store.advance(&user(), &note("n2"), 9).await;
        store.persist(&user()).await.unwrap();

        store.remove_note(&user(), &note("n1")).await.unwrap();
        assert!(!store.load(&user()).await.contains_key(&note("n1")));

        // The persisted map no longer carries the removed note either.
        let rehydrated = MetadataStore::new(Arc::clone(&primary), None, Arc::new(EventBus::new()));
        rehydrated.hydrate(&user()).await.unwrap();
        let map = rehydrated.load(&user()).await;
        assert!(!map.contains_key(&note("n1")));
        assert_eq!(map[&note("n2")].last_seen_update_id, 9);
    }

    #[tokio::test]
    async fn test_legacy_metadata_migrates_forward() {
        let legacy: Arc<dyn StorageBackend> = Arc::new(MemoryKv::new());
        let primary: Arc<dyn StorageBackend> = Arc::new(MemoryKv::new());
        let key = storage::metadata_key(&user());
        legacy
            .put(&key, r#"{"n1": {"lastSeenUpdateId": 5}}"#)
            .await
            .unwrap();

        let store = MetadataStore::new(
            Arc::clone(&primary),
            Some(Arc::clone(&legacy)),
            Arc::new(EventBus::new()),
        );
        store.hydrate(&user()).await.unwrap();

        assert_eq!(store.load(&user()).await[&note("n1")].last_seen_update_id, 5);
        assert!(primary.get(&key).await.unwrap().is_some());
        assert_eq!(legacy.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_clear_removes_user_state() {
        let (store, primary) = fresh_store();
        let mut map = WatermarkMap::new();
        map.insert(note("n1"), Watermark { last_seen_update_id: 2 });
        store.save(&user(), map).await.unwrap();

        store.clear(&user()).await.unwrap();
        assert!(store.load(&user()).await.is_empty());
        assert_eq!(primary.get(&storage::metadata_key(&user())).await.unwrap(), None);
    }
}
