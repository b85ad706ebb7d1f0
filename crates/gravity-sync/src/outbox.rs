//! Durable outbox of pending local operations.
//!
//! One ordered JSON list per user in synchronous string-keyed storage, so
//! the queue stays readable without suspension points (e.g. right before
//! teardown). An empty queue deletes the key outright: key presence is
//! the fast-path signal that work is pending. No compaction happens here
//! — each mutation is an independent entry in enqueue order, and
//! coalescing per note is the flush path's job.

use crate::ids::UserId;
use crate::storage::{self, Result, StringStore};
use crate::wire::PendingOperation;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

pub struct SyncQueue {
    store: Arc<dyn StringStore>,
}

impl SyncQueue {
    pub fn new(store: Arc<dyn StringStore>) -> Self {
        Self { store }
    }

    /// Load the pending operations for a user, oldest first.
    ///
    /// A corrupted queue is logged and treated as empty rather than
    /// wedging sync forever.
    pub fn load(&self, user_id: &UserId) -> Result<Vec<PendingOperation>> {
        let key = storage::outbox_key(user_id);
        let Some(raw) = self.store.get(&key)? else {
            return Ok(Vec::new());
        };
        match serde_json::from_str(&raw) {
            Ok(ops) => Ok(ops),
            Err(e) => {
                warn!(user = %user_id, "discarding unparseable outbox: {}", e);
                Ok(Vec::new())
            }
        }
    }

    /// Whether any operations are queued, without parsing them.
    pub fn has_pending(&self, user_id: &UserId) -> Result<bool> {
        Ok(self.store.get(&storage::outbox_key(user_id))?.is_some())
    }

    /// Persist the queue, dropping duplicate operation ids and deleting
    /// the key when the list is empty.
    pub fn save(&self, user_id: &UserId, operations: &[PendingOperation]) -> Result<()> {
        let key = storage::outbox_key(user_id);

        let mut seen = HashSet::new();
        let deduped: Vec<&PendingOperation> = operations
            .iter()
            .filter(|op| seen.insert(op.operation_id.clone()))
            .collect();

        if deduped.is_empty() {
            return self.store.remove(&key);
        }

        let encoded = serde_json::to_string(&deduped)
            .map_err(|e| storage::StorageError::WriteFailed(e.to_string()))?;
        self.store.set(&key, &encoded)
    }

    /// Drop the queue for a user.
    pub fn clear(&self, user_id: &UserId) -> Result<()> {
        self.store.remove(&storage::outbox_key(user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::NoteId;
    use crate::storage::memory::QuotaStringStore;
    use crate::wire::Operation;

    fn user() -> UserId {
        UserId::new("u1").unwrap()
    }

    fn op(id: &str, note: &str, seq: i64) -> PendingOperation {
        PendingOperation {
            operation_id: id.to_string(),
            note_id: NoteId::new(note).unwrap(),
            operation: Operation::Upsert,
            payload: serde_json::json!({}),
            client_edit_seq: seq,
            client_device: "d1".into(),
            client_time_s: 100,
            created_at_s: 100,
            updated_at_s: 100,
        }
    }

    fn queue() -> (SyncQueue, Arc<QuotaStringStore>) {
        let store = Arc::new(QuotaStringStore::new());
        (SyncQueue::new(store.clone() as Arc<dyn StringStore>), store)
    }

    #[test]
    fn test_save_load_preserves_order() {
        let (queue, _) = queue();
        let ops = vec![op("a", "n1", 1), op("b", "n2", 1), op("c", "n1", 2)];
        queue.save(&user(), &ops).unwrap();

        let loaded = queue.load(&user()).unwrap();
        let ids: Vec<_> = loaded.iter().map(|o| o.operation_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_empty_queue_deletes_key() {
        let (queue, store) = queue();
        queue.save(&user(), &[op("a", "n1", 1)]).unwrap();
        assert!(queue.has_pending(&user()).unwrap());

        queue.save(&user(), &[]).unwrap();
        assert!(!queue.has_pending(&user()).unwrap());
        assert_eq!(store.get(&storage::outbox_key(&user())).unwrap(), None);
    }

    #[test]
    fn test_duplicate_operation_ids_dropped() {
        let (queue, _) = queue();
        let ops = vec![op("a", "n1", 1), op("a", "n1", 2), op("b", "n2", 1)];
        queue.save(&user(), &ops).unwrap();

        let loaded = queue.load(&user()).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].client_edit_seq, 1); // first occurrence wins
    }

    #[test]
    fn test_corrupt_queue_degrades_to_empty() {
        let (queue, store) = queue();
        store.set(&storage::outbox_key(&user()), "][not json").unwrap();
        assert!(queue.load(&user()).unwrap().is_empty());
    }

    #[test]
    fn test_clear() {
        let (queue, _) = queue();
        queue.save(&user(), &[op("a", "n1", 1)]).unwrap();
        queue.clear(&user()).unwrap();
        assert!(queue.load(&user()).unwrap().is_empty());
    }
}
