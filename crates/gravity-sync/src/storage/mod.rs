//! Two-tier storage abstraction.
//!
//! The primary tier is an asynchronous, durable key-value backend (a
//! file-backed implementation lives in the client crate). The fallback
//! tier is a synchronous, string-keyed, size-limited store used when the
//! primary tier is unavailable, and as the home of legacy data that gets
//! migrated forward exactly once. Keys are namespaced strings with
//! urlencoded identifier segments so any backend can hold them.

pub mod memory;

use crate::events::{EventBus, SyncEvent};
use crate::ids::{NoteId, UserId};
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage tier unavailable: {0}")]
    Unavailable(String),

    #[error("storage read failed: {0}")]
    ReadFailed(String),

    #[error("storage write failed: {0}")]
    WriteFailed(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Asynchronous durable key-value backend (primary tier).
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn put(&self, key: &str, value: &str) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Synchronous string-keyed store (fallback tier and outbox).
///
/// Kept synchronous on purpose: the outbox must be readable and writable
/// without suspension points, e.g. at teardown time.
pub trait StringStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// Which tier a store instance operates against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    Durable,
    Fallback,
}

/// Probe whether the primary tier actually works in this environment.
///
/// Performs a write/read/delete cycle under a reserved key; any failure
/// selects fallback mode.
pub async fn resolve_storage_mode(primary: &dyn StorageBackend) -> StorageMode {
    const PROBE_KEY: &str = "gravity.probe";
    let round_trip = async {
        primary.put(PROBE_KEY, "1").await?;
        let value = primary.get(PROBE_KEY).await?;
        primary.delete(PROBE_KEY).await?;
        Ok::<_, StorageError>(value)
    };
    match round_trip.await {
        Ok(Some(value)) if value == "1" => StorageMode::Durable,
        Ok(_) => StorageMode::Fallback,
        Err(e) => {
            warn!("primary storage probe failed, falling back: {}", e);
            StorageMode::Fallback
        }
    }
}

/// One-time forward migration of a legacy fallback-tier entry.
///
/// Reads `key` from the legacy backend; when present, copies it into the
/// primary backend and deletes the legacy copy. Both the copy and the
/// delete are best-effort: a failure is logged and the legacy value is
/// still returned, so migration trouble never blocks a read.
pub async fn migrate(
    legacy: &dyn StorageBackend,
    primary: &dyn StorageBackend,
    key: &str,
) -> Result<Option<String>> {
    let Some(value) = legacy.get(key).await? else {
        return Ok(None);
    };

    match primary.put(key, &value).await {
        Ok(()) => {
            if let Err(e) = legacy.delete(key).await {
                warn!("failed to delete migrated legacy entry {}: {}", key, e);
            } else {
                debug!("migrated legacy entry {} to primary tier", key);
            }
        }
        Err(e) => warn!("failed to migrate legacy entry {} forward: {}", key, e),
    }

    Ok(Some(value))
}

/// Serializes writes for one store instance and latches failure reporting.
///
/// Concurrent saves to the same store queue up on the internal mutex, so
/// partial writes cannot interleave. The first failed write in a row
/// emits `StorageDegraded` once; a later successful write re-arms the
/// notification.
pub struct WriteChain {
    lock: tokio::sync::Mutex<()>,
    degraded: AtomicBool,
    message_key: &'static str,
}

impl WriteChain {
    pub fn new(message_key: &'static str) -> Self {
        Self {
            lock: tokio::sync::Mutex::new(()),
            degraded: AtomicBool::new(false),
            message_key,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Run one write operation under the chain.
    pub async fn run<T, Fut>(&self, events: &EventBus, op: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let _guard = self.lock.lock().await;
        match op.await {
            Ok(value) => {
                self.degraded.store(false, Ordering::SeqCst);
                Ok(value)
            }
            Err(e) => {
                if !self.degraded.swap(true, Ordering::SeqCst) {
                    events.emit(SyncEvent::StorageDegraded {
                        message_key: self.message_key.to_string(),
                    });
                }
                Err(e)
            }
        }
    }
}

const SNAPSHOT_PREFIX: &str = "gravity.snapshot.";
const METADATA_PREFIX: &str = "gravity.meta.";
const OUTBOX_PREFIX: &str = "gravity.outbox.";

pub fn snapshot_key(user_id: &UserId, note_id: &NoteId) -> String {
    format!(
        "{}{}.{}",
        SNAPSHOT_PREFIX,
        urlencoding::encode(user_id.as_str()),
        urlencoding::encode(note_id.as_str())
    )
}

pub fn metadata_key(user_id: &UserId) -> String {
    format!("{}{}", METADATA_PREFIX, urlencoding::encode(user_id.as_str()))
}

pub fn outbox_key(user_id: &UserId) -> String {
    format!("{}{}", OUTBOX_PREFIX, urlencoding::encode(user_id.as_str()))
}
