//! In-memory storage backends.
//!
//! `MemoryKv` stands in for the durable tier in tests. `QuotaStringStore`
//! models the fallback tier: synchronous, string-keyed, and size-limited,
//! so quota exhaustion behaves like a real constrained environment.
//! `FallbackBackend` adapts any `StringStore` into the async
//! `StorageBackend` trait so migration and the stores can treat both
//! tiers uniformly.

use super::{Result, StorageBackend, StorageError, StringStore};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

/// Async key-value backend held entirely in memory.
#[derive(Default)]
pub struct MemoryKv {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
        Ok(())
    }
}

/// Synchronous string store with a byte quota.
pub struct QuotaStringStore {
    entries: Mutex<HashMap<String, String>>,
    quota_bytes: usize,
}

/// Default quota mirrors the ballpark of constrained string storage.
const DEFAULT_QUOTA_BYTES: usize = 5 * 1024 * 1024;

impl Default for QuotaStringStore {
    fn default() -> Self {
        Self::with_quota(DEFAULT_QUOTA_BYTES)
    }
}

impl QuotaStringStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            quota_bytes,
        }
    }

    fn used_bytes(entries: &HashMap<String, String>) -> usize {
        entries.iter().map(|(k, v)| k.len() + v.len()).sum()
    }
}

impl StringStore for QuotaStringStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let existing = entries.get(key).map(|v| key.len() + v.len()).unwrap_or(0);
        let projected = Self::used_bytes(&entries) - existing + key.len() + value.len();
        if projected > self.quota_bytes {
            return Err(StorageError::WriteFailed(format!(
                "quota exceeded: {} > {} bytes",
                projected, self.quota_bytes
            )));
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
        Ok(())
    }
}

/// Adapts a synchronous `StringStore` into the async `StorageBackend`
/// trait so the fallback tier plugs into the same store machinery.
pub struct FallbackBackend {
    inner: Arc<dyn StringStore>,
}

impl FallbackBackend {
    pub fn new(inner: Arc<dyn StringStore>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl StorageBackend for FallbackBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(key)
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.inner.set(key, value)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.remove(key)
    }
}
