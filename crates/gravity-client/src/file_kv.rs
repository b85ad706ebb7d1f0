//! File-backed key-value storage.
//!
//! One file per key under a data directory, with the key urlencoded into
//! the file name so arbitrary key strings stay filesystem-safe. Writes go
//! through a temp file and rename so a crash mid-write never leaves a
//! truncated value behind.

use async_trait::async_trait;
use gravity_sync::storage::{Result, StorageBackend, StorageError};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

pub struct FileKv {
    root: PathBuf,
}

impl FileKv {
    /// Open (creating if needed) a key-value directory.
    ///
    /// Fails fast when the directory cannot be created, so callers can
    /// fall back to a different tier before any sync work starts.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| StorageError::Unavailable(format!("{}: {}", root.display(), e)))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(urlencoding::encode(key).as_ref())
    }
}

#[async_trait]
impl StorageBackend for FileKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.path_for(key)).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::ReadFailed(e.to_string())),
        }
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key);
        // Append rather than with_extension: encoded keys may contain dots.
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, value)
            .await
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| StorageError::WriteFailed(e.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::WriteFailed(e.to_string())),
        }
    }
}
