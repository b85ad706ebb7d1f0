//! Seams to the remote endpoint and the auth collaborator.
//!
//! `SyncTransport` is the HTTP contract the manager flushes to and pulls
//! from (a reqwest implementation lives in the client crate).
//! `SessionProvider` supplies the active user and bearer credential; a
//! missing credential is a pause condition, never an error.

use crate::ids::UserId;
use crate::wire::{OperationAck, PendingOperation, SnapshotRecord, UpdateCursor, UpdateRecord};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("sync transport failed: {0}")]
    Failed(String),

    #[error("unauthorized")]
    Unauthorized,
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Remote sync endpoint, consumed over HTTP.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Push a batch of pending operations; the response acknowledges each
    /// one per note.
    async fn push_operations(
        &self,
        bearer: &str,
        operations: &[PendingOperation],
    ) -> Result<Vec<OperationAck>>;

    /// Fetch update fragments strictly newer than each cursor, ordered by
    /// ascending backend-assigned update id.
    async fn pull_updates(
        &self,
        bearer: &str,
        cursors: &[UpdateCursor],
    ) -> Result<Vec<UpdateRecord>>;

    /// Fetch stored snapshots for first hydration of a session.
    async fn list_snapshots(&self, bearer: &str) -> Result<Vec<SnapshotRecord>>;
}

/// Active session credentials.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user_id: UserId,
    pub bearer: String,
}

/// Auth/session collaborator: yields `None` while signed out or while the
/// credential is expired, which pauses sync activity.
pub trait SessionProvider: Send + Sync {
    fn credentials(&self) -> Option<Credentials>;
}
