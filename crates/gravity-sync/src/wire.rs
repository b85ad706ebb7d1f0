//! Wire types shared between the outbox, the sync manager, and the
//! remote endpoint.
//!
//! Field names follow the backend contract: operations are pushed to
//! `POST /notes/sync` and CRDT updates are pulled with per-note cursors.
//! `PendingOperation` is also the persisted outbox entry, so its JSON
//! shape doubles as the durable queue format.

use crate::ids::NoteId;
use serde::{Deserialize, Serialize};

/// Client operation kinds accepted by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Upsert,
    Delete,
}

/// A queued local mutation awaiting remote acknowledgment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOperation {
    pub operation_id: String,
    pub note_id: NoteId,
    pub operation: Operation,
    pub payload: serde_json::Value,
    /// Monotonically increasing per note; lets the backend discard an
    /// operation superseded by a later one still in flight.
    pub client_edit_seq: i64,
    pub client_device: String,
    pub client_time_s: i64,
    pub created_at_s: i64,
    pub updated_at_s: i64,
}

/// Payload of an upsert operation: the projected text plus the CRDT
/// delta and snapshot that back it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertPayload {
    pub markdown_text: String,
    pub crdt_update_b64: String,
    pub crdt_snapshot_b64: String,
    pub snapshot_update_id: i64,
}

/// Backend acknowledgment for one pushed operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationAck {
    pub note_id: NoteId,
    pub accepted: bool,
    pub version: i64,
    pub updated_at_s: i64,
    pub last_writer_edit_seq: i64,
    pub is_deleted: bool,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Per-note pull position: fetch fragments strictly newer than this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateCursor {
    pub note_id: NoteId,
    pub last_update_id: i64,
}

/// One remote update fragment, tagged with its backend-assigned id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub note_id: NoteId,
    pub update_id: i64,
    pub update_b64: String,
}

/// A stored remote snapshot, used for first hydration of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub note_id: NoteId,
    pub snapshot_b64: String,
    pub snapshot_update_id: i64,
}
