//! Sync orchestration: session lifecycle, flush, and pull.
//!
//! `SyncManager` owns one session at a time. Sign-in hydrates metadata,
//! rebuilds per-note edit sequences from the persisted outbox, replays
//! queued work, and only then pulls. All document mutation happens behind
//! a single async mutex; transport calls run with the lock released and
//! re-validate the session epoch before committing results, so a
//! sign-out racing an in-flight request can never write into the next
//! session's state.

use crate::document::NoteRecord;
use crate::encoding::{self, DecodeError};
use crate::engine::{EngineError, NoteEngine};
use crate::events::{EventBus, SyncEvent};
use crate::ids::{NoteId, UserId};
use crate::metadata::MetadataStore;
use crate::outbox::SyncQueue;
use crate::snapshots::SnapshotStore;
use crate::storage::StorageError;
use crate::transport::{SessionProvider, SyncTransport, TransportError};
use crate::wire::{Operation, PendingOperation, UpdateCursor, UpsertPayload};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no active session")]
    SignedOut,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Configuration for flush retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the first retry attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum number of attempts (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            max_attempts: None,
        }
    }
}

/// Calculates the next retry delay using exponential backoff.
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let delay_secs = config.initial_delay.as_secs_f64()
        * config.backoff_factor.powi(attempt.saturating_sub(1) as i32);

    Duration::from_secs_f64(delay_secs.min(config.max_delay.as_secs_f64()))
}

/// Externally observable sync state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStatus {
    Idle,
    Syncing,
    Retrying { attempt: u32 },
    /// Signed out or credential missing.
    Paused,
}

struct SessionState {
    user: UserId,
    /// Epoch this state was created under; stale in-flight work checks it.
    epoch: u64,
    engine: NoteEngine,
    /// Highest client edit sequence issued per note.
    edit_seqs: HashMap<NoteId, i64>,
    retry_attempts: u32,
}

pub struct SyncManager {
    snapshots: Arc<SnapshotStore>,
    metadata: Arc<MetadataStore>,
    queue: Arc<SyncQueue>,
    transport: Arc<dyn SyncTransport>,
    session: Arc<dyn SessionProvider>,
    events: Arc<EventBus>,
    device_id: String,
    retry: RetryConfig,
    state: tokio::sync::Mutex<Option<SessionState>>,
    /// Bumped on every session transition.
    epoch: AtomicU64,
    status: std::sync::Mutex<SyncStatus>,
    /// Latch for outbox write failures, mirroring `WriteChain`.
    queue_degraded: AtomicBool,
}

impl SyncManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        snapshots: Arc<SnapshotStore>,
        metadata: Arc<MetadataStore>,
        queue: Arc<SyncQueue>,
        transport: Arc<dyn SyncTransport>,
        session: Arc<dyn SessionProvider>,
        events: Arc<EventBus>,
        device_id: impl Into<String>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            snapshots,
            metadata,
            queue,
            transport,
            session,
            events,
            device_id: device_id.into(),
            retry,
            state: tokio::sync::Mutex::new(None),
            epoch: AtomicU64::new(0),
            status: std::sync::Mutex::new(SyncStatus::Paused),
            queue_degraded: AtomicBool::new(false),
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_status(&self, status: SyncStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    /// How long to wait before the next flush attempt, when retrying.
    pub async fn retry_delay(&self) -> Option<Duration> {
        let guard = self.state.lock().await;
        let state = guard.as_ref()?;
        if state.retry_attempts == 0 {
            return None;
        }
        if let Some(max) = self.retry.max_attempts {
            if state.retry_attempts >= max {
                return None;
            }
        }
        Some(calculate_backoff(state.retry_attempts, &self.retry))
    }

    /// Begin a session for the credential the session provider holds.
    ///
    /// Queued work from a previous run is flushed before the first pull
    /// so the backend merges local history before handing back remote
    /// fragments.
    pub async fn sign_in(&self) -> Result<()> {
        let creds = self.session.credentials().ok_or(SyncError::SignedOut)?;
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        info!(user = %creds.user_id, "starting sync session");

        if let Err(e) = self.metadata.hydrate(&creds.user_id).await {
            warn!("metadata hydration failed, watermarks reset: {}", e);
        }

        let mut edit_seqs: HashMap<NoteId, i64> = HashMap::new();
        for op in self.load_queue(&creds.user_id) {
            let seq = edit_seqs.entry(op.note_id.clone()).or_insert(0);
            *seq = (*seq).max(op.client_edit_seq);
        }

        *self.state.lock().await = Some(SessionState {
            user: creds.user_id,
            epoch,
            engine: NoteEngine::new(),
            edit_seqs,
            retry_attempts: 0,
        });
        self.set_status(SyncStatus::Idle);

        if let Err(e) = self.flush().await {
            warn!("initial flush failed: {}", e);
        }
        if let Err(e) = self.pull().await {
            warn!("initial pull failed: {}", e);
        }
        Ok(())
    }

    /// End the current session, invalidating in-flight work.
    ///
    /// In-memory documents are dropped; the persisted outbox, snapshots,
    /// and watermarks survive for the next sign-in.
    pub async fn sign_out(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.state.lock().await;
        if let Some(state) = guard.take() {
            if let Err(e) = self.metadata.persist(&state.user).await {
                warn!("failed to persist watermarks on sign-out: {}", e);
            }
            info!(user = %state.user, "sync session ended");
        }
        self.set_status(SyncStatus::Paused);
    }

    /// Open a note for display, rehydrating it from the snapshot store
    /// when it is not in memory.
    pub async fn open_note(&self, note_id: &NoteId) -> Result<Option<NoteRecord>> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or(SyncError::SignedOut)?;
        let user = state.user.clone();
        Self::hydrate_note(&self.snapshots, state, &user, note_id).await?;
        Ok(state.engine.note_record(note_id))
    }

    /// Record a local markdown edit: update the document, persist its
    /// snapshot, and enqueue an upsert for the next flush.
    pub async fn note_edited(&self, note_id: &NoteId, markdown: &str) -> Result<NoteRecord> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or(SyncError::SignedOut)?;
        let user = state.user.clone();
        Self::hydrate_note(&self.snapshots, state, &user, note_id).await?;

        let now = now_s();
        let Some(fragment) = state.engine.record_local_edit(note_id, markdown, now)? else {
            // Unchanged text: nothing to queue.
            return state
                .engine
                .note_record(note_id)
                .ok_or_else(|| EngineError::UnknownNote(note_id.clone()).into());
        };
        self.enqueue_upsert(state, &user, note_id, fragment, now).await
    }

    /// Set or clear a note's classification label; syncs like a body edit.
    pub async fn note_classified(
        &self,
        note_id: &NoteId,
        classification: Option<&str>,
    ) -> Result<NoteRecord> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or(SyncError::SignedOut)?;
        let user = state.user.clone();
        Self::hydrate_note(&self.snapshots, state, &user, note_id).await?;

        let now = now_s();
        let fragment = state.engine.set_classification(note_id, classification, now)?;
        self.enqueue_upsert(state, &user, note_id, fragment, now).await
    }

    /// Pin or unpin a note; syncs like a body edit.
    pub async fn note_pinned(&self, note_id: &NoteId, pinned: bool) -> Result<NoteRecord> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or(SyncError::SignedOut)?;
        let user = state.user.clone();
        Self::hydrate_note(&self.snapshots, state, &user, note_id).await?;

        let now = now_s();
        let fragment = state.engine.set_pinned(note_id, pinned, now)?;
        self.enqueue_upsert(state, &user, note_id, fragment, now).await
    }

    /// Persist the note's snapshot and append an upsert carrying the
    /// given fragment to the outbox.
    async fn enqueue_upsert(
        &self,
        state: &mut SessionState,
        user: &UserId,
        note_id: &NoteId,
        fragment: Vec<u8>,
        now: i64,
    ) -> Result<NoteRecord> {
        let snapshot = state.engine.snapshot(note_id)?;
        let snapshot_b64 = encoding::encode(&snapshot);
        if let Err(e) = self.snapshots.save(user, note_id, &snapshot_b64).await {
            warn!(note = %note_id, "snapshot persist failed, edit still queued: {}", e);
        }

        let snapshot_update_id = self
            .metadata
            .load(user)
            .await
            .get(note_id)
            .map(|w| w.last_seen_update_id)
            .unwrap_or(0);

        let seq = state.edit_seqs.entry(note_id.clone()).or_insert(0);
        *seq += 1;
        let seq = *seq;

        let record = state
            .engine
            .note_record(note_id)
            .ok_or_else(|| SyncError::Engine(EngineError::UnknownNote(note_id.clone())))?;
        let payload = UpsertPayload {
            markdown_text: record.markdown_text.clone(),
            crdt_update_b64: encoding::encode(&fragment),
            crdt_snapshot_b64: snapshot_b64,
            snapshot_update_id,
        };
        let op = PendingOperation {
            operation_id: uuid::Uuid::new_v4().to_string(),
            note_id: note_id.clone(),
            operation: Operation::Upsert,
            payload: serde_json::to_value(&payload)
                .map_err(|e| StorageError::WriteFailed(e.to_string()))?,
            client_edit_seq: seq,
            client_device: self.device_id.clone(),
            client_time_s: now,
            created_at_s: state.engine.created_at_s(note_id).unwrap_or(now),
            updated_at_s: now,
        };

        let mut pending = self.load_queue(user);
        pending.push(op);
        self.save_queue(user, &pending);
        Ok(record)
    }

    /// Record a local deletion and enqueue it for the next flush.
    pub async fn note_deleted(&self, note_id: &NoteId) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or(SyncError::SignedOut)?;
        let user = state.user.clone();

        let now = now_s();
        let created = state.engine.created_at_s(note_id).unwrap_or(now);
        let seq = state.edit_seqs.entry(note_id.clone()).or_insert(0);
        *seq += 1;
        let op = PendingOperation {
            operation_id: uuid::Uuid::new_v4().to_string(),
            note_id: note_id.clone(),
            operation: Operation::Delete,
            payload: serde_json::Value::Null,
            client_edit_seq: *seq,
            client_device: self.device_id.clone(),
            client_time_s: now,
            created_at_s: created,
            updated_at_s: now,
        };

        let mut pending = self.load_queue(&user);
        pending.push(op);
        self.save_queue(&user, &pending);

        state.engine.remove(note_id);
        if let Err(e) = self.snapshots.delete(&user, note_id).await {
            warn!(note = %note_id, "snapshot delete failed: {}", e);
        }
        if let Err(e) = self.metadata.remove_note(&user, note_id).await {
            warn!(note = %note_id, "watermark removal failed: {}", e);
        }
        Ok(())
    }

    /// Push the pending queue, coalesced per note, and prune what the
    /// backend acknowledges.
    ///
    /// Transport trouble does not surface as an error here: the queue is
    /// left intact and the manager moves to `Retrying`, reporting the
    /// next delay via `retry_delay`.
    pub async fn flush(&self) -> Result<usize> {
        let (user, bearer, epoch, batch) = {
            let guard = self.state.lock().await;
            let state = guard.as_ref().ok_or(SyncError::SignedOut)?;
            let Some(creds) = self.session.credentials() else {
                self.set_status(SyncStatus::Paused);
                return Ok(0);
            };
            let pending = self.load_queue(&state.user);
            if pending.is_empty() {
                return Ok(0);
            }
            (
                state.user.clone(),
                creds.bearer,
                state.epoch,
                coalesce(&pending),
            )
        };

        self.set_status(SyncStatus::Syncing);
        debug!(user = %user, batch = batch.len(), "pushing operations");
        let result = self.transport.push_operations(&bearer, &batch).await;

        let mut guard = self.state.lock().await;
        let Some(state) = guard.as_mut() else {
            return Ok(0);
        };
        if state.epoch != epoch {
            debug!("discarding flush result from a previous session");
            return Ok(0);
        }

        match result {
            Ok(acks) => {
                let mut remaining = self.load_queue(&user);
                let mut accepted = 0;
                for ack in &acks {
                    if ack.accepted {
                        accepted += 1;
                    }
                    // Anything at or below the acknowledged sequence is
                    // merged server-side, including superseded entries.
                    remaining.retain(|op| {
                        op.note_id != ack.note_id
                            || op.client_edit_seq > ack.last_writer_edit_seq
                    });
                    if !remaining.iter().any(|op| op.note_id == ack.note_id) {
                        state.engine.mark_synced(&ack.note_id);
                    }
                }
                self.save_queue(&user, &remaining);
                state.retry_attempts = 0;
                self.set_status(SyncStatus::Idle);
                self.events.emit(SyncEvent::QueueFlushed { accepted });
                Ok(accepted)
            }
            Err(e) => {
                state.retry_attempts += 1;
                let attempt = state.retry_attempts;
                warn!(attempt, "flush failed, queue kept: {}", e);
                self.set_status(SyncStatus::Retrying { attempt });
                Ok(0)
            }
        }
    }

    /// Pull remote fragments newer than the per-note watermarks and merge
    /// them in, advancing watermarks only past fragments that applied.
    ///
    /// A session with no watermarks and no open documents hydrates from
    /// stored snapshots first.
    pub async fn pull(&self) -> Result<usize> {
        let (user, bearer, epoch, cursors, needs_hydration) = {
            let guard = self.state.lock().await;
            let state = guard.as_ref().ok_or(SyncError::SignedOut)?;
            let Some(creds) = self.session.credentials() else {
                self.set_status(SyncStatus::Paused);
                return Ok(0);
            };
            let user = state.user.clone();
            let watermarks = self.metadata.load(&user).await;
            let mut cursors: Vec<UpdateCursor> = watermarks
                .iter()
                .map(|(note_id, w)| UpdateCursor {
                    note_id: note_id.clone(),
                    last_update_id: w.last_seen_update_id,
                })
                .collect();
            for note_id in state.engine.note_ids() {
                if !watermarks.contains_key(note_id) {
                    cursors.push(UpdateCursor {
                        note_id: note_id.clone(),
                        last_update_id: 0,
                    });
                }
            }
            let needs_hydration = cursors.is_empty();
            (user, creds.bearer, state.epoch, cursors, needs_hydration)
        };

        let mut applied = 0;

        if needs_hydration {
            match self.transport.list_snapshots(&bearer).await {
                Ok(records) => {
                    let mut guard = self.state.lock().await;
                    let Some(state) = guard.as_mut() else {
                        return Ok(0);
                    };
                    if state.epoch != epoch {
                        return Ok(0);
                    }
                    for record in records {
                        if state.engine.contains(&record.note_id) {
                            // Document is open with local history; deltas
                            // will reconcile it instead.
                            continue;
                        }

                        // A locally stored snapshot wins over the remote
                        // one: it may hold unpushed history the backend
                        // never saw. Its watermark stays unset so the
                        // delta pull below fetches every fragment.
                        let local = match self.snapshots.load(&user, &record.note_id).await {
                            Ok(local) => local,
                            Err(e) => {
                                warn!(note = %record.note_id, "local snapshot read failed: {}", e);
                                None
                            }
                        };
                        if let Some(text) = &local {
                            match encoding::decode(text).map_err(SyncError::from).and_then(
                                |bytes| {
                                    state
                                        .engine
                                        .apply_remote_snapshot(&record.note_id, &bytes)
                                        .map_err(SyncError::from)
                                },
                            ) {
                                Ok(()) => {
                                    self.events.emit(SyncEvent::NoteChanged {
                                        note_id: record.note_id.to_string(),
                                    });
                                    applied += 1;
                                    continue;
                                }
                                Err(e) => {
                                    warn!(note = %record.note_id,
                                        "unusable local snapshot, using remote: {}", e);
                                }
                            }
                        }

                        let bytes = match encoding::decode(&record.snapshot_b64) {
                            Ok(bytes) => bytes,
                            Err(e) => {
                                warn!(note = %record.note_id, "undecodable remote snapshot: {}", e);
                                continue;
                            }
                        };
                        match state.engine.apply_remote_snapshot(&record.note_id, &bytes) {
                            Ok(()) => {}
                            Err(e) => {
                                warn!(note = %record.note_id, "snapshot apply failed: {}", e);
                                continue;
                            }
                        }
                        if let Err(e) = self
                            .snapshots
                            .save(&user, &record.note_id, &record.snapshot_b64)
                            .await
                        {
                            warn!(note = %record.note_id, "snapshot persist failed: {}", e);
                        }
                        self.metadata
                            .advance(&user, &record.note_id, record.snapshot_update_id)
                            .await;
                        self.events.emit(SyncEvent::NoteChanged {
                            note_id: record.note_id.to_string(),
                        });
                        applied += 1;
                    }
                }
                Err(e) => warn!("snapshot listing failed: {}", e),
            }
        }

        let records = match self.transport.pull_updates(&bearer, &cursors).await {
            Ok(records) => records,
            Err(e) => {
                warn!("pull failed, watermarks unchanged: {}", e);
                // Hydration may already have advanced watermarks.
                if applied > 0 {
                    if let Err(e) = self.metadata.persist(&user).await {
                        warn!("failed to persist watermarks after hydration: {}", e);
                    }
                }
                return Ok(applied);
            }
        };

        let mut guard = self.state.lock().await;
        let Some(state) = guard.as_mut() else {
            return Ok(applied);
        };
        if state.epoch != epoch {
            debug!("discarding pull result from a previous session");
            return Ok(applied);
        }

        // Once a fragment fails for a note, later fragments for it are
        // skipped: applying them out of order would let the watermark jump
        // a gap.
        let mut failed: HashSet<NoteId> = HashSet::new();
        let mut changed: HashSet<NoteId> = HashSet::new();
        for record in records {
            if failed.contains(&record.note_id) {
                continue;
            }
            let result = encoding::decode(&record.update_b64)
                .map_err(SyncError::from)
                .and_then(|bytes| {
                    state
                        .engine
                        .apply_update(&record.note_id, &bytes)
                        .map_err(SyncError::from)
                });
            match result {
                Ok(()) => {
                    self.metadata
                        .advance(&user, &record.note_id, record.update_id)
                        .await;
                    changed.insert(record.note_id);
                    applied += 1;
                }
                Err(e) => {
                    warn!(note = %record.note_id, update_id = record.update_id,
                        "fragment apply failed, watermark held: {}", e);
                    failed.insert(record.note_id);
                }
            }
        }
        // Merged documents must reach the snapshot store before the
        // watermarks do: a watermark pointing past a snapshot that was
        // never written would suppress the re-pull that could repair it.
        for note_id in &changed {
            match state.engine.snapshot(note_id) {
                Ok(snapshot) => {
                    let snapshot_b64 = encoding::encode(&snapshot);
                    if let Err(e) = self.snapshots.save(&user, note_id, &snapshot_b64).await {
                        warn!(note = %note_id, "merged snapshot persist failed: {}", e);
                    }
                }
                Err(e) => warn!(note = %note_id, "merged snapshot export failed: {}", e),
            }
        }
        drop(guard);

        if let Err(e) = self.metadata.persist(&user).await {
            warn!("failed to persist watermarks after pull: {}", e);
        }
        for note_id in changed {
            self.events.emit(SyncEvent::NoteChanged {
                note_id: note_id.to_string(),
            });
        }
        Ok(applied)
    }

    /// One full sync cycle: flush then pull.
    pub async fn sync_now(&self) -> Result<()> {
        self.flush().await?;
        self.pull().await?;
        Ok(())
    }

    /// Read the outbox, degrading to empty on storage failure. Outbox
    /// trouble is surfaced through `StorageDegraded`, never as an error
    /// from an edit or sync call.
    fn load_queue(&self, user: &UserId) -> Vec<PendingOperation> {
        match self.queue.load(user) {
            Ok(pending) => pending,
            Err(e) => {
                warn!("outbox read failed, treating as empty: {}", e);
                Vec::new()
            }
        }
    }

    /// Write the outbox. A failure leaves the in-memory documents intact
    /// and fires `StorageDegraded` once per episode; a later successful
    /// write re-arms the notification.
    fn save_queue(&self, user: &UserId, pending: &[PendingOperation]) {
        match self.queue.save(user, pending) {
            Ok(()) => {
                self.queue_degraded.store(false, Ordering::SeqCst);
            }
            Err(e) => {
                warn!("outbox write failed: {}", e);
                if !self.queue_degraded.swap(true, Ordering::SeqCst) {
                    self.events.emit(SyncEvent::StorageDegraded {
                        message_key: "storage_full".to_string(),
                    });
                }
            }
        }
    }

    async fn hydrate_note(
        snapshots: &SnapshotStore,
        state: &mut SessionState,
        user: &UserId,
        note_id: &NoteId,
    ) -> Result<()> {
        if state.engine.contains(note_id) {
            return Ok(());
        }
        if let Some(text) = snapshots.load(user, note_id).await? {
            let bytes = encoding::decode(&text)?;
            state.engine.apply_remote_snapshot(note_id, &bytes)?;
        }
        Ok(())
    }
}

/// Collapse the queue to the newest operation per note, each kept at the
/// position of that note's first occurrence so inter-note order is stable.
fn coalesce(ops: &[PendingOperation]) -> Vec<PendingOperation> {
    let mut positions: HashMap<NoteId, usize> = HashMap::new();
    let mut out: Vec<PendingOperation> = Vec::new();
    for op in ops {
        match positions.get(&op.note_id) {
            Some(&i) => out[i] = op.clone(),
            None => {
                positions.insert(op.note_id.clone(), out.len());
                out.push(op.clone());
            }
        }
    }
    out
}

fn now_s() -> i64 {
    web_time::SystemTime::now()
        .duration_since(web_time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
