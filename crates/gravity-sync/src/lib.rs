//! gravity-sync: offline-first note synchronization using Loro CRDTs.
//!
//! This crate provides the core functionality for:
//! - Managing Loro documents for markdown notes
//! - Two-tier persistence of snapshots, watermarks, and the outbox
//! - Flush/pull orchestration against a remote sync endpoint
//! - StorageBackend and SyncTransport trait abstractions

pub mod document;
pub mod encoding;
pub mod engine;
pub mod events;
pub mod ids;
pub mod manager;
pub mod metadata;
pub mod outbox;
pub mod snapshots;
pub mod storage;
pub mod transport;
pub mod wire;

pub use document::{NoteDocument, NoteRecord};
pub use encoding::DecodeError;
pub use engine::NoteEngine;
pub use events::{EventBus, Subscription, SyncEvent};
pub use ids::{IdError, NoteId, UserId};
pub use manager::{RetryConfig, SyncError, SyncManager, SyncStatus};
pub use metadata::{MetadataStore, Watermark};
pub use outbox::SyncQueue;
pub use snapshots::SnapshotStore;
pub use storage::{StorageBackend, StorageError, StorageMode, StringStore};
pub use transport::{Credentials, SessionProvider, SyncTransport, TransportError};
pub use wire::{Operation, OperationAck, PendingOperation, UpdateCursor, UpdateRecord};
