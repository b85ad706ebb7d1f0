//! gravity-client: headless sync agent for gravity notes.
//!
//! Keeps a local device in sync with the gravity backend: flushes any
//! queued edits, pulls remote fragments on an interval, and mirrors note
//! state into file-backed storage under the data directory.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gravity_client::{FileKv, HttpTransport, ServiceConfig, StaticSession, SyncService};
use gravity_sync::events::{EventBus, SyncEvent};
use gravity_sync::ids::UserId;
use gravity_sync::metadata::MetadataStore;
use gravity_sync::outbox::SyncQueue;
use gravity_sync::snapshots::SnapshotStore;
use gravity_sync::storage::memory::QuotaStringStore;
use gravity_sync::storage::{self, StorageBackend, StorageMode, StringStore};
use gravity_sync::{RetryConfig, SyncManager};

#[derive(Parser, Debug)]
#[command(name = "gravity-client")]
#[command(about = "Gravity note sync agent")]
struct Args {
    /// Directory for local sync state
    #[arg(short, long)]
    data_dir: PathBuf,

    /// Base URL of the gravity backend
    #[arg(short, long)]
    server: String,

    /// Bearer token for the backend
    #[arg(short, long, env = "GRAVITY_TOKEN")]
    token: String,

    /// User account the token belongs to
    #[arg(short, long)]
    user: String,

    /// Device ID (generated if not provided)
    #[arg(long)]
    device_id: Option<String>,

    /// Seconds between sync cycles
    #[arg(long, default_value_t = 30)]
    interval: u64,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,gravity_client=debug"
    } else {
        "info,gravity_client=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting gravity-client");
    info!("Data directory: {:?}", args.data_dir);
    info!("Server: {}", args.server);

    let device_id = args.device_id.unwrap_or_else(|| {
        let id = uuid::Uuid::new_v4().to_string();
        info!("Generated device ID: {}", id);
        id
    });

    let user_id = UserId::new(&args.user)?;

    // Probe the durable tier; fall back to in-memory string storage when
    // the data directory is unusable.
    let events = Arc::new(EventBus::new());
    let fallback: Arc<dyn StringStore> = Arc::new(QuotaStringStore::new());
    let primary: Arc<dyn StorageBackend> = match FileKv::open(&args.data_dir) {
        Ok(kv) => {
            let kv: Arc<dyn StorageBackend> = Arc::new(kv);
            match storage::resolve_storage_mode(kv.as_ref()).await {
                StorageMode::Durable => kv,
                StorageMode::Fallback => Arc::new(
                    gravity_sync::storage::memory::FallbackBackend::new(Arc::clone(&fallback)),
                ),
            }
        }
        Err(e) => {
            tracing::warn!("data directory unusable, running without durability: {}", e);
            Arc::new(gravity_sync::storage::memory::FallbackBackend::new(
                Arc::clone(&fallback),
            ))
        }
    };

    let snapshots = Arc::new(SnapshotStore::new(
        Arc::clone(&primary),
        None,
        Arc::clone(&events),
    ));
    let metadata = Arc::new(MetadataStore::new(primary, None, Arc::clone(&events)));
    let queue = Arc::new(SyncQueue::new(fallback));
    let session = Arc::new(StaticSession::new(user_id, args.token));
    let transport = Arc::new(HttpTransport::new(args.server));

    let manager = Arc::new(SyncManager::new(
        snapshots,
        metadata,
        queue,
        transport,
        session,
        Arc::clone(&events),
        device_id,
        RetryConfig::default(),
    ));

    let _sub = events.subscribe(|event| match event {
        SyncEvent::NoteChanged { note_id } => info!("note changed: {}", note_id),
        SyncEvent::StorageDegraded { message_key } => {
            tracing::warn!("local persistence degraded: {}", message_key)
        }
        SyncEvent::QueueFlushed { accepted } => info!("flushed {} operation(s)", accepted),
    });

    manager.sign_in().await?;
    info!("Signed in; syncing every {}s. Press Ctrl+C to stop.", args.interval);

    let service = SyncService::new(
        Arc::clone(&manager),
        ServiceConfig {
            sync_interval: Duration::from_secs(args.interval),
        },
    );
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let worker = tokio::spawn(async move { service.run(shutdown_rx).await });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);
    worker.await?;

    manager.sign_out().await;
    info!("Shutting down");
    Ok(())
}
