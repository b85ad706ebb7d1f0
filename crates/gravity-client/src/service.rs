//! Background sync loop.
//!
//! Flushes and pulls on an interval, shortening the wait to the manager's
//! backoff delay while a flush is retrying. Stops cleanly when the
//! shutdown channel flips.

use gravity_sync::SyncManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Time between sync cycles when nothing is retrying.
    pub sync_interval: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(30),
        }
    }
}

pub struct SyncService {
    manager: Arc<SyncManager>,
    config: ServiceConfig,
}

impl SyncService {
    pub fn new(manager: Arc<SyncManager>, config: ServiceConfig) -> Self {
        Self { manager, config }
    }

    /// Run sync cycles until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let wait = self
                .manager
                .retry_delay()
                .await
                .unwrap_or(self.config.sync_interval);
            debug!(wait_s = wait.as_secs(), "next sync cycle scheduled");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    if let Err(e) = self.manager.sync_now().await {
                        warn!("sync cycle failed: {}", e);
                    }
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gravity_sync::events::EventBus;
    use gravity_sync::ids::UserId;
    use gravity_sync::metadata::MetadataStore;
    use gravity_sync::outbox::SyncQueue;
    use gravity_sync::snapshots::SnapshotStore;
    use gravity_sync::storage::memory::{MemoryKv, QuotaStringStore};
    use gravity_sync::storage::{StorageBackend, StringStore};
    use gravity_sync::transport::{SyncTransport, TransportError};
    use gravity_sync::wire::{OperationAck, PendingOperation, SnapshotRecord, UpdateCursor, UpdateRecord};
    use gravity_sync::RetryConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTransport {
        pulls: AtomicUsize,
    }

    #[async_trait]
    impl SyncTransport for CountingTransport {
        async fn push_operations(
            &self,
            _bearer: &str,
            _operations: &[PendingOperation],
        ) -> Result<Vec<OperationAck>, TransportError> {
            Ok(Vec::new())
        }

        async fn pull_updates(
            &self,
            _bearer: &str,
            _cursors: &[UpdateCursor],
        ) -> Result<Vec<UpdateRecord>, TransportError> {
            self.pulls.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }

        async fn list_snapshots(
            &self,
            _bearer: &str,
        ) -> Result<Vec<SnapshotRecord>, TransportError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_cycles_and_stops_on_shutdown() {
        let events = Arc::new(EventBus::new());
        let primary: Arc<dyn StorageBackend> = Arc::new(MemoryKv::new());
        let transport = Arc::new(CountingTransport {
            pulls: AtomicUsize::new(0),
        });
        let manager = Arc::new(SyncManager::new(
            Arc::new(SnapshotStore::new(Arc::clone(&primary), None, Arc::clone(&events))),
            Arc::new(MetadataStore::new(primary, None, Arc::clone(&events))),
            Arc::new(SyncQueue::new(
                Arc::new(QuotaStringStore::new()) as Arc<dyn StringStore>
            )),
            Arc::clone(&transport) as Arc<dyn SyncTransport>,
            Arc::new(crate::session::StaticSession::new(
                UserId::new("u1").unwrap(),
                "token",
            )),
            events,
            "device-a",
            RetryConfig::default(),
        ));
        manager.sign_in().await.unwrap();
        let pulls_after_signin = transport.pulls.load(Ordering::SeqCst);

        let service = SyncService::new(
            Arc::clone(&manager),
            ServiceConfig {
                sync_interval: Duration::from_secs(1),
            },
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { service.run(shutdown_rx).await });

        tokio::time::sleep(Duration::from_millis(3500)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        let cycles = transport.pulls.load(Ordering::SeqCst) - pulls_after_signin;
        assert_eq!(cycles, 3);
    }
}
