// Container scan strategy
// Lists every registered container on each tick and dispatches blobs
// modified after the container's last watermark. Used where the account has
// no analytics logs.

use crate::errors::{ListenerError, StorageError};
use crate::listener::{ensure_not_cancelled, BlobListenerStrategy, ExecutorRegistry, NotificationQueue};
use crate::models::{BlobIdentity, ContainerIdentity};
use crate::storage::BlobStore;
use crate::trigger::TriggerExecutor;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

pub struct ContainerScanStrategy {
    store: Arc<dyn BlobStore>,
    registry: ExecutorRegistry,
    notifications: NotificationQueue,
    watermarks: Mutex<HashMap<ContainerIdentity, DateTime<Utc>>>,
    scan_interval: Duration,
    first_tick_done: AtomicBool,
}

impl ContainerScanStrategy {
    pub fn new(store: Arc<dyn BlobStore>, scan_interval: Duration) -> Self {
        let registry = ExecutorRegistry::new(store.account().clone());
        Self {
            store,
            registry,
            notifications: NotificationQueue::new(),
            watermarks: Mutex::new(HashMap::new()),
            scan_interval,
            first_tick_done: AtomicBool::new(false),
        }
    }

    pub fn watermark(&self, container: &ContainerIdentity) -> Option<DateTime<Utc>> {
        self.watermarks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(container)
            .copied()
    }

    #[instrument(skip(self, cancel), fields(container = %container))]
    async fn scan_container(
        &self,
        container: &ContainerIdentity,
        cancel: &CancellationToken,
    ) -> Result<(), ListenerError> {
        let previous = self.watermark(container);

        let listed = match self.store.list_blobs(&container.name, None, false).await {
            Ok(listed) => listed,
            Err(StorageError::NotFound(_)) => {
                debug!("Container does not exist yet");
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };

        let observed = listed.iter().map(|blob| blob.last_modified).max();
        let new_watermark = match (previous, observed) {
            (Some(p), Some(o)) => Some(p.max(o)),
            (p, o) => p.or(o),
        };

        let fresh: Vec<BlobIdentity> = listed
            .into_iter()
            .filter(|blob| previous.map_or(true, |p| blob.last_modified > p))
            .map(|blob| blob.identity)
            .collect();
        debug!(count = fresh.len(), previous = ?previous, "Container scanned");

        for blob in &fresh {
            ensure_not_cancelled(cancel)?;
            self.registry.dispatch(blob, cancel).await?;
        }

        if let Some(watermark) = new_watermark {
            self.watermarks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(container.clone(), watermark);
        }
        Ok(())
    }
}

#[async_trait]
impl BlobListenerStrategy for ContainerScanStrategy {
    fn name(&self) -> &'static str {
        "container_scan"
    }

    fn register(
        &self,
        container: ContainerIdentity,
        executor: Arc<dyn TriggerExecutor>,
    ) -> Result<(), ListenerError> {
        self.registry.register(container, executor)
    }

    fn notify(&self, blob: BlobIdentity) {
        self.notifications.push(blob);
    }

    fn start(&self) {
        self.registry.mark_started();
    }

    fn polling_interval(&self) -> Duration {
        if self.first_tick_done.load(Ordering::SeqCst) {
            self.scan_interval
        } else {
            Duration::ZERO
        }
    }

    #[instrument(skip(self, cancel), fields(account = %self.store.account()))]
    async fn execute(&self, cancel: &CancellationToken) -> Result<(), ListenerError> {
        ensure_not_cancelled(cancel)?;

        let result = async {
            self.notifications.dispatch_all(&self.registry, cancel).await?;

            for container in self.registry.containers() {
                ensure_not_cancelled(cancel)?;
                self.scan_container(&container, cancel).await?;
            }
            Ok::<(), ListenerError>(())
        }
        .await;

        self.first_tick_done.store(true, Ordering::SeqCst);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::test_support::RecordingExecutor;
    use crate::models::AccountIdentity;
    use crate::storage::MemoryBlobStore;
    use chrono::TimeZone;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, minute, 0).unwrap()
    }

    fn setup() -> (MemoryBlobStore, ContainerScanStrategy, Arc<RecordingExecutor>) {
        let store = MemoryBlobStore::new(AccountIdentity::emulated("devstoreaccount1"));
        let strategy = ContainerScanStrategy::new(Arc::new(store.clone()), Duration::from_secs(2));
        let executor = Arc::new(RecordingExecutor::default());
        strategy
            .register(
                ContainerIdentity::new(store.account().clone(), "input"),
                executor.clone(),
            )
            .unwrap();
        strategy.start();
        (store, strategy, executor)
    }

    #[tokio::test]
    async fn test_first_tick_dispatches_everything() {
        let (store, strategy, executor) = setup();
        store.put_blob_at("input", "a.txt", b"a", at(1));
        store.put_blob_at("input", "b.txt", b"b", at(2));

        assert_eq!(strategy.polling_interval(), Duration::ZERO);
        strategy.execute(&CancellationToken::new()).await.unwrap();

        assert_eq!(executor.names(), vec!["a.txt", "b.txt"]);
        assert_eq!(strategy.polling_interval(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_only_newer_blobs_dispatched_after_watermark() {
        let (store, strategy, executor) = setup();
        let cancel = CancellationToken::new();
        store.put_blob_at("input", "a.txt", b"a", at(1));
        strategy.execute(&cancel).await.unwrap();

        store.put_blob_at("input", "b.txt", b"b", at(5));
        strategy.execute(&cancel).await.unwrap();
        strategy.execute(&cancel).await.unwrap();

        assert_eq!(executor.names(), vec!["a.txt", "b.txt"]);
        let container = ContainerIdentity::new(store.account().clone(), "input");
        assert_eq!(strategy.watermark(&container), Some(at(5)));
    }

    #[tokio::test]
    async fn test_missing_container_is_empty() {
        let (_store, strategy, executor) = setup();
        strategy.execute(&CancellationToken::new()).await.unwrap();
        assert_eq!(executor.count(), 0);
    }

    #[tokio::test]
    async fn test_transient_error_aborts_without_advancing_watermark() {
        let (store, strategy, executor) = setup();
        let cancel = CancellationToken::new();
        store.put_blob_at("input", "a.txt", b"a", at(1));
        store.inject_failure("input", StorageError::Throttled("503".to_string()));

        assert!(matches!(
            strategy.execute(&cancel).await,
            Err(ListenerError::Storage(StorageError::Throttled(_)))
        ));
        let container = ContainerIdentity::new(store.account().clone(), "input");
        assert_eq!(strategy.watermark(&container), None);

        store.clear_failure("input");
        strategy.execute(&cancel).await.unwrap();
        assert_eq!(executor.names(), vec!["a.txt"]);
    }

    #[tokio::test]
    async fn test_notifications_dispatched_before_scan() {
        let (store, strategy, executor) = setup();
        store.create_container("input");
        strategy.notify(BlobIdentity::new(store.account().clone(), "input", "hint.txt"));

        strategy.execute(&CancellationToken::new()).await.unwrap();
        assert_eq!(executor.names(), vec!["hint.txt"]);
    }

    #[tokio::test]
    async fn test_cancelled_tick_dispatches_nothing() {
        let (store, strategy, executor) = setup();
        store.put_blob_at("input", "a.txt", b"a", at(1));
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(matches!(
            strategy.execute(&cancel).await,
            Err(ListenerError::Cancelled)
        ));
        assert_eq!(executor.count(), 0);
    }

    #[tokio::test]
    async fn test_registration_after_start_fails() {
        let (store, strategy, _executor) = setup();
        let result = strategy.register(
            ContainerIdentity::new(store.account().clone(), "late"),
            Arc::new(RecordingExecutor::default()),
        );
        assert!(matches!(result, Err(ListenerError::RegistrationAfterStart(_))));
    }

    #[tokio::test]
    async fn test_cancel_during_scan_stops_before_next_blob() {
        let (store, strategy, executor) = setup();
        store.put_blob_at("input", "a.txt", b"a", at(1));
        store.put_blob_at("input", "b.txt", b"b", at(2));
        store.put_blob_at("input", "c.txt", b"c", at(3));
        let cancel = CancellationToken::new();
        *executor.cancel_on_first.lock().unwrap() = Some(cancel.clone());

        assert!(matches!(
            strategy.execute(&cancel).await,
            Err(ListenerError::Cancelled)
        ));
        assert_eq!(executor.count(), 1);
        let container = ContainerIdentity::new(store.account().clone(), "input");
        assert_eq!(strategy.watermark(&container), None);
    }
}
