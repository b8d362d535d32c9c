// Analytics log strategy
// The first tick starts a one-off background listing of every registered
// container; every tick then tails the recent analytics logs.

use crate::clock::Clock;
use crate::config::ListenerConfig;
use crate::errors::{ListenerError, StorageError};
use crate::listener::analytics_log::BlobLogReader;
use crate::listener::{ensure_not_cancelled, BlobListenerStrategy, ExecutorRegistry, NotificationQueue};
use crate::models::{BlobIdentity, ContainerIdentity};
use crate::storage::BlobStore;
use crate::trigger::TriggerExecutor;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct LogScanOptions {
    pub poll_interval: Duration,
    pub previous_hours: u32,
    pub seen_log_limit: usize,
    pub retention_days: u32,
    pub analytics_container: String,
}

impl LogScanOptions {
    pub fn from_config(config: &ListenerConfig, analytics_container: impl Into<String>) -> Self {
        Self {
            poll_interval: config.log_poll_interval(),
            previous_hours: config.previous_hours,
            seen_log_limit: config.seen_log_limit,
            retention_days: config.log_retention_days,
            analytics_container: analytics_container.into(),
        }
    }
}

impl Default for LogScanOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            previous_hours: 2,
            seen_log_limit: 100_000,
            retention_days: 7,
            analytics_container: "$logs".to_string(),
        }
    }
}

pub struct LogScanStrategy {
    store: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
    options: LogScanOptions,
    registry: ExecutorRegistry,
    notifications: NotificationQueue,
    reader: OnceCell<BlobLogReader>,
    initial_scan_spawned: AtomicBool,
    initial_scan: Mutex<Option<JoinHandle<()>>>,
    first_tick_done: AtomicBool,
}

impl LogScanStrategy {
    pub fn new(store: Arc<dyn BlobStore>, clock: Arc<dyn Clock>, options: LogScanOptions) -> Self {
        let registry = ExecutorRegistry::new(store.account().clone());
        Self {
            store,
            clock,
            options,
            registry,
            notifications: NotificationQueue::new(),
            reader: OnceCell::new(),
            initial_scan_spawned: AtomicBool::new(false),
            initial_scan: Mutex::new(None),
            first_tick_done: AtomicBool::new(false),
        }
    }

    /// Wait for the first tick's background listing to finish
    pub async fn wait_for_initial_scan(&self) {
        let handle = self
            .initial_scan
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Initial container scan ended abnormally");
            }
        }
    }

    fn spawn_initial_scan(&self, cancel: &CancellationToken) {
        let store = Arc::clone(&self.store);
        let containers = self.registry.containers();
        let queue = self.notifications.clone();
        let cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut queued = 0usize;
            for container in containers {
                if cancel.is_cancelled() {
                    return;
                }
                match store.list_blobs(&container.name, None, false).await {
                    Ok(blobs) => {
                        for blob in blobs {
                            if cancel.is_cancelled() {
                                return;
                            }
                            queue.push(blob.identity);
                            queued += 1;
                        }
                    }
                    Err(StorageError::NotFound(_)) => {}
                    Err(e) => {
                        warn!(container = %container, error = %e, "Initial scan of container failed");
                    }
                }
            }
            info!(queued, "Initial container scan complete");
        });

        *self.initial_scan.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    async fn reader(&self) -> Result<&BlobLogReader, ListenerError> {
        let reader = self
            .reader
            .get_or_try_init(|| {
                BlobLogReader::create(
                    Arc::clone(&self.store),
                    self.options.analytics_container.clone(),
                    self.options.retention_days,
                    self.options.seen_log_limit,
                )
            })
            .await?;
        Ok(reader)
    }

    async fn tick(&self, cancel: &CancellationToken) -> Result<(), ListenerError> {
        self.notifications.dispatch_all(&self.registry, cancel).await?;

        ensure_not_cancelled(cancel)?;
        let reader = self.reader().await?;
        let writes = reader
            .recent_writes(self.clock.now(), self.options.previous_hours, cancel)
            .await?;

        // Log names are already marked seen, so writes go through the queue
        // and survive an aborted dispatch
        for blob in writes {
            self.notifications.push(blob);
        }
        self.notifications.dispatch_all(&self.registry, cancel).await
    }
}

#[async_trait]
impl BlobListenerStrategy for LogScanStrategy {
    fn name(&self) -> &'static str {
        "log_scan"
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

    /// Turns on write logging so bad credentials fail the start
    async fn prepare(&self) -> Result<(), ListenerError> {
        self.reader().await?;
        Ok(())
    }

    fn start(&self) {
        self.registry.mark_started();
    }

    fn polling_interval(&self) -> Duration {
        if self.first_tick_done.load(Ordering::SeqCst) {
            self.options.poll_interval
        } else {
            Duration::ZERO
        }
    }

    #[instrument(skip(self, cancel), fields(account = %self.store.account()))]
    async fn execute(&self, cancel: &CancellationToken) -> Result<(), ListenerError> {
        ensure_not_cancelled(cancel)?;

        if !self.initial_scan_spawned.swap(true, Ordering::SeqCst) {
            debug!("Starting initial container scan");
            self.spawn_initial_scan(cancel);
        }

        let result = self.tick(cancel).await;
        self.first_tick_done.store(true, Ordering::SeqCst);
        result
    }

    async fn shutdown(&self) {
        self.wait_for_initial_scan().await;
    }
}
