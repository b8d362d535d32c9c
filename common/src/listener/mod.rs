// Blob change detection
// Strategies poll one account for written blobs and hand every candidate to
// the executors registered for its container.

pub mod analytics_log;
pub mod container_scan;
pub mod log_scan;
pub mod shared;

use crate::errors::{ListenerError, TriggerError};
use crate::models::{AccountIdentity, BlobIdentity, ContainerIdentity};
use crate::trigger::TriggerExecutor;
use async_trait::async_trait;
use metrics::{counter, gauge};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use container_scan::ContainerScanStrategy;
pub use log_scan::LogScanStrategy;
pub use shared::{BlobListener, SharedBlobListener, SharedListenerRegistry};

/// A change detection strategy driven by the shared listener's timer
#[async_trait]
pub trait BlobListenerStrategy: Send + Sync {
    /// Short name used in logs and metrics
    fn name(&self) -> &'static str;

    /// Add an executor for writes in `container`; only valid before start
    fn register(
        &self,
        container: ContainerIdentity,
        executor: Arc<dyn TriggerExecutor>,
    ) -> Result<(), ListenerError>;

    /// Queue a blob known to have been written
    fn notify(&self, blob: BlobIdentity);

    /// One-time setup that must succeed before the strategy starts
    async fn prepare(&self) -> Result<(), ListenerError> {
        Ok(())
    }

    /// Close registration
    fn start(&self);

    /// Delay before the next tick
    fn polling_interval(&self) -> Duration;

    /// Run one polling tick
    async fn execute(&self, cancel: &CancellationToken) -> Result<(), ListenerError>;

    /// Wait for background work spawned by ticks; called after the timer stops
    async fn shutdown(&self) {}
}

/// Container → executors map, frozen once the strategy starts
pub(crate) struct ExecutorRegistry {
    account: AccountIdentity,
    started: AtomicBool,
    executors: RwLock<HashMap<ContainerIdentity, Vec<Arc<dyn TriggerExecutor>>>>,
}

impl ExecutorRegistry {
    pub(crate) fn new(account: AccountIdentity) -> Self {
        Self {
            account,
            started: AtomicBool::new(false),
            executors: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn register(
        &self,
        container: ContainerIdentity,
        executor: Arc<dyn TriggerExecutor>,
    ) -> Result<(), ListenerError> {
        if self.started.load(Ordering::SeqCst) {
            return Err(ListenerError::RegistrationAfterStart(container.to_string()));
        }
        if container.account != self.account {
            return Err(ListenerError::AccountMismatch {
                container: container.name.clone(),
                expected: self.account.name().to_string(),
                actual: container.account.name().to_string(),
            });
        }

        self.executors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(container)
            .or_default()
            .push(executor);
        Ok(())
    }

    pub(crate) fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    pub(crate) fn containers(&self) -> Vec<ContainerIdentity> {
        self.executors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub(crate) fn executors(&self, container: &ContainerIdentity) -> Vec<Arc<dyn TriggerExecutor>> {
        self.executors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(container)
            .cloned()
            .unwrap_or_default()
    }

    /// Hand `blob` to every executor of its container, once each
    ///
    /// Storage errors abort; other executor failures are logged and the
    /// remaining executors still run.
    pub(crate) async fn dispatch(
        &self,
        blob: &BlobIdentity,
        cancel: &CancellationToken,
    ) -> Result<(), ListenerError> {
        let executors = self.executors(&blob.container);
        if executors.is_empty() {
            return Ok(());
        }

        counter!("blob_candidates_total", "account" => self.account.name().to_string())
            .increment(1);

        for executor in executors {
            ensure_not_cancelled(cancel)?;
            match executor.execute(blob).await {
                Ok(invoked) => debug!(blob = %blob, invoked, "Candidate evaluated"),
                Err(TriggerError::Storage(e)) => return Err(ListenerError::Storage(e)),
                Err(e) => warn!(blob = %blob, error = %e, "Trigger execution failed"),
            }
        }
        Ok(())
    }
}

struct QueueInner {
    sender: mpsc::UnboundedSender<BlobIdentity>,
    receiver: Mutex<mpsc::UnboundedReceiver<BlobIdentity>>,
    depth: AtomicUsize,
}

/// Unbounded queue of candidate blobs feeding the tick's drain loop
#[derive(Clone)]
pub(crate) struct NotificationQueue {
    inner: Arc<QueueInner>,
}

impl NotificationQueue {
    pub(crate) fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(QueueInner {
                sender,
                receiver: Mutex::new(receiver),
                depth: AtomicUsize::new(0),
            }),
        }
    }

    pub(crate) fn push(&self, blob: BlobIdentity) {
        // Counted before sending so a concurrent drain never takes more than
        // the depth holds
        let depth = self.inner.depth.fetch_add(1, Ordering::SeqCst) + 1;
        if self.inner.sender.send(blob).is_err() {
            self.inner.depth.fetch_sub(1, Ordering::SeqCst);
            return;
        }
        gauge!("blob_notification_queue_depth").set(depth as f64);
    }

    /// Take everything queued so far
    pub(crate) fn drain(&self) -> Vec<BlobIdentity> {
        let mut drained = Vec::new();
        {
            let mut receiver = self.inner.receiver.lock().unwrap_or_else(|e| e.into_inner());
            while let Ok(blob) = receiver.try_recv() {
                drained.push(blob);
            }
        }
        let depth = self
            .inner
            .depth
            .fetch_sub(drained.len(), Ordering::SeqCst)
            .saturating_sub(drained.len());
        gauge!("blob_notification_queue_depth").set(depth as f64);
        drained
    }

    /// Drain the queue and dispatch each blob
    ///
    /// On error the undispatched remainder, including the failing blob, goes
    /// back on the queue for the next tick.
    pub(crate) async fn dispatch_all(
        &self,
        registry: &ExecutorRegistry,
        cancel: &CancellationToken,
    ) -> Result<(), ListenerError> {
        let pending = self.drain();
        if !pending.is_empty() {
            debug!(count = pending.len(), "Dispatching queued notifications");
        }
        for (index, blob) in pending.iter().enumerate() {
            let result = match ensure_not_cancelled(cancel) {
                Ok(()) => registry.dispatch(blob, cancel).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                for remaining in &pending[index..] {
                    self.push(remaining.clone());
                }
                return Err(e);
            }
        }
        Ok(())
    }
}

pub(crate) fn ensure_not_cancelled(cancel: &CancellationToken) -> Result<(), ListenerError> {
    if cancel.is_cancelled() {
        Err(ListenerError::Cancelled)
    } else {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::errors::StorageError;

    /// Records every blob it is handed
    #[derive(Default)]
    pub(crate) struct RecordingExecutor {
        pub(crate) seen: Mutex<Vec<BlobIdentity>>,
        pub(crate) fail_with: Mutex<Option<StorageError>>,
        /// Cancelled after the first blob is recorded
        pub(crate) cancel_on_first: Mutex<Option<CancellationToken>>,
    }

    impl RecordingExecutor {
        pub(crate) fn names(&self) -> Vec<String> {
            let mut names: Vec<String> = self
                .seen
                .lock()
                .unwrap()
                .iter()
                .map(|b| b.name.clone())
                .collect();
            names.sort();
            names
        }

        pub(crate) fn count(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl TriggerExecutor for RecordingExecutor {
        async fn execute(&self, blob: &BlobIdentity) -> Result<bool, TriggerError> {
            if let Some(e) = self.fail_with.lock().unwrap().clone() {
                return Err(TriggerError::Storage(e));
            }
            self.seen.lock().unwrap().push(blob.clone());
            if let Some(cancel) = self.cancel_on_first.lock().unwrap().take() {
                cancel.cancel();
            }
            Ok(true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::RecordingExecutor;
    use super::*;

    fn account() -> AccountIdentity {
        AccountIdentity::new("prod")
    }

    #[test]
    fn test_registration_closed_after_start() {
        let registry = ExecutorRegistry::new(account());
        let container = ContainerIdentity::new(account(), "input");
        registry
            .register(container.clone(), Arc::new(RecordingExecutor::default()))
            .unwrap();

        registry.mark_started();
        assert!(matches!(
            registry.register(container, Arc::new(RecordingExecutor::default())),
            Err(ListenerError::RegistrationAfterStart(_))
        ));
    }

    #[test]
    fn test_registration_rejects_other_account() {
        let registry = ExecutorRegistry::new(account());
        let container = ContainerIdentity::new(AccountIdentity::new("staging"), "input");
        assert!(matches!(
            registry.register(container, Arc::new(RecordingExecutor::default())),
            Err(ListenerError::AccountMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_flyweight_containers_share_executors() {
        let registry = ExecutorRegistry::new(account());
        let first = Arc::new(RecordingExecutor::default());
        let second = Arc::new(RecordingExecutor::default());
        registry
            .register(ContainerIdentity::new(AccountIdentity::new("Prod"), "input"), first.clone())
            .unwrap();
        registry
            .register(ContainerIdentity::new(AccountIdentity::new("PROD"), "input"), second.clone())
            .unwrap();
        assert_eq!(registry.containers().len(), 1);

        let blob = BlobIdentity::new(account(), "input", "a.txt");
        registry.dispatch(&blob, &CancellationToken::new()).await.unwrap();
        assert_eq!(first.count(), 1);
        assert_eq!(second.count(), 1);
    }

    #[tokio::test]
    async fn test_queue_drains_each_event_once() {
        let queue = NotificationQueue::new();
        queue.push(BlobIdentity::new(account(), "input", "a"));
        queue.push(BlobIdentity::new(account(), "input", "b"));

        assert_eq!(queue.drain().len(), 2);
        assert!(queue.drain().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_stops_when_cancelled() {
        let registry = ExecutorRegistry::new(account());
        let executor = Arc::new(RecordingExecutor::default());
        registry
            .register(ContainerIdentity::new(account(), "input"), executor.clone())
            .unwrap();

        let queue = NotificationQueue::new();
        queue.push(BlobIdentity::new(account(), "input", "a"));
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(matches!(
            queue.dispatch_all(&registry, &cancel).await,
            Err(ListenerError::Cancelled)
        ));
        assert_eq!(executor.count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_mid_drain_requeues_remainder() {
        let registry = ExecutorRegistry::new(account());
        let executor = Arc::new(RecordingExecutor::default());
        let cancel = CancellationToken::new();
        *executor.cancel_on_first.lock().unwrap() = Some(cancel.clone());
        registry
            .register(ContainerIdentity::new(account(), "input"), executor.clone())
            .unwrap();

        let queue = NotificationQueue::new();
        for name in ["a", "b", "c"] {
            queue.push(BlobIdentity::new(account(), "input", name));
        }

        assert!(matches!(
            queue.dispatch_all(&registry, &cancel).await,
            Err(ListenerError::Cancelled)
        ));
        assert_eq!(executor.count(), 1);
        assert_eq!(queue.drain().len(), 2);
    }
}
