// Shared listeners
// Every function triggered by the same storage account shares one listener,
// one strategy and one timer. Functions hold a lightweight `BlobListener`
// handle whose lifecycle calls are idempotent on the shared instance.

use crate::clock::Clock;
use crate::config::ListenerConfig;
use crate::errors::ListenerError;
use crate::listener::log_scan::LogScanOptions;
use crate::listener::{BlobListenerStrategy, ContainerScanStrategy, LogScanStrategy};
use crate::models::{AccountIdentity, BlobIdentity};
use crate::storage::{BlobStore, TimestampOracle};
use crate::timer::{AdaptiveTimer, CommandError, TimerCommand};
use crate::trigger::{Registration, TriggerGate};
use async_trait::async_trait;
use metrics::{counter, histogram};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Adapts a strategy tick to the timer
struct ListenerTickCommand {
    account: String,
    strategy: Arc<dyn BlobListenerStrategy>,
}

#[async_trait]
impl TimerCommand for ListenerTickCommand {
    fn separation_interval(&self) -> Duration {
        self.strategy.polling_interval()
    }

    async fn execute(&self, cancel: &CancellationToken) -> Result<(), CommandError> {
        let started = Instant::now();
        let result = self.strategy.execute(cancel).await;
        histogram!(
            "blob_listener_tick_duration_seconds",
            "strategy" => self.strategy.name()
        )
        .record(started.elapsed().as_secs_f64());

        match result {
            Ok(()) | Err(ListenerError::Cancelled) => Ok(()),
            Err(e) => {
                counter!(
                    "blob_listener_tick_failures_total",
                    "account" => self.account.clone(),
                    "strategy" => self.strategy.name()
                )
                .increment(1);
                Err(Box::new(e))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerState {
    Created,
    Started,
    Stopped,
    Disposed,
}

/// The listener shared by all functions of one account
pub struct SharedBlobListener {
    account: AccountIdentity,
    store: Arc<dyn BlobStore>,
    strategy: Arc<dyn BlobListenerStrategy>,
    timer: AdaptiveTimer,
    state: tokio::sync::Mutex<ListenerState>,
}

impl SharedBlobListener {
    /// Pick the strategy for the store's account: container scanning for
    /// the emulator, analytics logs otherwise
    pub fn new(
        store: Arc<dyn BlobStore>,
        config: &ListenerConfig,
        analytics_container: &str,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let strategy: Arc<dyn BlobListenerStrategy> = if store.account().is_emulated() {
            Arc::new(ContainerScanStrategy::new(Arc::clone(&store), config.scan_interval()))
        } else {
            Arc::new(LogScanStrategy::new(
                Arc::clone(&store),
                clock,
                LogScanOptions::from_config(config, analytics_container),
            ))
        };
        Self::with_strategy(store, strategy)
    }

    pub fn with_strategy(store: Arc<dyn BlobStore>, strategy: Arc<dyn BlobListenerStrategy>) -> Self {
        let account = store.account().clone();
        let command = Arc::new(ListenerTickCommand {
            account: account.name().to_string(),
            strategy: Arc::clone(&strategy),
        });
        let timer = AdaptiveTimer::new(format!("blob-listener-{}", account.name()), command);

        Self {
            account,
            store,
            strategy,
            timer,
            state: tokio::sync::Mutex::new(ListenerState::Created),
        }
    }

    pub fn account(&self) -> &AccountIdentity {
        &self.account
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn is_running(&self) -> bool {
        self.timer.is_running()
    }

    /// Register a function's trigger; only valid before the listener starts
    #[instrument(skip(self, registration), fields(account = %self.account, function = %registration.function))]
    pub async fn register(&self, registration: Registration) -> Result<(), ListenerError> {
        let state = self.state.lock().await;
        match *state {
            ListenerState::Created => {}
            ListenerState::Disposed => return Err(ListenerError::Disposed),
            ListenerState::Started | ListenerState::Stopped => {
                return Err(ListenerError::RegistrationAfterStart(
                    registration.container.to_string(),
                ))
            }
        }

        let container = registration.container.clone();
        let gate = TriggerGate::new(registration, TimestampOracle::new(Arc::clone(&self.store)));
        self.strategy.register(container, Arc::new(gate))?;
        debug!("Trigger registered");
        Ok(())
    }

    /// Queue a blob known to have been written to this account
    pub fn notify(&self, blob: BlobIdentity) {
        self.strategy.notify(blob);
    }

    #[instrument(skip(self), fields(account = %self.account))]
    pub async fn ensure_all_started(&self) -> Result<(), ListenerError> {
        let mut state = self.state.lock().await;
        match *state {
            ListenerState::Created => {
                self.strategy.prepare().await?;
                self.strategy.start();
                self.timer.start(false)?;
                *state = ListenerState::Started;
                info!(strategy = self.strategy.name(), "Shared blob listener started");
                Ok(())
            }
            ListenerState::Started | ListenerState::Stopped => Ok(()),
            ListenerState::Disposed => Err(ListenerError::Disposed),
        }
    }

    #[instrument(skip(self), fields(account = %self.account))]
    pub async fn ensure_all_stopped(&self) -> Result<(), ListenerError> {
        let mut state = self.state.lock().await;
        if *state == ListenerState::Started {
            self.timer.stop().await?;
            self.strategy.shutdown().await;
            *state = ListenerState::Stopped;
            info!("Shared blob listener stopped");
        }
        Ok(())
    }

    #[instrument(skip(self), fields(account = %self.account))]
    pub async fn ensure_all_disposed(&self) {
        let mut state = self.state.lock().await;
        if *state == ListenerState::Disposed {
            return;
        }
        let was_running = *state == ListenerState::Started;
        self.timer.dispose().await;
        if was_running {
            self.strategy.shutdown().await;
        }
        *state = ListenerState::Disposed;
        info!("Shared blob listener disposed");
    }
}

/// Per-function handle onto a shared listener
#[derive(Clone)]
pub struct BlobListener {
    function: String,
    shared: Arc<SharedBlobListener>,
}

impl BlobListener {
    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn shared(&self) -> &Arc<SharedBlobListener> {
        &self.shared
    }

    pub async fn start(&self) -> Result<(), ListenerError> {
        self.shared.ensure_all_started().await
    }

    pub async fn stop(&self) -> Result<(), ListenerError> {
        self.shared.ensure_all_stopped().await
    }

    pub async fn dispose(&self) {
        self.shared.ensure_all_disposed().await
    }
}

/// One shared listener per account
pub struct SharedListenerRegistry {
    config: ListenerConfig,
    analytics_container: String,
    clock: Arc<dyn Clock>,
    listeners: Mutex<HashMap<AccountIdentity, Arc<SharedBlobListener>>>,
}

impl SharedListenerRegistry {
    pub fn new(config: ListenerConfig, analytics_container: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            analytics_container: analytics_container.into(),
            clock,
            listeners: Mutex::new(HashMap::new()),
        }
    }

    fn all(&self) -> Vec<Arc<SharedBlobListener>> {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Listener for the store's account, created on first use
    pub fn get_or_create(&self, store: Arc<dyn BlobStore>) -> Arc<SharedBlobListener> {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        let listener = listeners.entry(store.account().clone()).or_insert_with(|| {
            Arc::new(SharedBlobListener::new(
                Arc::clone(&store),
                &self.config,
                &self.analytics_container,
                Arc::clone(&self.clock),
            ))
        });
        Arc::clone(listener)
    }

    pub fn get(&self, account: &AccountIdentity) -> Option<Arc<SharedBlobListener>> {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(account)
            .cloned()
    }

    /// Route a known write to its account's listener; false when no listener
    /// serves that account
    pub fn notify(&self, blob: BlobIdentity) -> bool {
        match self.get(blob.account()) {
            Some(listener) => {
                listener.notify(blob);
                true
            }
            None => {
                debug!(blob = %blob, "No listener for blob account");
                false
            }
        }
    }

    /// Register a function and return its handle
    pub async fn listen(
        &self,
        store: Arc<dyn BlobStore>,
        registration: Registration,
    ) -> Result<BlobListener, ListenerError> {
        let shared = self.get_or_create(store);
        let function = registration.function.clone();
        shared.register(registration).await?;
        Ok(BlobListener { function, shared })
    }

    pub async fn start_all(&self) -> Result<(), ListenerError> {
        for listener in self.all() {
            listener.ensure_all_started().await?;
        }
        Ok(())
    }

    pub async fn stop_all(&self) -> Result<(), ListenerError> {
        for listener in self.all() {
            listener.ensure_all_stopped().await?;
        }
        Ok(())
    }

    pub async fn dispose_all(&self) {
        for listener in self.all() {
            listener.ensure_all_disposed().await;
        }
    }
}
