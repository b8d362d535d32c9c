// Listener binary entry point
// Loads trigger definitions, watches the configured storage account and
// publishes an invocation for every blob write that should run a function.

use anyhow::Context;
use common::clock::{Clock, SystemClock};
use common::config::{Settings, StorageBackend, StorageConfig};
use common::host::HostHeartbeat;
use common::listener::SharedListenerRegistry;
use common::models::AccountIdentity;
use common::queue::{NatsClient, NatsInvocationPublisher};
use common::storage::{BlobStore, MemoryBlobStore, S3BlobStore};
use common::telemetry;
use common::timer::AdaptiveTimer;
use common::trigger::{FunctionInvoker, Registration};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

async fn build_store(config: &StorageConfig) -> anyhow::Result<Arc<dyn BlobStore>> {
    let store: Arc<dyn BlobStore> = match config.backend {
        StorageBackend::S3 => {
            let store = S3BlobStore::new(config).context("Failed to initialize S3 blob store")?;
            store
                .health_check()
                .await
                .context("Blob storage is unreachable")?;
            Arc::new(store)
        }
        StorageBackend::Memory => {
            let account = if config.emulated {
                AccountIdentity::emulated(config.account_name.clone())
            } else {
                AccountIdentity::new(config.account_name.clone())
            };
            warn!(account = %account, "Using in-memory blob store");
            Arc::new(MemoryBlobStore::new(account))
        }
    };
    Ok(store)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("Failed to load configuration")?;
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )?;
    telemetry::init_metrics(settings.observability.metrics_port)?;

    info!(
        account = %settings.storage.account_name,
        backend = ?settings.storage.backend,
        nats_url = %settings.nats.url,
        triggers = settings.triggers.len(),
        "Starting blob trigger listener"
    );

    let store = build_store(&settings.storage).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let nats_client = NatsClient::new(settings.nats.clone())
        .await
        .context("Failed to initialize NATS client")?;
    nats_client
        .initialize_stream()
        .await
        .context("Failed to initialize NATS stream")?;
    nats_client
        .health_check()
        .await
        .context("NATS stream is unreachable")?;
    let invoker: Arc<dyn FunctionInvoker> = Arc::new(
        NatsInvocationPublisher::new(nats_client)
            .with_timeout(Duration::from_secs(settings.nats.publish_timeout_seconds)),
    );
    info!("Invocation publisher initialized");

    let registry = SharedListenerRegistry::new(
        settings.listener.clone(),
        settings.storage.analytics_container.clone(),
        Arc::clone(&clock),
    );

    let mut listeners = Vec::with_capacity(settings.triggers.len());
    for trigger in &settings.triggers {
        let registration = Registration::from_config(
            store.account().clone(),
            trigger,
            Arc::clone(&invoker),
        )
        .with_context(|| format!("Invalid trigger for function '{}'", trigger.function))?;
        let listener = registry
            .listen(Arc::clone(&store), registration)
            .await
            .with_context(|| format!("Failed to register function '{}'", trigger.function))?;
        info!(function = %trigger.function, input = %trigger.input, "Trigger registered");
        listeners.push(listener);
    }

    if listeners.is_empty() {
        warn!("No triggers configured; listener will idle");
    }

    for listener in &listeners {
        listener.start().await?;
    }

    let heartbeat: Option<AdaptiveTimer> = if settings.heartbeat.enabled {
        let heartbeat = HostHeartbeat::from_config(
            Arc::clone(&store),
            Arc::clone(&clock),
            &settings.heartbeat,
        );
        info!(host_id = %heartbeat.host_id(), "Host heartbeat enabled");
        let timer = heartbeat.into_timer(&settings.heartbeat)?;
        timer.start(true)?;
        Some(timer)
    } else {
        None
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C signal, initiating graceful shutdown");

    if let Some(timer) = &heartbeat {
        timer.dispose().await;
    }
    for listener in &listeners {
        if let Err(e) = listener.stop().await {
            error!(function = %listener.function(), error = %e, "Error stopping listener");
        }
    }
    registry.dispose_all().await;
    telemetry::shutdown_tracer();

    info!("Blob trigger listener stopped");
    Ok(())
}
