// Host heartbeat
// Periodically records that this host is alive by writing a small JSON blob.
// Runs behind a BackoffCommand so a failed write is retried sooner.

use crate::clock::Clock;
use crate::config::HeartbeatConfig;
use crate::errors::{StorageError, TimerError};
use crate::storage::BlobStore;
use crate::timer::{AdaptiveTimer, BackoffCommand, CanFailCommand};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub host_id: String,
    pub timestamp: DateTime<Utc>,
}

pub struct HostHeartbeat {
    store: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
    container: String,
    host_id: String,
}

impl HostHeartbeat {
    pub fn new(
        store: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
        container: impl Into<String>,
        host_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            clock,
            container: container.into(),
            host_id: host_id.into(),
        }
    }

    /// Build from configuration; a missing host id gets a fresh UUID
    pub fn from_config(store: Arc<dyn BlobStore>, clock: Arc<dyn Clock>, config: &HeartbeatConfig) -> Self {
        let host_id = config
            .host_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Self::new(store, clock, config.container.clone(), host_id)
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn blob_name(&self) -> String {
        format!("heartbeats/{}.json", self.host_id)
    }

    #[instrument(skip(self), fields(host_id = %self.host_id))]
    pub async fn beat(&self) -> Result<(), StorageError> {
        let record = HeartbeatRecord {
            host_id: self.host_id.clone(),
            timestamp: self.clock.now(),
        };
        let body = serde_json::to_vec(&record)?;
        self.store
            .put_blob(&self.container, &self.blob_name(), &body, HashMap::new())
            .await?;
        debug!(timestamp = %record.timestamp, "Heartbeat written");
        Ok(())
    }

    /// Wrap in a backoff command and an adaptive timer using the configured
    /// intervals
    pub fn into_timer(self, config: &HeartbeatConfig) -> Result<AdaptiveTimer, TimerError> {
        let command = BackoffCommand::new(
            Box::new(self),
            Duration::from_secs(config.normal_interval_seconds),
            Duration::from_secs(config.minimum_interval_seconds),
            config.failure_speedup_divisor,
        )?;
        Ok(AdaptiveTimer::new("host-heartbeat", Arc::new(command)))
    }
}

#[async_trait]
impl CanFailCommand for HostHeartbeat {
    async fn try_execute(&self, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        match self.beat().await {
            Ok(()) => true,
            Err(e) => {
                warn!(host_id = %self.host_id, error = %e, "Heartbeat write failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::models::AccountIdentity;
    use crate::storage::MemoryBlobStore;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    fn heartbeat(store: &MemoryBlobStore) -> HostHeartbeat {
        HostHeartbeat::new(
            Arc::new(store.clone()),
            Arc::new(FakeClock::new(start())),
            "host-heartbeats",
            "host-1",
        )
    }

    #[tokio::test]
    async fn test_beat_writes_record() {
        let store = MemoryBlobStore::new(AccountIdentity::new("prod"));
        let heartbeat = heartbeat(&store);

        assert!(heartbeat.try_execute(&CancellationToken::new()).await);

        let body = store
            .read_blob("host-heartbeats", "heartbeats/host-1.json")
            .await
            .unwrap();
        let record: HeartbeatRecord = serde_json::from_slice(&body).unwrap();
        assert_eq!(record.host_id, "host-1");
        assert_eq!(record.timestamp, start());
    }

    #[tokio::test]
    async fn test_failed_write_reports_failure() {
        let store = MemoryBlobStore::new(AccountIdentity::new("prod"));
        store.inject_failure("host-heartbeats", StorageError::Throttled("busy".to_string()));
        let heartbeat = heartbeat(&store);

        assert!(!heartbeat.try_execute(&CancellationToken::new()).await);
    }

    #[test]
    fn test_missing_host_id_is_generated() {
        let store = MemoryBlobStore::new(AccountIdentity::new("prod"));
        let config = HeartbeatConfig {
            enabled: true,
            container: "host-heartbeats".to_string(),
            host_id: None,
            normal_interval_seconds: 30,
            minimum_interval_seconds: 2,
            failure_speedup_divisor: 2,
        };
        let heartbeat = HostHeartbeat::from_config(Arc::new(store), Arc::new(FakeClock::new(start())), &config);
        assert!(Uuid::parse_str(heartbeat.host_id()).is_ok());
        assert!(heartbeat.into_timer(&config).is_ok());
    }

    #[test]
    fn test_invalid_backoff_rejected() {
        let store = MemoryBlobStore::new(AccountIdentity::new("prod"));
        let config = HeartbeatConfig {
            enabled: true,
            container: "host-heartbeats".to_string(),
            host_id: Some("host-1".to_string()),
            normal_interval_seconds: 1,
            minimum_interval_seconds: 5,
            failure_speedup_divisor: 2,
        };
        let heartbeat = HostHeartbeat::from_config(Arc::new(store), Arc::new(FakeClock::new(start())), &config);
        assert!(matches!(
            heartbeat.into_timer(&config),
            Err(TimerError::InvalidArgument { .. })
        ));
    }
}
