// Configuration management with layered configuration (file, env)
// Layers: config/default.toml -> config/local.toml -> APP__* environment

use crate::blob_path::BlobPathPattern;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub storage: StorageConfig,
    pub nats: NatsConfig,
    pub listener: ListenerConfig,
    pub heartbeat: HeartbeatConfig,
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    S3,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    pub account_name: String,
    /// Emulated accounts have no analytics logs and are polled by scanning
    #[serde(default)]
    pub emulated: bool,
    #[serde(default = "default_analytics_container")]
    pub analytics_container: String,
}

fn default_backend() -> StorageBackend {
    StorageBackend::S3
}

fn default_analytics_container() -> String {
    "$logs".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsConfig {
    pub url: String,
    pub stream_name: String,
    /// Invocations are published on `<subject_prefix>.<function>`
    pub subject_prefix: String,
    pub max_age_seconds: u64,
    pub publish_timeout_seconds: u64,
}

/// One week of hourly log prefixes
pub const MAX_PREVIOUS_HOURS: u32 = 24 * 7;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub scan_interval_seconds: u64,
    pub log_poll_interval_seconds: u64,
    /// Earlier hourly log prefixes read on every tick, besides the current one
    pub previous_hours: u32,
    pub seen_log_limit: usize,
    pub log_retention_days: u32,
}

impl ListenerConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_seconds)
    }

    pub fn log_poll_interval(&self) -> Duration {
        Duration::from_secs(self.log_poll_interval_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    pub container: String,
    /// Defaults to a random id per process
    pub host_id: Option<String>,
    pub normal_interval_seconds: u64,
    pub minimum_interval_seconds: u64,
    pub failure_speedup_divisor: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub metrics_port: u16,
    pub tracing_endpoint: Option<String>,
}

/// One function bound to a blob trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub function: String,
    /// `container/pattern` of the triggering blob
    pub input: String,
    #[serde(default)]
    pub outputs: Vec<String>,
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default configuration
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        // Validate storage config
        if self.storage.backend == StorageBackend::S3 && self.storage.endpoint.is_empty() {
            return Err("Storage endpoint cannot be empty".to_string());
        }
        if self.storage.account_name.is_empty() {
            return Err("Storage account_name cannot be empty".to_string());
        }
        if self.storage.analytics_container.is_empty() {
            return Err("Storage analytics_container cannot be empty".to_string());
        }

        // Validate NATS config
        if self.nats.url.is_empty() {
            return Err("NATS URL cannot be empty".to_string());
        }
        if self.nats.subject_prefix.is_empty() {
            return Err("NATS subject_prefix cannot be empty".to_string());
        }

        // Validate listener config
        if self.listener.scan_interval_seconds == 0 {
            return Err("Listener scan_interval_seconds must be greater than 0".to_string());
        }
        if self.listener.log_poll_interval_seconds == 0 {
            return Err("Listener log_poll_interval_seconds must be greater than 0".to_string());
        }
        if self.listener.seen_log_limit == 0 {
            return Err("Listener seen_log_limit must be greater than 0".to_string());
        }
        if self.listener.previous_hours > MAX_PREVIOUS_HOURS {
            return Err(format!(
                "Listener previous_hours must be at most {}",
                MAX_PREVIOUS_HOURS
            ));
        }

        // Validate heartbeat config
        if self.heartbeat.enabled {
            if self.heartbeat.container.is_empty() {
                return Err("Heartbeat container cannot be empty".to_string());
            }
            if self.heartbeat.normal_interval_seconds == 0 {
                return Err("Heartbeat normal_interval_seconds must be greater than 0".to_string());
            }
            if self.heartbeat.minimum_interval_seconds > self.heartbeat.normal_interval_seconds {
                return Err(
                    "Heartbeat minimum_interval_seconds must not exceed normal_interval_seconds"
                        .to_string(),
                );
            }
            if self.heartbeat.failure_speedup_divisor < 1 {
                return Err("Heartbeat failure_speedup_divisor must be at least 1".to_string());
            }
        }

        // Validate trigger definitions
        for trigger in &self.triggers {
            if trigger.function.is_empty() {
                return Err("Trigger function name cannot be empty".to_string());
            }
            BlobPathPattern::parse(&trigger.input)
                .map_err(|e| format!("Trigger '{}' input: {}", trigger.function, e))?;
            for output in &trigger.outputs {
                let pattern = BlobPathPattern::parse(output)
                    .map_err(|e| format!("Trigger '{}' output: {}", trigger.function, e))?;
                if pattern.is_container_only() {
                    return Err(format!(
                        "Trigger '{}' output '{}' must name a blob",
                        trigger.function, output
                    ));
                }
            }
        }

        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            storage: StorageConfig {
                backend: StorageBackend::S3,
                endpoint: "http://localhost:9000".to_string(),
                access_key: "minioadmin".to_string(),
                secret_key: "minioadmin".to_string(),
                region: "us-east-1".to_string(),
                account_name: "devstoreaccount1".to_string(),
                emulated: false,
                analytics_container: default_analytics_container(),
            },
            nats: NatsConfig {
                url: "nats://localhost:4222".to_string(),
                stream_name: "FUNCTIONS".to_string(),
                subject_prefix: "functions".to_string(),
                max_age_seconds: 86400,
                publish_timeout_seconds: 5,
            },
            listener: ListenerConfig {
                scan_interval_seconds: 2,
                log_poll_interval_seconds: 2,
                previous_hours: 2,
                seen_log_limit: 100_000,
                log_retention_days: 7,
            },
            heartbeat: HeartbeatConfig {
                enabled: true,
                container: "host-heartbeats".to_string(),
                host_id: None,
                normal_interval_seconds: 30,
                minimum_interval_seconds: 2,
                failure_speedup_divisor: 2,
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                metrics_port: 9090,
                tracing_endpoint: None,
            },
            triggers: Vec::new(),
        }
    }
}
