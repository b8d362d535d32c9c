// S3-compatible blob store (MinIO, AWS S3) built on rust-s3
// Containers map to buckets; analytics logs live in a dedicated bucket.

use crate::config::StorageConfig;
use crate::errors::StorageError;
use crate::models::{AccountIdentity, BlobIdentity, BlobProperties};
use crate::storage::BlobStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use s3::bucket::Bucket;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::region::Region;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, error, info, instrument};

/// Object holding the account's logging properties inside the analytics bucket
const LOGGING_PROPERTIES_OBJECT: &str = "logging.json";

/// Header prefix carrying user metadata on S3 objects
const METADATA_HEADER_PREFIX: &str = "x-amz-meta-";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LoggingProperties {
    version: String,
    operations: Vec<String>,
    retention_days: Option<u32>,
}

/// Blob store backed by an S3-compatible endpoint
#[derive(Clone, Debug)]
pub struct S3BlobStore {
    account: AccountIdentity,
    region: Region,
    credentials: Credentials,
    analytics_container: String,
}

impl S3BlobStore {
    /// Create a new store from configuration
    #[instrument(skip(config), fields(endpoint = %config.endpoint, account = %config.account_name))]
    pub fn new(config: &StorageConfig) -> Result<Self, StorageError> {
        info!("Initializing S3 blob store");

        // rust-s3 Region::Custom expects the endpoint without a scheme
        let endpoint = config
            .endpoint
            .trim_start_matches("http://")
            .trim_start_matches("https://")
            .to_string();

        let credentials = Credentials::new(
            Some(&config.access_key),
            Some(&config.secret_key),
            None,
            None,
            None,
        )
        .map_err(|e| {
            error!(error = %e, "Failed to create S3 credentials");
            StorageError::S3Error(format!("Failed to create credentials: {}", e))
        })?;

        let region = Region::Custom {
            region: config.region.clone(),
            endpoint,
        };

        let account = if config.emulated {
            AccountIdentity::emulated(config.account_name.clone())
        } else {
            AccountIdentity::new(config.account_name.clone())
        };

        info!(
            account = %account,
            emulated = account.is_emulated(),
            "S3 blob store initialized"
        );

        Ok(Self {
            account,
            region,
            credentials,
            analytics_container: config.analytics_container.clone(),
        })
    }

    fn bucket(&self, container: &str) -> Result<Bucket, StorageError> {
        let bucket = Bucket::new(container, self.region.clone(), self.credentials.clone())
            .map_err(|e| {
                StorageError::S3Error(format!("Failed to open bucket '{}': {}", container, e))
            })?
            .with_path_style();
        Ok(bucket)
    }

    fn identity(&self, container: &str, blob: &str) -> BlobIdentity {
        BlobIdentity::new(self.account.clone(), container, blob)
    }

    /// Health check: list the analytics bucket with a delimiter
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), StorageError> {
        debug!("Performing S3 health check");
        let bucket = self.bucket(&self.analytics_container)?;
        match bucket.list(String::new(), Some("/".to_string())).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let err = classify_error(e, &self.analytics_container);
                if err.is_absent() {
                    Ok(())
                } else {
                    error!(error = %err, "S3 health check failed");
                    Err(err)
                }
            }
        }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    fn account(&self) -> &AccountIdentity {
        &self.account
    }

    #[instrument(skip(self), fields(account = %self.account))]
    async fn list_blobs(
        &self,
        container: &str,
        prefix: Option<&str>,
        with_metadata: bool,
    ) -> Result<Vec<BlobProperties>, StorageError> {
        let bucket = self.bucket(container)?;

        // No delimiter: flat listing across virtual directories
        let results = bucket
            .list(prefix.unwrap_or_default().to_string(), None)
            .await
            .map_err(|e| classify_error(e, container))?;

        let mut blobs = Vec::new();
        for result in results {
            for object in result.contents {
                let last_modified = parse_rfc3339(&object.last_modified)?;
                let mut properties =
                    BlobProperties::new(self.identity(container, &object.key), last_modified);
                if with_metadata {
                    match self.get_properties(container, &object.key).await {
                        Ok(fetched) => properties.metadata = fetched.metadata,
                        // Deleted between listing and fetch
                        Err(e) if e.is_absent() => continue,
                        Err(e) => return Err(e),
                    }
                }
                blobs.push(properties);
            }
        }

        debug!(container, count = blobs.len(), "Blobs listed");
        Ok(blobs)
    }

    #[instrument(skip(self), fields(account = %self.account))]
    async fn get_properties(
        &self,
        container: &str,
        blob: &str,
    ) -> Result<BlobProperties, StorageError> {
        let bucket = self.bucket(container)?;
        let path = format!("{}/{}", container, blob);

        let (head, status) = bucket
            .head_object(blob)
            .await
            .map_err(|e| classify_error(e, &path))?;
        check_status(status, &path)?;

        let last_modified = head
            .last_modified
            .as_deref()
            .ok_or_else(|| StorageError::InvalidTimestamp {
                value: String::new(),
                reason: format!("no Last-Modified header for '{}'", path),
            })
            .and_then(parse_http_date)?;

        Ok(BlobProperties::new(self.identity(container, blob), last_modified)
            .with_metadata(head.metadata.unwrap_or_default()))
    }

    #[instrument(skip(self), fields(account = %self.account))]
    async fn read_blob(&self, container: &str, blob: &str) -> Result<Vec<u8>, StorageError> {
        let bucket = self.bucket(container)?;
        let path = format!("{}/{}", container, blob);

        let response = bucket
            .get_object(blob)
            .await
            .map_err(|e| classify_error(e, &path))?;
        check_status(response.status_code(), &path)?;

        let data = response.bytes().to_vec();
        debug!(path = %path, size = data.len(), "Blob read");
        Ok(data)
    }

    #[instrument(skip(self, data, metadata), fields(account = %self.account, size = data.len()))]
    async fn put_blob(
        &self,
        container: &str,
        blob: &str,
        data: &[u8],
        metadata: HashMap<String, String>,
    ) -> Result<(), StorageError> {
        let mut bucket = self.bucket(container)?;
        for (key, value) in &metadata {
            bucket.add_header(&format!("{}{}", METADATA_HEADER_PREFIX, key), value);
        }

        let path = format!("{}/{}", container, blob);
        let response = bucket
            .put_object(blob, data)
            .await
            .map_err(|e| classify_error(e, &path))?;
        check_status(response.status_code(), &path)?;

        debug!(path = %path, "Blob written");
        Ok(())
    }

    #[instrument(skip(self), fields(account = %self.account))]
    async fn enable_write_logging(&self, retention_days: u32) -> Result<bool, StorageError> {
        let current = match self
            .read_blob(&self.analytics_container, LOGGING_PROPERTIES_OBJECT)
            .await
        {
            Ok(bytes) => serde_json::from_slice::<LoggingProperties>(&bytes)?,
            Err(e) if e.is_absent() => LoggingProperties::default(),
            Err(e) => return Err(e),
        };

        if !current.operations.is_empty() {
            debug!(operations = ?current.operations, "Analytics logging already enabled");
            return Ok(false);
        }

        let activated = LoggingProperties {
            version: "1.0".to_string(),
            operations: vec!["write".to_string()],
            retention_days: Some(retention_days),
        };
        let body = serde_json::to_vec(&activated)?;
        self.put_blob(
            &self.analytics_container,
            LOGGING_PROPERTIES_OBJECT,
            &body,
            HashMap::new(),
        )
        .await?;

        info!(retention_days, "Analytics write logging enabled");
        Ok(true)
    }
}

/// Map an rust-s3 error onto the storage taxonomy
fn classify_error(err: S3Error, path: &str) -> StorageError {
    let message = err.to_string();
    if message.contains("404")
        || message.contains("Not Found")
        || message.contains("NoSuchKey")
        || message.contains("NoSuchBucket")
    {
        StorageError::NotFound(path.to_string())
    } else if message.contains("503") || message.contains("SlowDown") {
        StorageError::Throttled(format!("'{}': {}", path, message))
    } else if message.contains("error sending request") || message.contains("connection") {
        StorageError::ConnectionFailed(format!("'{}': {}", path, message))
    } else {
        StorageError::S3Error(format!("'{}': {}", path, message))
    }
}

fn check_status(status: u16, path: &str) -> Result<(), StorageError> {
    match status {
        200..=299 => Ok(()),
        404 => Err(StorageError::NotFound(path.to_string())),
        503 => Err(StorageError::Throttled(format!("'{}' returned 503", path))),
        other => Err(StorageError::S3Error(format!(
            "'{}' returned HTTP {}",
            path, other
        ))),
    }
}

fn parse_rfc3339(value: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::InvalidTimestamp {
            value: value.to_string(),
            reason: e.to_string(),
        })
}

fn parse_http_date(value: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc2822(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::InvalidTimestamp {
            value: value.to_string(),
            reason: e.to_string(),
        })
}
