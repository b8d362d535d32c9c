// In-process blob store for emulated accounts and tests
// Fault injection is per container and stays until cleared. Failures on
// `$logs` also fail enabling write logging.

use crate::clock::{Clock, SystemClock};
use crate::errors::StorageError;
use crate::models::{AccountIdentity, BlobIdentity, BlobProperties};
use crate::storage::BlobStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, instrument};

const LOGGING_CONTAINER: &str = "$logs";

#[derive(Debug, Clone)]
struct StoredBlob {
    data: Vec<u8>,
    last_modified: DateTime<Utc>,
    metadata: HashMap<String, String>,
}

#[derive(Default)]
struct Inner {
    containers: HashMap<String, BTreeMap<String, StoredBlob>>,
    failures: HashMap<String, StorageError>,
    logging_enabled: bool,
    retention_days: Option<u32>,
}

/// Blob store kept entirely in memory
#[derive(Clone)]
pub struct MemoryBlobStore {
    account: AccountIdentity,
    clock: Arc<dyn Clock>,
    inner: Arc<Mutex<Inner>>,
    enable_logging_calls: Arc<AtomicUsize>,
}

impl MemoryBlobStore {
    pub fn new(account: AccountIdentity) -> Self {
        Self::with_clock(account, Arc::new(SystemClock))
    }

    /// Store whose write timestamps come from the given clock
    pub fn with_clock(account: AccountIdentity, clock: Arc<dyn Clock>) -> Self {
        Self {
            account,
            clock,
            inner: Arc::new(Mutex::new(Inner::default())),
            enable_logging_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn create_container(&self, container: &str) {
        self.lock()
            .containers
            .entry(container.to_string())
            .or_default();
    }

    /// Write a blob with an explicit last-modified time
    pub fn put_blob_at(
        &self,
        container: &str,
        blob: &str,
        data: &[u8],
        last_modified: DateTime<Utc>,
    ) {
        self.put_blob_with_metadata_at(container, blob, data, HashMap::new(), last_modified);
    }

    pub fn put_blob_with_metadata_at(
        &self,
        container: &str,
        blob: &str,
        data: &[u8],
        metadata: HashMap<String, String>,
        last_modified: DateTime<Utc>,
    ) {
        self.lock()
            .containers
            .entry(container.to_string())
            .or_default()
            .insert(
                blob.to_string(),
                StoredBlob {
                    data: data.to_vec(),
                    last_modified,
                    metadata,
                },
            );
    }

    pub fn delete_blob(&self, container: &str, blob: &str) {
        if let Some(blobs) = self.lock().containers.get_mut(container) {
            blobs.remove(blob);
        }
    }

    /// Fail every operation on `container` with `error` until cleared
    pub fn inject_failure(&self, container: &str, error: StorageError) {
        self.lock().failures.insert(container.to_string(), error);
    }

    pub fn clear_failure(&self, container: &str) {
        self.lock().failures.remove(container);
    }

    /// How many times `enable_write_logging` has been called
    pub fn enable_logging_calls(&self) -> usize {
        self.enable_logging_calls.load(Ordering::SeqCst)
    }

    pub fn retention_days(&self) -> Option<u32> {
        self.lock().retention_days
    }

    fn check_failure(&self, inner: &Inner, container: &str) -> Result<(), StorageError> {
        match inner.failures.get(container) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn properties(&self, container: &str, name: &str, blob: &StoredBlob) -> BlobProperties {
        BlobProperties::new(
            BlobIdentity::new(self.account.clone(), container, name),
            blob.last_modified,
        )
        .with_metadata(blob.metadata.clone())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
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
        let inner = self.lock();
        self.check_failure(&inner, container)?;

        let blobs = inner
            .containers
            .get(container)
            .ok_or_else(|| StorageError::NotFound(container.to_string()))?;

        let listed: Vec<BlobProperties> = blobs
            .iter()
            .filter(|(name, _)| prefix.map_or(true, |p| name.starts_with(p)))
            .map(|(name, blob)| {
                let properties = self.properties(container, name, blob);
                if with_metadata {
                    properties
                } else {
                    properties.with_metadata(HashMap::new())
                }
            })
            .collect();

        debug!(container, count = listed.len(), "Blobs listed");
        Ok(listed)
    }

    async fn get_properties(
        &self,
        container: &str,
        blob: &str,
    ) -> Result<BlobProperties, StorageError> {
        let inner = self.lock();
        self.check_failure(&inner, container)?;

        inner
            .containers
            .get(container)
            .and_then(|blobs| blobs.get(blob))
            .map(|stored| self.properties(container, blob, stored))
            .ok_or_else(|| StorageError::NotFound(format!("{}/{}", container, blob)))
    }

    async fn read_blob(&self, container: &str, blob: &str) -> Result<Vec<u8>, StorageError> {
        let inner = self.lock();
        self.check_failure(&inner, container)?;

        inner
            .containers
            .get(container)
            .and_then(|blobs| blobs.get(blob))
            .map(|stored| stored.data.clone())
            .ok_or_else(|| StorageError::NotFound(format!("{}/{}", container, blob)))
    }

    async fn put_blob(
        &self,
        container: &str,
        blob: &str,
        data: &[u8],
        metadata: HashMap<String, String>,
    ) -> Result<(), StorageError> {
        {
            let inner = self.lock();
            self.check_failure(&inner, container)?;
        }
        let now = self.clock.now();
        self.put_blob_with_metadata_at(container, blob, data, metadata, now);
        Ok(())
    }

    async fn enable_write_logging(&self, retention_days: u32) -> Result<bool, StorageError> {
        self.enable_logging_calls.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.lock();
        self.check_failure(&inner, LOGGING_CONTAINER)?;
        if inner.logging_enabled {
            return Ok(false);
        }
        inner.logging_enabled = true;
        inner.retention_days = Some(retention_days);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use chrono::TimeZone;

    fn store() -> MemoryBlobStore {
        MemoryBlobStore::new(AccountIdentity::new("prod"))
    }

    #[tokio::test]
    async fn test_missing_container_is_not_found() {
        let result = store().list_blobs("missing", None, false).await;
        assert_eq!(result, Err(StorageError::NotFound("missing".to_string())));
    }

    #[tokio::test]
    async fn test_list_with_prefix() {
        let store = store();
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        store.put_blob_at("c", "a/1.txt", b"1", t);
        store.put_blob_at("c", "a/2.txt", b"2", t);
        store.put_blob_at("c", "b/1.txt", b"3", t);

        let listed = store.list_blobs("c", Some("a/"), false).await.unwrap();
        let names: Vec<_> = listed.iter().map(|b| b.identity.name.as_str()).collect();
        assert_eq!(names, vec!["a/1.txt", "a/2.txt"]);
    }

    #[tokio::test]
    async fn test_put_blob_uses_clock() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let store = MemoryBlobStore::with_clock(
            AccountIdentity::new("prod"),
            Arc::new(FakeClock::new(start)),
        );
        store.put_blob("c", "x", b"data", HashMap::new()).await.unwrap();

        let props = store.get_properties("c", "x").await.unwrap();
        assert_eq!(props.last_modified, start);
        assert_eq!(store.read_blob("c", "x").await.unwrap(), b"data".to_vec());
    }

    #[tokio::test]
    async fn test_injected_failure_until_cleared() {
        let store = store();
        store.create_container("c");
        store.inject_failure("c", StorageError::Throttled("busy".to_string()));
        assert!(matches!(
            store.list_blobs("c", None, false).await,
            Err(StorageError::Throttled(_))
        ));

        store.clear_failure("c");
        assert!(store.list_blobs("c", None, false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_enable_write_logging_only_first_time() {
        let store = store();
        assert!(store.enable_write_logging(7).await.unwrap());
        assert!(!store.enable_write_logging(30).await.unwrap());
        assert_eq!(store.retention_days(), Some(7));
        assert_eq!(store.enable_logging_calls(), 2);
    }
}
