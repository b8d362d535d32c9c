// Last-modified lookups with not-found normalised to absent

use crate::errors::StorageError;
use crate::models::{BlobIdentity, BlobProperties};
use crate::storage::BlobStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Answers "when was this blob last written, if it exists at all"
#[derive(Clone)]
pub struct TimestampOracle {
    store: Arc<dyn BlobStore>,
}

impl TimestampOracle {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }

    /// Last-modified time of `blob`, `None` when it does not exist
    ///
    /// Missing containers, missing blobs and non-block blobs all read as
    /// absent. Any other storage failure is returned to the caller.
    #[instrument(skip(self, blob), fields(blob = %blob))]
    pub async fn get_last_modified(
        &self,
        blob: &BlobIdentity,
    ) -> Result<Option<DateTime<Utc>>, StorageError> {
        Ok(self
            .get_properties(blob)
            .await?
            .map(|properties| properties.last_modified))
    }

    /// Full properties of `blob`, `None` when it does not exist
    pub async fn get_properties(
        &self,
        blob: &BlobIdentity,
    ) -> Result<Option<BlobProperties>, StorageError> {
        match self
            .store
            .get_properties(blob.container_name(), &blob.name)
            .await
        {
            Ok(properties) => Ok(Some(properties)),
            Err(e) if e.is_absent() => {
                debug!(blob = %blob, reason = %e, "Blob treated as absent");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
