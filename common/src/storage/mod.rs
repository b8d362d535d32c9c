// Storage module: blob store abstraction with S3 and in-memory backends

pub mod memory;
pub mod s3;
pub mod timestamp;

use crate::errors::StorageError;
use crate::models::{AccountIdentity, BlobProperties};
use async_trait::async_trait;
use std::collections::HashMap;

pub use memory::MemoryBlobStore;
pub use s3::S3BlobStore;
pub use timestamp::TimestampOracle;

/// Read-mostly view of one storage account
///
/// Missing containers and blobs are reported as `StorageError::NotFound`;
/// callers decide whether that means "absent" or "empty".
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// The account this store serves
    fn account(&self) -> &AccountIdentity;

    /// Flat listing of a container, optionally filtered by name prefix
    ///
    /// When `with_metadata` is false the returned metadata maps may be empty.
    async fn list_blobs(
        &self,
        container: &str,
        prefix: Option<&str>,
        with_metadata: bool,
    ) -> Result<Vec<BlobProperties>, StorageError>;

    /// Fetch existence, last-modified time and custom metadata of one blob
    async fn get_properties(
        &self,
        container: &str,
        blob: &str,
    ) -> Result<BlobProperties, StorageError>;

    /// Read the full content of a blob
    async fn read_blob(&self, container: &str, blob: &str) -> Result<Vec<u8>, StorageError>;

    /// Write a blob, replacing any existing content and metadata
    async fn put_blob(
        &self,
        container: &str,
        blob: &str,
        data: &[u8],
        metadata: HashMap<String, String>,
    ) -> Result<(), StorageError>;

    /// Turn on write logging for the account
    ///
    /// Only changes anything when logging is currently off; the retention
    /// policy is set on that first activation. Returns true if logging was
    /// activated by this call.
    async fn enable_write_logging(&self, retention_days: u32) -> Result<bool, StorageError>;
}
