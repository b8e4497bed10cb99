//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;

/// A boxed stream of object keys.
pub type KeyStream = Pin<Box<dyn Stream<Item = StorageResult<String>> + Send>>;

/// Blob store addressed by slash-separated keys.
///
/// Writes through `put` are atomic: a reader observes either the previous
/// object or the complete new one, never a partial write. `append` is not;
/// a failed append may leave a partial tail.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Check if an object exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Get an object's size without fetching content.
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta>;

    /// Get an object's content.
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Get bytes `[start, end)` of an object.
    async fn get_range(&self, key: &str, start: u64, end: u64) -> StorageResult<Bytes>;

    /// Put an object atomically, replacing any previous value.
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()>;

    /// Put an object only if it doesn't exist. Returns whether it was written.
    async fn put_if_not_exists(&self, key: &str, data: Bytes) -> StorageResult<bool>;

    /// Append `data` to an object, creating it if missing, and flush it to
    /// durable storage before returning.
    async fn append(&self, key: &str, data: Bytes) -> StorageResult<()>;

    /// Delete an object. Deleting a missing object is `NotFound`.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// List every key under `prefix`.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// List keys under `prefix` lazily.
    async fn list_stream(&self, prefix: &str) -> StorageResult<KeyStream>;

    /// Static identifier for metrics and logs (e.g. "filesystem").
    fn backend_name(&self) -> &'static str;

    /// Verify the backend is reachable and correctly configured.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Metadata about a stored object.
#[derive(Clone, Debug)]
pub struct ObjectMeta {
    /// Object size in bytes.
    pub size: u64,
    /// Last modification time (if available).
    pub last_modified: Option<time::OffsetDateTime>,
}
