//! Chunk and chunk-reference repository.

use crate::error::MetadataResult;
use crate::models::ChunkRow;
use async_trait::async_trait;
use uuid::Uuid;

/// Result of recording a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefOutcome {
    /// A new reference row was written.
    Added,
    /// The identical reference already existed.
    AlreadyPresent,
}

/// Result of recording a chunk row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkInsert {
    Inserted,
    /// The row already existed; its access time was refreshed.
    Existed,
    /// A new row would push the summed chunk sizes past the quota.
    OverQuota,
}

/// Repository for chunk rows and their per-upload references.
#[async_trait]
pub trait ChunkRepo: Send + Sync {
    /// Record a chunk blob. Re-recording an existing chunk only refreshes its
    /// access time.
    ///
    /// With `quota`, a new row is written only if the summed size of all rows
    /// stays at or below it. The check and the insert are one statement.
    async fn upsert_chunk(
        &self,
        chunk_hash: &str,
        size_bytes: i64,
        quota: Option<i64>,
    ) -> MetadataResult<ChunkInsert>;

    async fn get_chunk(&self, chunk_hash: &str) -> MetadataResult<Option<ChunkRow>>;

    /// Add the reference `(chunk_hash, upload_id, position)`.
    ///
    /// Adding the same triple twice is a no-op. A different chunk already
    /// recorded at `(upload_id, position)` is a constraint violation.
    async fn add_ref(
        &self,
        chunk_hash: &str,
        upload_id: Uuid,
        position: i64,
    ) -> MetadataResult<RefOutcome>;

    /// Drop every reference `upload_id` holds on `chunk_hash`. Returns the
    /// number of references removed.
    async fn remove_refs(&self, chunk_hash: &str, upload_id: Uuid) -> MetadataResult<u64>;

    /// Drop the single reference held at `(upload_id, position)` if it points
    /// at `chunk_hash`. Returns whether a row was removed.
    async fn remove_ref_at(
        &self,
        chunk_hash: &str,
        upload_id: Uuid,
        position: i64,
    ) -> MetadataResult<bool>;

    /// Drop every reference `upload_id` holds at `position` or beyond.
    ///
    /// Used when an upload is resumed from its manifest: a reference written
    /// for a chunk whose manifest append never completed is discarded.
    async fn remove_refs_from(&self, upload_id: Uuid, position: i64) -> MetadataResult<u64>;

    /// Total references to a chunk across all uploads.
    async fn refcount(&self, chunk_hash: &str) -> MetadataResult<u64>;

    /// References `upload_id` holds on a chunk.
    async fn refcount_for_upload(&self, chunk_hash: &str, upload_id: Uuid)
    -> MetadataResult<u64>;

    /// Chunks with no references, oldest first.
    async fn list_unreferenced(&self, limit: u32) -> MetadataResult<Vec<ChunkRow>>;

    /// Delete the chunk row only if it is still unreferenced. Returns whether
    /// a row was deleted; callers delete the blob only in that case.
    async fn delete_if_unreferenced(&self, chunk_hash: &str) -> MetadataResult<bool>;

    async fn get_stats(&self) -> MetadataResult<ChunkStats>;
}

/// Chunk statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ChunkStats {
    /// Total number of chunks.
    pub count: u64,
    /// Total size in bytes.
    pub total_size: u64,
    /// Number of chunks with at least one reference.
    pub referenced_count: u64,
    /// Number of chunks with no references.
    pub unreferenced_count: u64,
}
