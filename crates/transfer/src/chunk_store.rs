//! Content-addressed chunk store with per-upload reference counts.
//!
//! Blobs live in the object store under `chunks/<hh>/<hash>`; the chunk row
//! and its references live in the metadata store. Every mutation of one chunk
//! runs under that chunk's lock, so a sweep can never delete a blob between
//! the moment it is written and the moment an upload references it.

use crate::locks::KeyedLocks;
use bytes::Bytes;
use ferry_core::{Chunk, ChunkHash, Error, Result, UploadId};
use ferry_metadata::{ChunkInsert, ChunkStats, MetadataStore};
use ferry_storage::{ObjectStore, StorageError};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use tracing::instrument;

/// Rows fetched per sweep round.
const SWEEP_BATCH: u32 = 256;

/// Whether `put` wrote a new blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    Existed,
}

/// What a sweep removed (or, in a dry run, would remove).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepStats {
    pub chunks_deleted: u64,
    pub bytes_reclaimed: u64,
    /// Blobs found in storage with no chunk row at all.
    pub orphans_deleted: u64,
    pub errors: u64,
}

pub struct ChunkStore {
    objects: Arc<dyn ObjectStore>,
    metadata: Arc<dyn MetadataStore>,
    locks: KeyedLocks<ChunkHash>,
    max_total_bytes: Option<u64>,
}

impl ChunkStore {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
        max_total_bytes: Option<u64>,
    ) -> Self {
        Self {
            objects,
            metadata,
            locks: KeyedLocks::new(),
            max_total_bytes,
        }
    }

    /// Store `data` under `hash`. Idempotent.
    #[instrument(skip(self, data), fields(chunk_hash = %hash, size = data.len()))]
    pub async fn put(&self, hash: &ChunkHash, data: Bytes) -> Result<PutOutcome> {
        Chunk::verify(&data, hash)?;
        let _guard = self.locks.lock(hash).await;
        self.put_locked(hash, data).await
    }

    /// Store `data` and reference it from `(upload_id, position)` as one step.
    #[instrument(skip(self, data), fields(chunk_hash = %hash, upload_id = %upload_id))]
    pub async fn put_and_ref(
        &self,
        hash: &ChunkHash,
        data: Bytes,
        upload_id: &UploadId,
        position: u64,
    ) -> Result<PutOutcome> {
        Chunk::verify(&data, hash)?;
        let _guard = self.locks.lock(hash).await;
        let outcome = self.put_locked(hash, data).await?;
        self.metadata
            .add_ref(&hash.to_hex(), *upload_id.as_uuid(), position_i64(position)?)
            .await?;
        Ok(outcome)
    }

    async fn put_locked(&self, hash: &ChunkHash, data: Bytes) -> Result<PutOutcome> {
        let hex = hash.to_hex();
        let key = hash.to_object_key();
        let size = data.len() as i64;
        let quota = self
            .max_total_bytes
            .map(|limit| i64::try_from(limit).unwrap_or(i64::MAX));

        // The row goes first so the quota is enforced before any bytes land.
        let row = self.metadata.upsert_chunk(&hex, size, quota).await?;
        if row == ChunkInsert::OverQuota {
            return Err(Error::QuotaExceeded(format!(
                "storing {size} more bytes would exceed the {} byte chunk quota",
                quota.unwrap_or(i64::MAX)
            )));
        }

        match self.objects.put_if_not_exists(&key, data).await {
            Ok(true) => Ok(PutOutcome::Stored),
            Ok(false) => Ok(PutOutcome::Existed),
            Err(e) => {
                // Only drop a row this call created.
                if row == ChunkInsert::Inserted
                    && let Err(cleanup_err) = self.metadata.delete_if_unreferenced(&hex).await
                {
                    tracing::warn!(
                        chunk_hash = %hex,
                        error = %cleanup_err,
                        "Failed to remove chunk row after storage error"
                    );
                }
                Err(e.into())
            }
        }
    }

    pub async fn get(&self, hash: &ChunkHash) -> Result<Bytes> {
        Ok(self.objects.get(&hash.to_object_key()).await?)
    }

    /// Bytes `[start, end)` of one chunk.
    pub async fn get_range(&self, hash: &ChunkHash, start: u64, end: u64) -> Result<Bytes> {
        Ok(self
            .objects
            .get_range(&hash.to_object_key(), start, end)
            .await?)
    }

    pub async fn exists(&self, hash: &ChunkHash) -> Result<bool> {
        Ok(self.metadata.get_chunk(&hash.to_hex()).await?.is_some()
            && self.objects.exists(&hash.to_object_key()).await?)
    }

    /// Drop every reference `upload_id` holds on `hash`.
    pub async fn decref(&self, hash: &ChunkHash, upload_id: &UploadId) -> Result<u64> {
        let _guard = self.locks.lock(hash).await;
        Ok(self
            .metadata
            .remove_refs(&hash.to_hex(), *upload_id.as_uuid())
            .await?)
    }

    /// Drop the single reference at `(upload_id, position)`.
    pub async fn unref_at(
        &self,
        hash: &ChunkHash,
        upload_id: &UploadId,
        position: u64,
    ) -> Result<bool> {
        let _guard = self.locks.lock(hash).await;
        Ok(self
            .metadata
            .remove_ref_at(&hash.to_hex(), *upload_id.as_uuid(), position_i64(position)?)
            .await?)
    }

    /// Drop references `upload_id` holds at `position` or later.
    pub async fn unref_from(&self, upload_id: &UploadId, position: u64) -> Result<u64> {
        Ok(self
            .metadata
            .remove_refs_from(*upload_id.as_uuid(), position_i64(position)?)
            .await?)
    }

    pub async fn refcount(&self, hash: &ChunkHash) -> Result<u64> {
        Ok(self.metadata.refcount(&hash.to_hex()).await?)
    }

    pub async fn refcount_for_upload(&self, hash: &ChunkHash, upload_id: &UploadId) -> Result<u64> {
        Ok(self
            .metadata
            .refcount_for_upload(&hash.to_hex(), *upload_id.as_uuid())
            .await?)
    }

    pub async fn stats(&self) -> Result<ChunkStats> {
        Ok(self.metadata.get_stats().await?)
    }

    /// Delete every chunk with no references.
    ///
    /// The row is deleted first, under the chunk lock and only if still
    /// unreferenced; the blob follows. A blob whose delete fails is picked up
    /// later by [`ChunkStore::sweep_orphans`].
    #[instrument(skip(self))]
    pub async fn sweep(&self, dry_run: bool) -> Result<SweepStats> {
        let mut stats = SweepStats::default();

        if dry_run {
            let rows = self.metadata.list_unreferenced(u32::MAX).await?;
            stats.chunks_deleted = rows.len() as u64;
            stats.bytes_reclaimed = rows.iter().map(|r| r.size_bytes.max(0) as u64).sum();
            return Ok(stats);
        }

        loop {
            let batch = self.metadata.list_unreferenced(SWEEP_BATCH).await?;
            if batch.is_empty() {
                break;
            }
            let mut progressed = false;

            for row in batch {
                let hash = match ChunkHash::from_hex(&row.chunk_hash) {
                    Ok(hash) => hash,
                    Err(e) => {
                        tracing::warn!(chunk_hash = %row.chunk_hash, error = %e, "Skipping malformed chunk row");
                        stats.errors += 1;
                        continue;
                    }
                };

                let _guard = self.locks.lock(&hash).await;
                match self.metadata.delete_if_unreferenced(&row.chunk_hash).await {
                    Ok(true) => {
                        progressed = true;
                        stats.chunks_deleted += 1;
                        stats.bytes_reclaimed += row.size_bytes.max(0) as u64;
                        match self.objects.delete(&hash.to_object_key()).await {
                            Ok(()) | Err(StorageError::NotFound(_)) => {}
                            Err(e) => {
                                tracing::warn!(
                                    chunk_hash = %row.chunk_hash,
                                    error = %e,
                                    "Failed to delete chunk blob (row already removed)"
                                );
                                stats.errors += 1;
                            }
                        }
                    }
                    // Referenced again since it was listed.
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(chunk_hash = %row.chunk_hash, error = %e, "Failed to delete chunk row");
                        stats.errors += 1;
                    }
                }
            }

            if !progressed {
                break;
            }
        }

        self.locks.prune();
        if stats.chunks_deleted > 0 {
            tracing::info!(
                chunks_deleted = stats.chunks_deleted,
                bytes_reclaimed = stats.bytes_reclaimed,
                "Swept unreferenced chunks"
            );
        }
        Ok(stats)
    }

    /// Delete blobs that have no chunk row.
    ///
    /// These are left behind when a blob delete fails after its row was
    /// removed, or when a write is interrupted between blob and row.
    #[instrument(skip(self))]
    pub async fn sweep_orphans(&self, dry_run: bool) -> Result<SweepStats> {
        let mut stats = SweepStats::default();
        let mut keys = self.objects.list_stream("chunks").await?;

        while let Some(key) = keys.next().await {
            let key = match key {
                Ok(key) => key,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to list chunk blob");
                    stats.errors += 1;
                    continue;
                }
            };
            let Some(hash) = key
                .rsplit('/')
                .next()
                .and_then(|name| ChunkHash::from_hex(name).ok())
            else {
                tracing::debug!(key = %key, "Ignoring non-chunk object");
                continue;
            };

            let _guard = self.locks.lock(&hash).await;
            if self.metadata.get_chunk(&hash.to_hex()).await?.is_some() {
                continue;
            }
            if dry_run {
                tracing::info!(key = %key, "DRY-RUN: Would delete orphaned chunk blob");
                stats.orphans_deleted += 1;
                continue;
            }
            let size = self.objects.head(&key).await.map(|m| m.size).unwrap_or(0);
            match self.objects.delete(&key).await {
                Ok(()) => {
                    tracing::info!(key = %key, "Deleted orphaned chunk blob");
                    stats.orphans_deleted += 1;
                    stats.bytes_reclaimed += size;
                }
                Err(StorageError::NotFound(_)) => {}
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Failed to delete orphaned chunk blob");
                    stats.errors += 1;
                }
            }
        }
        Ok(stats)
    }
}

fn position_i64(position: u64) -> Result<i64> {
    i64::try_from(position)
        .map_err(|_| Error::BadInput(format!("chunk index {position} is out of range")))
}
