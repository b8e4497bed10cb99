//! Garbage collection.
//!
//! A run expires idle uploads and lapsed shares, releases the chunk
//! references of every expired upload, sweeps unreferenced chunks, releases
//! dead share codes and finally deletes expired manifests older than the
//! retention window. Only one run may be active; the in-process mutex and the
//! metadata store's running-run row both act as the lock.

use crate::Engine;
use ferry_core::{Error, Manifest, ManifestState, Result, UploadId, deadline};
use ferry_metadata::{GcRunState, MetadataError};
use serde::Serialize;
use std::collections::BTreeSet;
use time::OffsetDateTime;
use tracing::instrument;
use uuid::Uuid;

/// What one run did (or, for a dry run, would have done).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcStats {
    pub dry_run: bool,
    pub manifests_scanned: u64,
    /// OPEN uploads expired for inactivity.
    pub uploads_expired: u64,
    /// SEALED uploads whose share lifetime ended.
    pub shares_expired: u64,
    /// Idle in-memory sessions forgotten.
    pub sessions_dropped: u64,
    pub refs_released: u64,
    pub chunks_deleted: u64,
    pub orphans_deleted: u64,
    pub bytes_reclaimed: u64,
    pub codes_released: u64,
    pub manifests_deleted: u64,
    pub errors: u64,
}

impl Engine {
    /// Run one collection pass.
    ///
    /// Returns `None` without doing anything if another pass is already
    /// running, in this process or in another one sharing the metadata store.
    #[instrument(skip(self))]
    pub async fn run_gc(&self, dry_run: bool) -> Result<Option<GcStats>> {
        let Ok(_running) = self.gc_running.try_lock() else {
            tracing::debug!("Garbage collection already running in this process");
            return Ok(None);
        };

        let run_id = Uuid::new_v4();
        match self.metadata.begin_gc_run(run_id, dry_run).await {
            Ok(()) => {}
            Err(MetadataError::Constraint(msg)) => {
                tracing::debug!(reason = %msg, "Garbage collection already running");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }
        tracing::info!(run_id = %run_id, dry_run, "Garbage collection started");

        let result = self.collect(dry_run).await;
        let finished = match &result {
            Ok(stats) => {
                let stats_json = serde_json::to_string(stats).ok();
                self.metadata
                    .finish_gc_run(run_id, GcRunState::Finished, stats_json.as_deref(), None)
                    .await
            }
            Err(e) => {
                let message = e.to_string();
                self.metadata
                    .finish_gc_run(run_id, GcRunState::Failed, None, Some(&message))
                    .await
            }
        };
        if let Err(e) = finished {
            tracing::warn!(run_id = %run_id, error = %e, "Failed to record garbage collection result");
        }

        match &result {
            Ok(stats) => tracing::info!(
                run_id = %run_id,
                dry_run,
                uploads_expired = stats.uploads_expired,
                shares_expired = stats.shares_expired,
                refs_released = stats.refs_released,
                chunks_deleted = stats.chunks_deleted,
                bytes_reclaimed = stats.bytes_reclaimed,
                codes_released = stats.codes_released,
                manifests_deleted = stats.manifests_deleted,
                errors = stats.errors,
                "Garbage collection finished"
            ),
            Err(e) => tracing::error!(run_id = %run_id, error = %e, "Garbage collection failed"),
        }
        result.map(Some)
    }

    async fn collect(&self, dry_run: bool) -> Result<GcStats> {
        let mut stats = GcStats {
            dry_run,
            ..GcStats::default()
        };
        let now = OffsetDateTime::now_utc();

        if !dry_run {
            stats.sessions_dropped =
                self.sessions.drop_idle(now - self.transfer.session_idle()) as u64;
        }

        // Expire what is due and gather every expired manifest.
        let mut expired: Vec<Manifest> = Vec::new();
        for upload_id in self.manifests.list().await? {
            stats.manifests_scanned += 1;
            let manifest = match self.manifests.load(&upload_id).await {
                Ok(m) => m,
                Err(Error::NotFound(_)) => continue,
                Err(e) => {
                    tracing::warn!(upload_id = %upload_id, error = %e, "Failed to load manifest");
                    stats.errors += 1;
                    continue;
                }
            };

            match manifest.state {
                ManifestState::Expired => expired.push(manifest),
                ManifestState::Open if manifest.expires_at < now => {
                    stats.uploads_expired += 1;
                    if dry_run {
                        expired.push(manifest);
                        continue;
                    }
                    match self.expire_idle_upload(&upload_id, now).await {
                        Ok(Some(m)) => expired.push(m),
                        // Saw activity after it was listed.
                        Ok(None) => stats.uploads_expired -= 1,
                        Err(e) => {
                            tracing::warn!(upload_id = %upload_id, error = %e, "Failed to expire idle upload");
                            stats.errors += 1;
                        }
                    }
                }
                ManifestState::Sealed if manifest.expires_at < now => {
                    stats.shares_expired += 1;
                    if dry_run {
                        expired.push(manifest);
                        continue;
                    }
                    match self.manifests.expire(&upload_id, false).await {
                        Ok(m) => {
                            self.sessions.remove_upload(&upload_id);
                            expired.push(m);
                        }
                        Err(e) => {
                            tracing::warn!(upload_id = %upload_id, error = %e, "Failed to expire share");
                            stats.errors += 1;
                        }
                    }
                }
                _ => {}
            }
        }

        // Release references held by expired uploads.
        let mut released: Vec<&Manifest> = Vec::new();
        for manifest in &expired {
            match self.release_refs(manifest, dry_run).await {
                Ok(n) => {
                    stats.refs_released += n;
                    released.push(manifest);
                }
                Err(e) => {
                    tracing::warn!(upload_id = %manifest.upload_id, error = %e, "Failed to release chunk references");
                    stats.errors += 1;
                }
            }
        }

        let swept = self.chunks.sweep(dry_run).await?;
        let orphans = self.chunks.sweep_orphans(dry_run).await?;
        stats.chunks_deleted = swept.chunks_deleted;
        stats.orphans_deleted = orphans.orphans_deleted;
        stats.bytes_reclaimed = swept.bytes_reclaimed + orphans.bytes_reclaimed;
        stats.errors += swept.errors + orphans.errors;

        stats.codes_released = self.release_dead_codes(now, dry_run, &mut stats.errors).await?;

        // Expired manifests outlive their expiry by the retention window.
        let retention = self.gc.retention();
        for manifest in released {
            match deadline(manifest.updated_at, retention) {
                Ok(delete_after) if delete_after >= now => continue,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(upload_id = %manifest.upload_id, error = %e, "Retention window out of range");
                    stats.errors += 1;
                    continue;
                }
            }
            if dry_run {
                stats.manifests_deleted += 1;
                continue;
            }
            match self.manifests.delete(&manifest.upload_id).await {
                Ok(true) => stats.manifests_deleted += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(upload_id = %manifest.upload_id, error = %e, "Failed to delete manifest");
                    stats.errors += 1;
                }
            }
        }

        self.manifests.prune_locks();
        Ok(stats)
    }

    /// Drop every reference an expired upload holds. Returns how many.
    async fn release_refs(&self, manifest: &Manifest, dry_run: bool) -> Result<u64> {
        let hashes: BTreeSet<_> = manifest.chunks.iter().collect();
        let mut released = 0;
        for hash in hashes {
            released += if dry_run {
                self.chunks
                    .refcount_for_upload(hash, &manifest.upload_id)
                    .await?
            } else {
                self.chunks.decref(hash, &manifest.upload_id).await?
            };
        }
        if !dry_run {
            // References written past the cursor by an interrupted chunk.
            released += self
                .chunks
                .unref_from(&manifest.upload_id, manifest.cursor())
                .await?;
        }
        Ok(released)
    }

    /// Release codes that lapsed or whose upload is expired or gone.
    async fn release_dead_codes(
        &self,
        now: OffsetDateTime,
        dry_run: bool,
        errors: &mut u64,
    ) -> Result<u64> {
        let mut released = 0;
        if dry_run {
            for (code, entry) in self.codes.entries().await {
                if entry.is_expired_at(now) || self.upload_is_dead(&entry.upload_id).await {
                    tracing::debug!(share_code = %code, "Would release share code");
                    released += 1;
                }
            }
            return Ok(released);
        }

        released += self.codes.release_expired(now).await?.len() as u64;
        for (code, entry) in self.codes.entries().await {
            if !self.upload_is_dead(&entry.upload_id).await {
                continue;
            }
            match self.codes.release_for(&code, &entry.upload_id).await {
                Ok(true) => released += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(share_code = %code, error = %e, "Failed to release share code");
                    *errors += 1;
                }
            }
        }
        Ok(released)
    }

    /// Whether an upload's manifest is gone or EXPIRED. OPEN uploads are
    /// never dead here: a seal may be about to commit their code.
    async fn upload_is_dead(&self, upload_id: &UploadId) -> bool {
        match self.manifests.load(upload_id).await {
            Ok(m) => m.state == ManifestState::Expired,
            Err(Error::NotFound(_)) => true,
            Err(_) => false,
        }
    }
}
