//! Persistent manifest records.
//!
//! Each manifest is a JSON header at `manifests/<upload_id>.json`, rewritten
//! whole through the object store's atomic put. While an upload is open its
//! chunk list lives in an append-only journal at `manifests/<upload_id>.chunks`,
//! one `\n<index> <hash>` record per chunk, so committing a chunk writes a
//! constant amount no matter how many came before. Sealing folds the list into
//! the header and drops the journal. Mutations of one upload are serialized by
//! a per-upload lock.

use crate::locks::KeyedLocks;
use bytes::Bytes;
use ferry_core::{
    ChunkHash, ContentHash, Error, Manifest, ManifestState, Result, ShareCode, UploadId, deadline,
};
use ferry_storage::{ObjectStore, StorageError};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::instrument;

const MANIFEST_PREFIX: &str = "manifests";

pub struct ManifestStore {
    objects: Arc<dyn ObjectStore>,
    locks: KeyedLocks<UploadId>,
}

impl ManifestStore {
    pub fn new(objects: Arc<dyn ObjectStore>) -> Self {
        Self {
            objects,
            locks: KeyedLocks::new(),
        }
    }

    /// Persist a new manifest. Fails if one already exists for the upload.
    #[instrument(skip(self, manifest), fields(upload_id = %manifest.upload_id))]
    pub async fn create(&self, manifest: &Manifest) -> Result<()> {
        let _guard = self.locks.lock(&manifest.upload_id).await;
        let key = Manifest::object_key(&manifest.upload_id);
        let written = self
            .objects
            .put_if_not_exists(&key, Bytes::from(manifest.to_json()?))
            .await?;
        if !written {
            return Err(Error::Internal(format!(
                "manifest for upload {} already exists",
                manifest.upload_id
            )));
        }
        Ok(())
    }

    pub async fn load(&self, upload_id: &UploadId) -> Result<Manifest> {
        let mut manifest = match self.objects.get(&Manifest::object_key(upload_id)).await {
            Ok(data) => Manifest::from_json(&data)?,
            Err(StorageError::NotFound(_)) => {
                return Err(Error::NotFound(format!("upload {upload_id} not found")));
            }
            Err(e) => return Err(e.into()),
        };
        if manifest.state != ManifestState::Sealed {
            match self.objects.get(&journal_key(upload_id)).await {
                Ok(journal) => replay_journal(&mut manifest, &journal),
                Err(StorageError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(manifest)
    }

    /// Write the header. Unsealed headers leave the chunk list to the journal.
    async fn write_header(&self, manifest: &mut Manifest) -> Result<()> {
        let chunks = (manifest.state != ManifestState::Sealed)
            .then(|| std::mem::take(&mut manifest.chunks));
        let json = manifest.to_json();
        if let Some(chunks) = chunks {
            manifest.chunks = chunks;
        }
        self.objects
            .put(&Manifest::object_key(&manifest.upload_id), Bytes::from(json?))
            .await?;
        Ok(())
    }

    /// Load, mutate and persist one manifest under its lock.
    ///
    /// Nothing is written if `f` fails.
    async fn update<T>(
        &self,
        upload_id: &UploadId,
        f: impl FnOnce(&mut Manifest, OffsetDateTime) -> Result<T>,
    ) -> Result<(Manifest, T)> {
        let _guard = self.locks.lock(upload_id).await;
        let mut manifest = self.load(upload_id).await?;
        let now = OffsetDateTime::now_utc();
        let out = f(&mut manifest, now)?;
        manifest.updated_at = now;
        self.write_header(&mut manifest).await?;
        Ok((manifest, out))
    }

    /// Append `hash` at `index`, which must equal the current cursor.
    ///
    /// Extends the idle deadline to `now + idle_max`. The chunk counts as
    /// committed once its journal record is durable.
    #[instrument(skip(self, hash), fields(upload_id = %upload_id, chunk_index = index))]
    pub async fn append_chunk(
        &self,
        upload_id: &UploadId,
        index: u64,
        hash: ChunkHash,
        idle_max: Duration,
    ) -> Result<Manifest> {
        let _guard = self.locks.lock(upload_id).await;
        let mut manifest = self.load(upload_id).await?;
        require_open(&manifest)?;
        let expected = manifest.cursor();
        if index != expected {
            return Err(Error::BadSequence {
                expected,
                got: index,
            });
        }
        if index >= manifest.chunks_expected() {
            return Err(Error::BadInput(format!(
                "chunk index {index} is past the last chunk ({})",
                manifest.chunks_expected().saturating_sub(1)
            )));
        }

        let now = OffsetDateTime::now_utc();
        manifest.expires_at = deadline(now, idle_max)?;
        manifest.updated_at = now;
        self.write_header(&mut manifest).await?;

        let record = format!("\n{index} {}", hash.to_hex());
        self.objects
            .append(&journal_key(upload_id), Bytes::from(record))
            .await?;
        manifest.chunks.push(hash);
        Ok(manifest)
    }

    /// Move an OPEN manifest to SEALED, shareable until `expires_at`.
    ///
    /// Every chunk must be present and their lengths must add up to the
    /// declared size.
    #[instrument(skip(self, file_hash), fields(upload_id = %upload_id, share_code = %share_code))]
    pub async fn seal(
        &self,
        upload_id: &UploadId,
        share_code: ShareCode,
        file_hash: ContentHash,
        expires_at: OffsetDateTime,
    ) -> Result<Manifest> {
        let (manifest, ()) = self
            .update(upload_id, |m, now| {
                require_open(m)?;
                if !m.is_complete() {
                    return Err(Error::IncompleteUpload {
                        received: m.cursor(),
                        expected: m.chunks_expected(),
                    });
                }
                if m.bytes_received() != m.total_size {
                    return Err(Error::Internal(format!(
                        "upload {} holds {} bytes but declared {}",
                        m.upload_id,
                        m.bytes_received(),
                        m.total_size
                    )));
                }
                m.state = ManifestState::Sealed;
                m.sealed_at = Some(now);
                m.expires_at = expires_at;
                m.share_code = Some(share_code);
                m.file_hash = Some(file_hash);
                Ok(())
            })
            .await?;
        if let Err(e) = self.remove_journal(upload_id).await {
            // Harmless: sealed headers carry their own chunk list.
            tracing::warn!(error = %e, "Failed to remove chunk journal after seal");
        }
        Ok(manifest)
    }

    /// Mark a manifest EXPIRED. Expiring an expired manifest changes nothing.
    #[instrument(skip(self), fields(upload_id = %upload_id))]
    pub async fn expire(&self, upload_id: &UploadId, cancelled: bool) -> Result<Manifest> {
        let (manifest, ()) = self
            .update(upload_id, |m, _| {
                if m.state != ManifestState::Expired {
                    m.state = ManifestState::Expired;
                    m.cancelled = cancelled;
                }
                Ok(())
            })
            .await?;
        Ok(manifest)
    }

    /// Push an OPEN manifest's idle deadline to `now + idle_max`.
    pub async fn touch(&self, upload_id: &UploadId, idle_max: Duration) -> Result<Manifest> {
        let (manifest, ()) = self
            .update(upload_id, |m, now| {
                require_open(m)?;
                m.expires_at = deadline(now, idle_max)?;
                Ok(())
            })
            .await?;
        Ok(manifest)
    }

    /// Every upload with a manifest record.
    pub async fn list(&self) -> Result<Vec<UploadId>> {
        let keys = self.objects.list(MANIFEST_PREFIX).await?;
        Ok(keys
            .iter()
            .filter_map(|key| {
                let name = key.strip_prefix("manifests/")?.strip_suffix(".json")?;
                UploadId::parse(name).ok()
            })
            .collect())
    }

    /// Remove a manifest record. Returns whether one existed.
    #[instrument(skip(self), fields(upload_id = %upload_id))]
    pub async fn delete(&self, upload_id: &UploadId) -> Result<bool> {
        let _guard = self.locks.lock(upload_id).await;
        self.remove_journal(upload_id).await?;
        match self.objects.delete(&Manifest::object_key(upload_id)).await {
            Ok(()) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_journal(&self, upload_id: &UploadId) -> Result<()> {
        match self.objects.delete(&journal_key(upload_id)).await {
            Ok(()) | Err(StorageError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn prune_locks(&self) -> usize {
        self.locks.prune()
    }
}

fn journal_key(upload_id: &UploadId) -> String {
    format!("{MANIFEST_PREFIX}/{upload_id}.chunks")
}

/// Extend `manifest.chunks` from journal records.
///
/// Only a record for the next index is taken. A torn record left by a failed
/// append is skipped and the retry written after it is kept.
fn replay_journal(manifest: &mut Manifest, journal: &[u8]) {
    for line in journal.split(|b| *b == b'\n').filter(|l| !l.is_empty()) {
        let record = std::str::from_utf8(line).ok().and_then(|line| {
            let (index, hex) = line.split_once(' ')?;
            Some((index.parse::<u64>().ok()?, ChunkHash::from_hex(hex).ok()?))
        });
        match record {
            Some((index, hash))
                if index == manifest.cursor() && index < manifest.chunks_expected() =>
            {
                manifest.chunks.push(hash);
            }
            _ => tracing::debug!(
                upload_id = %manifest.upload_id,
                "Skipped chunk journal record"
            ),
        }
    }
}

fn require_open(manifest: &Manifest) -> Result<()> {
    match manifest.state {
        ManifestState::Open => Ok(()),
        ManifestState::Sealed => Err(Error::SealedAlready),
        ManifestState::Expired => Err(manifest.expired_error()),
    }
}
