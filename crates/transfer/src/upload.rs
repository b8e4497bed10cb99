//! Upload operations: open, chunk, status, seal, cancel.
//!
//! Chunk and seal calls for one upload run one at a time under the upload
//! session's lock. Lock order is session, then manifest, then chunk, and the
//! collector never takes a session lock it does not already find registered.

use crate::Engine;
use crate::chunk_store::PutOutcome;
use crate::sessions::{UploadSession, UploadState};
use bytes::Bytes;
use ferry_core::{
    Chunk, ChunkAck, ChunkHash, ChunkStatus, ContentHash, Error, FileMeta, Manifest,
    ManifestState, OpenUploadRequest, OpenUploadResponse, Result, SealResponse, UploadEvent,
    UploadId, UploadPhase, UploadStatus, deadline,
};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::MutexGuard;
use tracing::instrument;

/// Outcome of one chunk call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkReceipt {
    pub ack: ChunkAck,
    /// The chunk's bytes were already in the store (from this or another upload).
    pub deduplicated: bool,
}

impl Engine {
    #[instrument(skip(self, request), fields(filename = %request.filename, total_size = request.total_size))]
    pub async fn open_upload(&self, request: OpenUploadRequest) -> Result<OpenUploadResponse> {
        let meta = FileMeta {
            filename: request.filename,
            mime_type: request.mime,
            total_size: request.total_size,
        };
        meta.validate()?;

        if meta.total_size > self.transfer.max_upload_bytes {
            return Err(Error::QuotaExceeded(format!(
                "file of {} bytes exceeds the {} byte upload limit",
                meta.total_size, self.transfer.max_upload_bytes
            )));
        }
        if let Some(limit) = self.transfer.max_total_bytes {
            let stored = self.chunks.stats().await?.total_size;
            if stored.saturating_add(meta.total_size) > limit {
                return Err(Error::QuotaExceeded(format!(
                    "store holds {stored} of {limit} bytes; a {} byte file does not fit",
                    meta.total_size
                )));
            }
        }

        let upload_id = UploadId::new();
        let manifest = Manifest::new(
            upload_id,
            meta,
            self.transfer.chunk_max,
            self.transfer.session_idle(),
        )?;
        self.manifests.create(&manifest).await?;
        let phase = UploadPhase::Init.on(UploadEvent::Open)?;
        self.sessions.insert_upload(upload_id, phase, 0, false);

        tracing::info!(
            upload_id = %upload_id,
            chunks_expected = manifest.chunks_expected(),
            "Upload opened"
        );
        Ok(OpenUploadResponse {
            upload_id: upload_id.to_string(),
            chunk_max: manifest.chunk_size,
            chunks_expected: manifest.chunks_expected(),
            max_outstanding_chunks: self.transfer.max_outstanding_chunks,
        })
    }

    /// Store chunk `index` of an upload.
    ///
    /// `index` must equal the cursor. Re-sending an already committed chunk
    /// with the same hash is acknowledged as a duplicate and changes nothing.
    #[instrument(skip(self, claimed, data), fields(upload_id = %upload_id, chunk_index = index, size = data.len()))]
    pub async fn put_chunk(
        &self,
        upload_id: &UploadId,
        index: u64,
        claimed: &ChunkHash,
        data: Bytes,
    ) -> Result<ChunkReceipt> {
        let session = self.upload_session(upload_id).await?;
        let mut state = self.lock_session(&session).await?;

        let manifest = self.manifests.load(upload_id).await?;
        self.require_receiving(&manifest)?;
        state.phase.on(UploadEvent::Chunk)?;
        if session.is_cancelled() {
            return Err(self.interrupted(upload_id).await);
        }

        let cursor = manifest.cursor();
        if index < cursor {
            let committed = manifest.chunks.get(index as usize);
            if committed != Some(claimed) {
                return Err(Error::BadSequence {
                    expected: cursor,
                    got: index,
                });
            }
            Chunk::verify(&data, claimed)?;
            self.manifests
                .touch(upload_id, self.transfer.session_idle())
                .await?;
            session.touch();
            tracing::debug!("Duplicate chunk acknowledged");
            return Ok(ChunkReceipt {
                ack: ChunkAck {
                    status: ChunkStatus::Duplicate,
                    next_index: cursor,
                },
                deduplicated: true,
            });
        }
        if index > cursor {
            return Err(Error::BadSequence {
                expected: cursor,
                got: index,
            });
        }

        let expected_len = manifest.plan().expected_len(index).ok_or_else(|| {
            Error::BadInput(format!(
                "chunk index {index} is past the last chunk of a {}-chunk upload",
                manifest.chunks_expected()
            ))
        })?;
        let len = data.len() as u64;
        if len != expected_len {
            return Err(Error::BadInput(format!(
                "chunk {index} must be {expected_len} bytes, got {len}"
            )));
        }
        if manifest.bytes_received().saturating_add(len) > self.transfer.max_upload_bytes {
            return Err(Error::QuotaExceeded(format!(
                "upload would exceed {} bytes",
                self.transfer.max_upload_bytes
            )));
        }

        if state.stale_refs {
            let dropped = self.chunks.unref_from(upload_id, cursor).await?;
            if dropped > 0 {
                tracing::warn!(dropped, "Dropped references past the manifest cursor");
            }
            state.stale_refs = false;
        }

        let outcome = self
            .chunks
            .put_and_ref(claimed, data, upload_id, index)
            .await?;

        if session.is_cancelled() {
            self.rollback_ref(&mut state, claimed, upload_id, index).await;
            return Err(self.interrupted(upload_id).await);
        }
        if let Err(e) = self
            .manifests
            .append_chunk(upload_id, index, *claimed, self.transfer.session_idle())
            .await
        {
            match self.manifests.load(upload_id).await {
                // The journal record landed even though the append failed.
                Ok(m) if m.chunks.get(index as usize) == Some(claimed) => {
                    session.advance(&mut state, index + 1);
                }
                Ok(_) => self.rollback_ref(&mut state, claimed, upload_id, index).await,
                Err(_) => state.stale_refs = true,
            }
            return Err(e);
        }

        session.advance(&mut state, index + 1);
        tracing::debug!(outcome = ?outcome, "Chunk committed");
        Ok(ChunkReceipt {
            ack: ChunkAck {
                status: ChunkStatus::Stored,
                next_index: index + 1,
            },
            deduplicated: outcome == PutOutcome::Existed,
        })
    }

    /// Where an upload stands.
    pub async fn upload_status(&self, upload_id: &UploadId) -> Result<UploadStatus> {
        let manifest = self.manifests.load(upload_id).await?;
        if manifest.state == ManifestState::Expired
            || (manifest.state == ManifestState::Open
                && manifest.expires_at < OffsetDateTime::now_utc())
        {
            return Err(Error::Expired(format!("upload {upload_id} has expired")));
        }

        let phase = match (manifest.state, self.sessions.upload(upload_id)) {
            (ManifestState::Open, Some(session)) => session.phase(),
            (state, _) => UploadPhase::from_manifest_state(state).unwrap_or(UploadPhase::Done),
        };
        Ok(UploadStatus {
            state: phase,
            cursor: manifest.cursor(),
            bytes_received: manifest.bytes_received(),
        })
    }

    /// Seal a complete upload and hand out its share code.
    ///
    /// Sealing an already sealed upload returns the original code.
    #[instrument(skip(self), fields(upload_id = %upload_id))]
    pub async fn seal_upload(&self, upload_id: &UploadId) -> Result<SealResponse> {
        let session = self.upload_session(upload_id).await?;
        let mut state = self.lock_session(&session).await?;

        let manifest = self.manifests.load(upload_id).await?;
        if manifest.state == ManifestState::Sealed {
            return sealed_response(&manifest);
        }
        self.require_receiving(&manifest)?;
        if session.is_cancelled() {
            return Err(self.interrupted(upload_id).await);
        }

        let sealing = state.phase.on(UploadEvent::Seal)?;
        session.set_phase(&mut state, sealing);
        match self.commit_seal(&session, &manifest).await {
            Ok(response) => {
                let done = sealing.on(UploadEvent::SealCommitted)?;
                session.set_phase(&mut state, done);
                drop(state);
                // Sealed uploads are never tracked.
                self.sessions.remove_upload(upload_id);
                tracing::info!(share_code = %response.share_code, "Upload sealed");
                Ok(response)
            }
            Err(e) => {
                session.set_phase(&mut state, UploadPhase::Receiving);
                Err(e)
            }
        }
    }

    async fn commit_seal(
        &self,
        session: &UploadSession,
        manifest: &Manifest,
    ) -> Result<SealResponse> {
        if !manifest.is_complete() {
            return Err(Error::IncompleteUpload {
                received: manifest.cursor(),
                expected: manifest.chunks_expected(),
            });
        }

        let file_hash = self.rehash(manifest).await?;
        if session.is_cancelled() {
            return Err(self.interrupted(&manifest.upload_id).await);
        }

        let expires_at = deadline(OffsetDateTime::now_utc(), self.transfer.share_ttl())?;
        let code = self.codes.assign(manifest.upload_id, expires_at).await?;
        match self
            .manifests
            .seal(&manifest.upload_id, code.clone(), file_hash, expires_at)
            .await
        {
            Ok(sealed) => sealed_response(&sealed),
            Err(e) => {
                if let Err(release_err) = self.codes.release_for(&code, &manifest.upload_id).await
                {
                    tracing::warn!(
                        share_code = %code,
                        error = %release_err,
                        "Failed to release share code after seal error"
                    );
                }
                Err(e)
            }
        }
    }

    /// Hash the stored chunks in order, checking each against the manifest.
    async fn rehash(&self, manifest: &Manifest) -> Result<ContentHash> {
        let mut hasher = ContentHash::hasher();
        for (index, hash) in manifest.chunks.iter().enumerate() {
            let data = self.chunks.get(hash).await.map_err(|e| match e {
                Error::NotFound(_) => Error::Internal(format!(
                    "chunk {index} ({hash}) of upload {} is missing",
                    manifest.upload_id
                )),
                other => other,
            })?;
            Chunk::verify(&data, hash).map_err(|_| {
                Error::Internal(format!(
                    "chunk {index} ({hash}) of upload {} is corrupt",
                    manifest.upload_id
                ))
            })?;
            hasher.update(&data);
        }
        Ok(hasher.finalize())
    }

    /// Cancel an open upload. Chunks in flight fail with `Cancelled`; the
    /// collector releases its chunks on its next run.
    #[instrument(skip(self), fields(upload_id = %upload_id))]
    pub async fn cancel_upload(&self, upload_id: &UploadId) -> Result<()> {
        let manifest = self.manifests.load(upload_id).await?;
        match manifest.state {
            ManifestState::Sealed => return Err(Error::SealedAlready),
            ManifestState::Expired => return Ok(()),
            ManifestState::Open => {}
        }

        let session = self.upload_session(upload_id).await?;
        session.cancel_token().cancel();
        let state = session.lock().await;

        let manifest = self.manifests.load(upload_id).await?;
        if manifest.state == ManifestState::Sealed {
            return Err(Error::SealedAlready);
        }
        self.manifests.expire(upload_id, true).await?;
        drop(state);
        self.sessions.remove_upload(upload_id);
        tracing::info!("Upload cancelled");
        Ok(())
    }

    /// Expire an OPEN upload whose idle deadline passed before `now`.
    ///
    /// Returns the expired manifest, or `None` if the upload saw activity (or
    /// changed state) in the meantime.
    pub(crate) async fn expire_idle_upload(
        &self,
        upload_id: &UploadId,
        now: OffsetDateTime,
    ) -> Result<Option<Manifest>> {
        let session = self.sessions.upload(upload_id);
        let state = match &session {
            Some(session) => Some(session.lock().await),
            None => None,
        };

        let manifest = self.manifests.load(upload_id).await?;
        if manifest.state != ManifestState::Open || manifest.expires_at >= now {
            return Ok(None);
        }
        let expired = self.manifests.expire(upload_id, false).await?;
        if let Some(session) = &session {
            session.cancel_token().cancel();
        }
        drop(state);
        self.sessions.remove_upload(upload_id);
        tracing::info!(upload_id = %upload_id, "Idle upload expired");
        Ok(Some(expired))
    }

    /// The live session for `upload_id`, rebuilt from its manifest if needed.
    async fn upload_session(&self, upload_id: &UploadId) -> Result<Arc<UploadSession>> {
        if let Some(session) = self.sessions.upload(upload_id) {
            return Ok(session);
        }
        let manifest = self.manifests.load(upload_id).await?;
        let Some(phase) = UploadPhase::from_manifest_state(manifest.state) else {
            return Err(manifest.expired_error());
        };
        if phase == UploadPhase::Done {
            return Ok(self
                .sessions
                .detached_upload(*upload_id, phase, manifest.cursor()));
        }
        tracing::debug!(upload_id = %upload_id, cursor = manifest.cursor(), "Upload session rebuilt from manifest");
        Ok(self.sessions.insert_upload(
            *upload_id,
            phase,
            manifest.cursor(),
            phase == UploadPhase::Receiving,
        ))
    }

    /// Wait for the session lock unless the upload is cancelled first.
    async fn lock_session<'a>(
        &self,
        session: &'a UploadSession,
    ) -> Result<MutexGuard<'a, UploadState>> {
        tokio::select! {
            state = session.lock() => Ok(state),
            () = session.cancel_token().cancelled() => {
                Err(self.interrupted(&session.upload_id()).await)
            }
        }
    }

    fn require_receiving(&self, manifest: &Manifest) -> Result<()> {
        match manifest.state {
            ManifestState::Open => {}
            ManifestState::Sealed => return Err(Error::SealedAlready),
            ManifestState::Expired => {
                self.sessions.remove_upload(&manifest.upload_id);
                return Err(manifest.expired_error());
            }
        }
        if manifest.expires_at < OffsetDateTime::now_utc() {
            return Err(Error::Expired(format!(
                "upload {} has been idle too long",
                manifest.upload_id
            )));
        }
        Ok(())
    }

    /// The error for a call cut short by a cancelled session token.
    async fn interrupted(&self, upload_id: &UploadId) -> Error {
        if self.sessions.is_shutting_down() {
            return Error::Transient("server is shutting down".to_string());
        }
        match self.manifests.load(upload_id).await {
            Ok(m) if m.state == ManifestState::Sealed => Error::SealedAlready,
            Ok(m) if m.state == ManifestState::Expired => m.expired_error(),
            _ => Error::Cancelled(format!("upload {upload_id} was cancelled")),
        }
    }

    async fn rollback_ref(
        &self,
        state: &mut UploadState,
        hash: &ChunkHash,
        upload_id: &UploadId,
        index: u64,
    ) {
        if let Err(e) = self.chunks.unref_at(hash, upload_id, index).await {
            tracing::warn!(chunk_index = index, error = %e, "Failed to roll back chunk reference");
            state.stale_refs = true;
        }
    }
}

fn sealed_response(manifest: &Manifest) -> Result<SealResponse> {
    let share_code = manifest.share_code.as_ref().ok_or_else(|| {
        Error::Internal(format!(
            "sealed upload {} has no share code",
            manifest.upload_id
        ))
    })?;
    Ok(SealResponse {
        share_code: share_code.to_string(),
        expires_at: manifest.expires_at,
    })
}
