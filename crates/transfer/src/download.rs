//! Download by share code.

use crate::{ByteStream, Engine};
use ferry_core::{
    ByteRange, Chunk, ContentHash, Error, Manifest, ManifestState, Result, ShareCode, UploadId,
};
use time::OffsetDateTime;
use tracing::instrument;

/// A sealed upload resolved from its share code.
#[derive(Debug, Clone)]
pub struct Download {
    manifest: Manifest,
    code: ShareCode,
}

impl Download {
    pub fn upload_id(&self) -> UploadId {
        self.manifest.upload_id
    }

    pub fn share_code(&self) -> &ShareCode {
        &self.code
    }

    pub fn filename(&self) -> &str {
        &self.manifest.filename
    }

    pub fn mime_type(&self) -> &str {
        &self.manifest.mime_type
    }

    pub fn total_size(&self) -> u64 {
        self.manifest.total_size
    }

    pub fn file_hash(&self) -> Option<&ContentHash> {
        self.manifest.file_hash.as_ref()
    }

    pub fn expires_at(&self) -> OffsetDateTime {
        self.manifest.expires_at
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }
}

impl Engine {
    /// Resolve a share code to a sealed, unexpired upload.
    ///
    /// Codes are matched case-insensitively. A malformed code is reported as
    /// `NotFound`, the same as an unknown one.
    #[instrument(skip(self))]
    pub async fn open_download(&self, code: &str) -> Result<Download> {
        let code = ShareCode::parse(code)
            .map_err(|_| Error::NotFound(format!("share code {code:?} not found")))?;
        let entry = self
            .codes
            .lookup(&code)
            .await
            .ok_or_else(|| Error::NotFound(format!("share code {code} not found")))?;

        let now = OffsetDateTime::now_utc();
        if entry.is_expired_at(now) {
            return Err(Error::Expired(format!("share code {code} has expired")));
        }

        let manifest = self.manifests.load(&entry.upload_id).await?;
        if manifest.state == ManifestState::Open || manifest.share_code.as_ref() != Some(&code) {
            return Err(Error::NotFound(format!("share code {code} not found")));
        }
        if manifest.is_expired_at(now) {
            return Err(Error::Expired(format!("share code {code} has expired")));
        }
        Ok(Download { manifest, code })
    }

    /// Stream the bytes of `range` in order.
    ///
    /// Chunks read whole are verified against their hash before being sent;
    /// a missing or corrupt chunk ends the stream with an `Internal` error.
    pub fn read(&self, download: Download, range: ByteRange) -> ByteStream {
        let chunks = self.chunks.clone();
        let sessions = self.sessions.clone();

        Box::pin(async_stream::try_stream! {
            if !range.is_empty() {
                let manifest = download.manifest;
                let plan = manifest.plan();
                let first = plan.index_of(range.start);
                let last = plan.index_of(range.end - 1);
                let guard = sessions.begin_download(download.code, manifest.upload_id, first);

                for index in first..=last {
                    let hash = manifest.chunks.get(index as usize).ok_or_else(|| {
                        Error::Internal(format!(
                            "upload {} has no chunk {index}",
                            manifest.upload_id
                        ))
                    })?;
                    let (chunk_start, chunk_end) = manifest.chunk_span(index).ok_or_else(|| {
                        Error::Internal(format!("chunk {index} lies past the end of the file"))
                    })?;
                    let from = range.start.max(chunk_start) - chunk_start;
                    let to = range.end.min(chunk_end) - chunk_start;

                    let missing = |e: Error| match e {
                        Error::NotFound(_) => Error::Internal(format!(
                            "chunk {index} ({hash}) of upload {} is missing",
                            manifest.upload_id
                        )),
                        other => other,
                    };
                    let data = if from == 0 && to == chunk_end - chunk_start {
                        let data = chunks.get(hash).await.map_err(missing)?;
                        Chunk::verify(&data, hash).map_err(|_| {
                            Error::Internal(format!(
                                "chunk {index} ({hash}) of upload {} is corrupt",
                                manifest.upload_id
                            ))
                        })?;
                        data
                    } else {
                        chunks.get_range(hash, from, to).await.map_err(missing)?
                    };

                    guard.session().advance(index + 1);
                    yield data;
                }
            }
        })
    }
}
