//! The manifest: ordered chunk hashes plus file metadata for one upload.

use crate::chunk::{ChunkHash, ChunkPlan};
use crate::hash::ContentHash;
use crate::share_code::ShareCode;
use crate::upload::UploadId;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

/// Lifecycle state of a manifest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestState {
    /// Accepting chunks.
    Open,
    /// Immutable and downloadable through its share code.
    Sealed,
    /// Cancelled, idle too long, or past its share window. Awaiting collection.
    Expired,
}

impl ManifestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Sealed => "sealed",
            Self::Expired => "expired",
        }
    }
}

/// Client-supplied description of the file being uploaded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub filename: String,
    pub mime_type: String,
    pub total_size: u64,
}

impl FileMeta {
    /// Reject metadata that cannot be carried safely into a response header.
    pub fn validate(&self) -> crate::Result<()> {
        if self.filename.trim().is_empty() {
            return Err(crate::Error::BadInput("filename must not be empty".into()));
        }
        if self.filename.len() > 255 {
            return Err(crate::Error::BadInput(
                "filename must be at most 255 bytes".into(),
            ));
        }
        if self
            .filename
            .chars()
            .any(|c| c.is_control() || c == '/' || c == '\\' || c == '"')
        {
            return Err(crate::Error::BadInput(format!(
                "filename contains forbidden characters: {:?}",
                self.filename
            )));
        }
        if !is_valid_mime(&self.mime_type) {
            return Err(crate::Error::BadInput(format!(
                "invalid mime type: {:?}",
                self.mime_type
            )));
        }
        Ok(())
    }
}

fn is_valid_mime(mime: &str) -> bool {
    let Some((kind, sub)) = mime.split_once('/') else {
        return false;
    };
    let token = |s: &str| {
        !s.is_empty()
            && s.chars()
                .all(|c| c.is_ascii_alphanumeric() || "!#$&^_.+-;= ".contains(c))
    };
    token(kind) && token(sub) && !kind.contains(' ')
}

/// Persisted record of an upload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Manifest {
    pub upload_id: UploadId,
    pub filename: String,
    pub mime_type: String,
    pub total_size: u64,
    /// Size of every chunk except possibly the last.
    pub chunk_size: u64,
    /// Ordered chunk hashes; position is the chunk index.
    pub chunks: Vec<ChunkHash>,
    pub state: ManifestState,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub sealed_at: Option<OffsetDateTime>,
    /// OPEN: idle deadline. SEALED: end of the share window.
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    #[serde(default)]
    pub share_code: Option<ShareCode>,
    /// Hash of the whole file, recorded at seal.
    #[serde(default)]
    pub file_hash: Option<ContentHash>,
    /// Set when the upload was expired by an explicit cancel.
    #[serde(default)]
    pub cancelled: bool,
}

impl Manifest {
    /// A fresh OPEN manifest that expires if idle for `idle_max`.
    pub fn new(
        upload_id: UploadId,
        meta: FileMeta,
        chunk_size: u64,
        idle_max: Duration,
    ) -> crate::Result<Self> {
        ChunkPlan::new(meta.total_size, chunk_size)?;
        let now = OffsetDateTime::now_utc();
        Ok(Self {
            upload_id,
            filename: meta.filename,
            mime_type: meta.mime_type,
            total_size: meta.total_size,
            chunk_size,
            chunks: Vec::new(),
            state: ManifestState::Open,
            created_at: now,
            updated_at: now,
            sealed_at: None,
            expires_at: deadline(now, idle_max)?,
            share_code: None,
            file_hash: None,
            cancelled: false,
        })
    }

    /// Object store key for the manifest record of `upload_id`.
    pub fn object_key(upload_id: &UploadId) -> String {
        format!("manifests/{upload_id}.json")
    }

    pub fn plan(&self) -> ChunkPlan {
        // chunk_size is validated non-zero at construction
        ChunkPlan {
            total_size: self.total_size,
            chunk_size: self.chunk_size.max(1),
        }
    }

    pub fn chunks_expected(&self) -> u64 {
        self.plan().chunk_count()
    }

    /// Next chunk index the upload expects.
    pub fn cursor(&self) -> u64 {
        self.chunks.len() as u64
    }

    /// Bytes committed so far.
    pub fn bytes_received(&self) -> u64 {
        self.plan().offset(self.cursor())
    }

    pub fn is_complete(&self) -> bool {
        self.cursor() == self.chunks_expected()
    }

    /// Byte span `[start, end)` of chunk `index` within the file.
    pub fn chunk_span(&self, index: u64) -> Option<(u64, u64)> {
        let plan = self.plan();
        let len = plan.expected_len(index)?;
        let start = plan.offset(index);
        Some((start, start + len))
    }

    /// The error a chunk or seal request against an expired manifest reports.
    pub fn expired_error(&self) -> crate::Error {
        if self.cancelled {
            crate::Error::Cancelled(format!("upload {} was cancelled", self.upload_id))
        } else {
            crate::Error::Expired(format!("upload {} has expired", self.upload_id))
        }
    }

    /// Whether the manifest should be treated as expired at `now`.
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.state == ManifestState::Expired || self.expires_at < now
    }

    pub fn to_json(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(data: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// `from + window`, or `Internal` when the result is not a representable time.
pub fn deadline(from: OffsetDateTime, window: Duration) -> crate::Result<OffsetDateTime> {
    from.checked_add(window).ok_or_else(|| {
        crate::Error::Internal(format!("{window} after {from} is out of range"))
    })
}
