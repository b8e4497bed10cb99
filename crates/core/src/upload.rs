//! Upload identifiers, the upload state machine, and the upload wire types.

use crate::manifest::ManifestState;
use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;
use uuid::Uuid;

/// Unique, unguessable identifier for an upload.
///
/// A random v4 UUID. Possession of it is the only authorization needed to
/// add chunks to, seal, or cancel the upload.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UploadId(Uuid);

impl UploadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::BadInput(format!("invalid upload id: {e}")))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UploadId({})", self.0)
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-side phase of an upload session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadPhase {
    Init,
    Receiving,
    Sealing,
    Done,
}

/// Events that drive an [`UploadPhase`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadEvent {
    Open,
    Chunk,
    Seal,
    SealCommitted,
}

impl UploadPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Receiving => "receiving",
            Self::Sealing => "sealing",
            Self::Done => "done",
        }
    }

    /// Apply `event`, returning the next phase or the error the caller must
    /// report.
    ///
    /// Chunks are only accepted while receiving; anything arriving during or
    /// after a seal is `SealedAlready`. Sealing a finished upload is a no-op.
    pub fn on(self, event: UploadEvent) -> crate::Result<Self> {
        use UploadEvent as E;
        use UploadPhase as P;
        match (self, event) {
            (P::Init, E::Open) => Ok(P::Receiving),
            (P::Receiving, E::Chunk) => Ok(P::Receiving),
            (P::Receiving, E::Seal) => Ok(P::Sealing),
            (P::Sealing, E::SealCommitted) => Ok(P::Done),
            (P::Sealing | P::Done, E::Chunk) => Err(crate::Error::SealedAlready),
            (P::Done, E::Seal) => Ok(P::Done),
            (P::Sealing, E::Seal) => Err(crate::Error::Transient(
                "seal already in progress".to_string(),
            )),
            (phase, event) => Err(crate::Error::BadInput(format!(
                "{event:?} is not valid while the upload is {}",
                phase.as_str()
            ))),
        }
    }

    /// Phase implied by a persisted manifest, used when a session is
    /// rehydrated after a restart.
    pub fn from_manifest_state(state: ManifestState) -> Option<Self> {
        match state {
            ManifestState::Open => Some(Self::Receiving),
            ManifestState::Sealed => Some(Self::Done),
            ManifestState::Expired => None,
        }
    }
}

/// `POST /upload/open` request body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OpenUploadRequest {
    pub filename: String,
    pub mime: String,
    pub total_size: u64,
}

/// `POST /upload/open` response body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenUploadResponse {
    pub upload_id: String,
    pub chunk_max: u64,
    pub chunks_expected: u64,
    /// How many chunk requests the client may have in flight for this upload.
    pub max_outstanding_chunks: u32,
}

/// Outcome of storing one chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    /// The chunk was appended to the manifest.
    Stored,
    /// An identical chunk was already committed at this index.
    Duplicate,
}

/// `POST /upload/{id}/chunk/{index}` response body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkAck {
    pub status: ChunkStatus,
    pub next_index: u64,
}

/// `GET /upload/{id}/status` response body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadStatus {
    pub state: UploadPhase,
    pub cursor: u64,
    pub bytes_received: u64,
}

/// `POST /upload/{id}/seal` response body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealResponse {
    pub share_code: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}
