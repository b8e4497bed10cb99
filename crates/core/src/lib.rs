//! Core domain types for ferry, a resumable, chunked file-transfer service.
//!
//! This crate defines the data model shared by every other crate:
//! - Content hashes and chunk identity
//! - The chunker and the fixed-size chunk layout
//! - Manifests and their lifecycle
//! - The upload state machine and wire types
//! - Share codes
//! - Byte ranges for resumable downloads
//! - The error taxonomy and configuration

pub mod chunk;
pub mod chunker;
pub mod config;
pub mod error;
pub mod hash;
pub mod manifest;
pub mod range;
pub mod share_code;
pub mod upload;

pub use chunk::{Chunk, ChunkHash, ChunkPlan};
pub use chunker::Chunker;
pub use error::{Error, ErrorBody, ErrorKind, Result};
pub use hash::{ContentHash, ContentHasher};
pub use manifest::{FileMeta, Manifest, ManifestState, deadline};
pub use range::ByteRange;
pub use share_code::{CodePolicy, ShareCode};
pub use upload::{
    ChunkAck, ChunkStatus, OpenUploadRequest, OpenUploadResponse, SealResponse, UploadEvent,
    UploadId, UploadPhase, UploadStatus,
};

/// Default chunk size: 1 MiB
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Maximum configurable chunk size: 16 MiB
pub const MAX_CHUNK_SIZE: u64 = 16 * 1024 * 1024;

/// Minimum configurable chunk size: 4 KiB
pub const MIN_CHUNK_SIZE: u64 = 4 * 1024;

/// Header carrying the hex SHA-256 of a chunk body.
pub const CHUNK_HASH_HEADER: &str = "x-chunk-hash";

/// Header carrying the request correlation id.
pub const TRACE_ID_HEADER: &str = "x-trace-id";
