//! Database models mapping to the metadata schema.

use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// One stored chunk blob.
#[derive(Debug, Clone, FromRow)]
pub struct ChunkRow {
    pub chunk_hash: String,
    pub size_bytes: i64,
    pub created_at: OffsetDateTime,
    pub last_accessed_at: Option<OffsetDateTime>,
}

/// A reference from position `position` of upload `upload_id` to a chunk.
///
/// A chunk's refcount is the number of reference rows naming it.
#[derive(Debug, Clone, FromRow)]
pub struct ChunkRefRow {
    pub chunk_hash: String,
    pub upload_id: Uuid,
    pub position: i64,
    pub created_at: OffsetDateTime,
}

/// Record of one garbage collection run.
#[derive(Debug, Clone, FromRow)]
pub struct GcRunRow {
    pub run_id: Uuid,
    pub state: String,
    pub dry_run: bool,
    pub started_at: OffsetDateTime,
    pub finished_at: Option<OffsetDateTime>,
    pub stats_json: Option<String>,
    pub error: Option<String>,
}
