//! Metadata store for ferry.
//!
//! Tracks which chunks exist, which upload positions reference them, and the
//! history of garbage collection runs. Chunk bytes and manifests live in the
//! object store; this crate only holds the bookkeeping that must be updated
//! transactionally.

pub mod error;
pub mod models;
pub mod repos;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use repos::{ChunkInsert, ChunkRepo, ChunkStats, GcRepo, GcRunState, RefOutcome};
pub use store::{MetadataStore, SqliteStore};

use ferry_core::config::MetadataConfig;
use std::sync::Arc;

/// Create a metadata store from configuration.
pub async fn from_config(config: &MetadataConfig) -> MetadataResult<Arc<dyn MetadataStore>> {
    let store = SqliteStore::new(&config.path, config.query_timeout_secs).await?;
    tracing::info!(path = %config.path.display(), "sqlite metadata store ready");
    Ok(Arc::new(store) as Arc<dyn MetadataStore>)
}
