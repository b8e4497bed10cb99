//! Blob storage for ferry.
//!
//! Chunks live under `chunks/<hh>/<hash>` and manifests under
//! `manifests/<upload_id>.json`. Every write is atomic, so a crash leaves
//! either the old or the new object in place.

pub mod backends;
pub mod error;
pub mod traits;

pub use backends::filesystem::FilesystemBackend;
pub use error::{StorageError, StorageResult};
pub use traits::{KeyStream, ObjectMeta, ObjectStore};

use ferry_core::config::StorageConfig;
use std::sync::Arc;

/// Create an object store from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn ObjectStore>> {
    let backend = FilesystemBackend::new(&config.path).await?;
    tracing::info!(root = %backend.root().display(), "filesystem storage ready");
    Ok(Arc::new(backend))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::tempdir;

    #[tokio::test]
    async fn from_config_filesystem_ok() {
        let temp = tempdir().unwrap();
        let config = StorageConfig {
            path: temp.path().join("store"),
        };

        let store = from_config(&config).await.unwrap();
        store
            .put("hello.txt", Bytes::from_static(b"hi"))
            .await
            .unwrap();
        assert!(store.exists("hello.txt").await.unwrap());
        assert_eq!(store.backend_name(), "filesystem");
        store.health_check().await.unwrap();
    }
}
