//! The ferry transfer engine.
//!
//! [`Engine`] owns the chunk store, the manifest store, the share code
//! registry and the live sessions, and exposes the upload, download and
//! garbage collection operations on top of them. It is created once per
//! process with [`Engine::init`] and torn down with [`Engine::shutdown`].

pub mod chunk_store;
pub mod download;
pub mod gc;
pub mod locks;
pub mod manifest_store;
pub mod sessions;
pub mod share_codes;
pub mod upload;

pub use chunk_store::{ChunkStore, PutOutcome, SweepStats};
pub use download::Download;
pub use gc::GcStats;
pub use manifest_store::ManifestStore;
pub use sessions::{SessionInfo, SessionKind, SessionRegistry};
pub use share_codes::{CodeEntry, ShareCodeRegistry};
pub use upload::ChunkReceipt;

use bytes::Bytes;
use ferry_core::config::{AppConfig, GcConfig, TransferConfig};
use ferry_core::{Error, Result};
use ferry_metadata::MetadataStore;
use ferry_storage::ObjectStore;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A boxed stream of file bytes.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

pub struct Engine {
    transfer: TransferConfig,
    gc: GcConfig,
    objects: Arc<dyn ObjectStore>,
    metadata: Arc<dyn MetadataStore>,
    chunks: Arc<ChunkStore>,
    manifests: Arc<ManifestStore>,
    codes: Arc<ShareCodeRegistry>,
    sessions: Arc<SessionRegistry>,
    gc_running: Mutex<()>,
}

impl Engine {
    /// Build an engine over already-open stores.
    ///
    /// Fails collection runs a previous process left unfinished and replays
    /// the share code log.
    pub async fn init(
        config: &AppConfig,
        objects: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::BadInput(format!("invalid configuration: {e}")))?;

        let orphaned = metadata.fail_orphaned_gc_runs().await?;
        if orphaned > 0 {
            tracing::warn!(runs = orphaned, "Marked interrupted garbage collection runs as failed");
        }

        let codes = ShareCodeRegistry::open(
            config.share_codes.policy(),
            &config.share_codes.log_path,
        )
        .await?;

        Ok(Self {
            transfer: config.transfer.clone(),
            gc: config.gc.clone(),
            chunks: Arc::new(ChunkStore::new(
                objects.clone(),
                metadata.clone(),
                config.transfer.max_total_bytes,
            )),
            manifests: Arc::new(ManifestStore::new(objects.clone())),
            codes: Arc::new(codes),
            sessions: Arc::new(SessionRegistry::new()),
            objects,
            metadata,
            gc_running: Mutex::new(()),
        })
    }

    /// Open the configured stores and build an engine over them.
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let objects = ferry_storage::from_config(&config.storage).await?;
        let metadata = ferry_metadata::from_config(&config.metadata).await?;
        Self::init(config, objects, metadata).await
    }

    /// Cancel in-flight uploads and flush the share code log.
    pub async fn shutdown(&self) {
        self.sessions.cancel_all();
        if let Err(e) = self.codes.sync().await {
            tracing::warn!(error = %e, "Failed to flush share code log");
        }
        tracing::info!("Transfer engine stopped");
    }

    /// Check that both backing stores respond.
    pub async fn health_check(&self) -> Result<()> {
        self.objects.health_check().await?;
        self.metadata.health_check().await?;
        Ok(())
    }

    pub fn transfer_config(&self) -> &TransferConfig {
        &self.transfer
    }

    pub fn gc_config(&self) -> &GcConfig {
        &self.gc
    }

    pub fn chunks(&self) -> &ChunkStore {
        &self.chunks
    }

    pub fn manifests(&self) -> &ManifestStore {
        &self.manifests
    }

    pub fn codes(&self) -> &ShareCodeRegistry {
        &self.codes
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn metadata(&self) -> &dyn MetadataStore {
        self.metadata.as_ref()
    }
}
