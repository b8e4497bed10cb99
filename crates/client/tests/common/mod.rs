//! Shared helpers for client tests.

#![allow(dead_code)] // each test file compiles common/ separately

use async_trait::async_trait;
use bytes::Bytes;
use ferry_client::{ClientError, DownloadBody, FerryClient, RetryPolicy, Transport};
use ferry_core::config::AppConfig;
use ferry_core::{
    ChunkAck, ChunkHash, OpenUploadRequest, OpenUploadResponse, SealResponse, UploadStatus,
};
use ferry_server::{AppState, create_router};
use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tempfile::TempDir;

/// Chunk size used by the live test server.
pub const TEST_CHUNK: usize = 4096;

pub fn can_bind_localhost() -> bool {
    TcpListener::bind("127.0.0.1:0").is_ok()
}

/// Deterministic pseudo-random bytes.
pub fn seeded_bytes(seed: u8, len: usize) -> Bytes {
    let mut state = u32::from(seed).wrapping_mul(2_654_435_761).wrapping_add(1);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state >> 24) as u8
        })
        .collect::<Vec<u8>>()
        .into()
}

/// Retry policy with millisecond backoff.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(10),
        ..RetryPolicy::default()
    }
}

/// A ferry server listening on an ephemeral localhost port.
pub struct LiveServer {
    pub base_url: String,
    pub state: AppState,
    _temp_dir: TempDir,
}

impl LiveServer {
    pub async fn start() -> Self {
        ferry_server::metrics::register_metrics();
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");

        let mut config = AppConfig::for_testing(temp_dir.path());
        config.transfer.chunk_max = TEST_CHUNK as u64;
        let state = AppState::from_config(config)
            .await
            .expect("Failed to create app state");

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind");
        let addr = listener.local_addr().expect("Failed to read address");
        let router = create_router(state.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        Self {
            base_url: format!("http://{addr}"),
            state,
            _temp_dir: temp_dir,
        }
    }

    pub fn client(&self) -> FerryClient {
        FerryClient::connect(&self.base_url)
            .expect("valid URL")
            .with_retry(fast_retry())
    }
}

/// Wraps a transport and fails every chunk put once `budget` puts have
/// gone through, as if the connection dropped mid-upload.
pub struct Interrupted {
    pub inner: Arc<dyn Transport>,
    pub budget: AtomicU64,
}

impl Interrupted {
    pub fn new(inner: Arc<dyn Transport>, budget: u64) -> Self {
        Self {
            inner,
            budget: AtomicU64::new(budget),
        }
    }
}

#[async_trait]
impl Transport for Interrupted {
    async fn open_upload(
        &self,
        request: &OpenUploadRequest,
    ) -> ferry_client::Result<OpenUploadResponse> {
        self.inner.open_upload(request).await
    }

    async fn put_chunk(
        &self,
        upload_id: &str,
        index: u64,
        hash: &ChunkHash,
        data: Bytes,
    ) -> ferry_client::Result<ChunkAck> {
        let left = self.budget.load(Ordering::SeqCst);
        if left == 0 {
            return Err(ClientError::Local(ferry_core::Error::BadInput(
                "connection dropped".into(),
            )));
        }
        self.budget.store(left - 1, Ordering::SeqCst);
        self.inner.put_chunk(upload_id, index, hash, data).await
    }

    async fn upload_status(&self, upload_id: &str) -> ferry_client::Result<UploadStatus> {
        self.inner.upload_status(upload_id).await
    }

    async fn seal_upload(&self, upload_id: &str) -> ferry_client::Result<SealResponse> {
        self.inner.seal_upload(upload_id).await
    }

    async fn cancel_upload(&self, upload_id: &str) -> ferry_client::Result<()> {
        self.inner.cancel_upload(upload_id).await
    }

    async fn download(
        &self,
        share_code: &str,
        offset: u64,
    ) -> ferry_client::Result<DownloadBody> {
        self.inner.download(share_code, offset).await
    }
}
