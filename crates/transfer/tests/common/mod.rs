//! Shared helpers for transfer engine tests.
//! Note: #[allow(dead_code)] because each test file compiles common/ separately.

#![allow(dead_code)]

use bytes::Bytes;
use ferry_core::config::AppConfig;
use ferry_core::{ChunkHash, OpenUploadRequest, SealResponse, UploadId};
use ferry_transfer::Engine;
use futures::TryStreamExt;
use std::sync::Arc;
use tempfile::TempDir;

/// Smallest chunk size the configuration accepts; keeps tests fast.
pub const CHUNK: u64 = 4096;

/// An engine over a temporary directory, removed on drop.
pub struct TestEngine {
    pub engine: Arc<Engine>,
    pub config: AppConfig,
    pub dir: TempDir,
}

impl TestEngine {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Build an engine after adjusting the test configuration.
    pub async fn with_config(adjust: impl FnOnce(&mut AppConfig)) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp directory");
        let mut config = AppConfig::for_testing(dir.path());
        config.transfer.chunk_max = CHUNK;
        adjust(&mut config);
        let engine = Engine::from_config(&config)
            .await
            .expect("Failed to build engine");
        Self {
            engine: Arc::new(engine),
            config,
            dir,
        }
    }

    /// A second engine over the same directory, as after a restart.
    pub async fn restart(&self) -> Arc<Engine> {
        Arc::new(
            Engine::from_config(&self.config)
                .await
                .expect("Failed to rebuild engine"),
        )
    }
}

/// Deterministic pseudo-random bytes.
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;
    for chunk in data.chunks_mut(8) {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }
    Bytes::from(data)
}

pub fn split_into_chunks(data: &[u8], chunk_size: u64) -> Vec<Bytes> {
    data.chunks(chunk_size as usize)
        .map(Bytes::copy_from_slice)
        .collect()
}

pub async fn open(engine: &Engine, name: &str, total_size: u64) -> UploadId {
    let response = engine
        .open_upload(OpenUploadRequest {
            filename: name.to_string(),
            mime: "application/octet-stream".to_string(),
            total_size,
        })
        .await
        .expect("open_upload failed");
    UploadId::parse(&response.upload_id).expect("bad upload id")
}

/// Send chunks `range` of `data`.
pub async fn send_chunks(
    engine: &Engine,
    upload_id: &UploadId,
    data: &[u8],
    chunk_size: u64,
    range: std::ops::Range<usize>,
) {
    let chunks = split_into_chunks(data, chunk_size);
    for index in range {
        let chunk = chunks[index].clone();
        engine
            .put_chunk(upload_id, index as u64, &ChunkHash::compute(&chunk), chunk)
            .await
            .unwrap_or_else(|e| panic!("chunk {index} failed: {e}"));
    }
}

/// Open, send every chunk and seal.
pub async fn upload(engine: &Engine, name: &str, data: &[u8]) -> (UploadId, SealResponse) {
    let chunk_size = engine.transfer_config().chunk_max;
    let upload_id = open(engine, name, data.len() as u64).await;
    let count = split_into_chunks(data, chunk_size).len();
    send_chunks(engine, &upload_id, data, chunk_size, 0..count).await;
    let sealed = engine.seal_upload(&upload_id).await.expect("seal failed");
    (upload_id, sealed)
}

/// Download the whole file behind `code`.
pub async fn download_all(engine: &Engine, code: &str) -> ferry_core::Result<Vec<u8>> {
    let download = engine.open_download(code).await?;
    let range = ferry_core::ByteRange::full(download.total_size());
    let parts: Vec<Bytes> = engine.read(download, range).try_collect().await?;
    Ok(parts.concat())
}
