//! Garbage collection tests.

mod common;

use common::*;
use ferry_core::{ChunkHash, Error};
use std::time::Duration;
use uuid::Uuid;

fn hashes(data: &[u8]) -> Vec<ChunkHash> {
    split_into_chunks(data, CHUNK)
        .iter()
        .map(|c| ChunkHash::compute(c))
        .collect()
}

#[tokio::test]
async fn test_gc_reclaims_cancelled_upload() {
    let t = TestEngine::new().await;
    let data = seeded_bytes(30, 3 * CHUNK as usize);
    let upload_id = open(&t.engine, "a.bin", data.len() as u64).await;
    send_chunks(&t.engine, &upload_id, &data, CHUNK, 0..2).await;
    t.engine.cancel_upload(&upload_id).await.unwrap();

    let stats = t.engine.run_gc(false).await.unwrap().unwrap();
    assert_eq!(stats.refs_released, 2);
    assert_eq!(stats.chunks_deleted, 2);
    assert_eq!(stats.bytes_reclaimed, 2 * CHUNK);
    assert_eq!(stats.errors, 0);

    for hash in &hashes(&data)[..2] {
        assert!(!t.engine.chunks().exists(hash).await.unwrap());
    }
    assert_eq!(t.engine.chunks().stats().await.unwrap().count, 0);
}

#[tokio::test]
async fn test_gc_keeps_chunks_shared_with_live_uploads() {
    let t = TestEngine::new().await;
    let data = seeded_bytes(31, 2 * CHUNK as usize);
    let (_, sealed) = upload(&t.engine, "keep.bin", &data).await;

    let doomed = open(&t.engine, "doomed.bin", data.len() as u64).await;
    send_chunks(&t.engine, &doomed, &data, CHUNK, 0..2).await;
    t.engine.cancel_upload(&doomed).await.unwrap();

    let stats = t.engine.run_gc(false).await.unwrap().unwrap();
    assert_eq!(stats.refs_released, 2);
    assert_eq!(stats.chunks_deleted, 0);

    for hash in hashes(&data) {
        assert_eq!(t.engine.chunks().refcount(&hash).await.unwrap(), 1);
    }
    assert_eq!(download_all(&t.engine, &sealed.share_code).await.unwrap(), data);
}

#[tokio::test]
async fn test_gc_leaves_open_uploads_alone() {
    let t = TestEngine::new().await;
    let data = seeded_bytes(32, 2 * CHUNK as usize);
    let upload_id = open(&t.engine, "a.bin", data.len() as u64).await;
    send_chunks(&t.engine, &upload_id, &data, CHUNK, 0..1).await;

    let stats = t.engine.run_gc(false).await.unwrap().unwrap();
    assert_eq!(stats.uploads_expired, 0);
    assert_eq!(stats.chunks_deleted, 0);

    send_chunks(&t.engine, &upload_id, &data, CHUNK, 1..2).await;
    let sealed = t.engine.seal_upload(&upload_id).await.unwrap();
    assert_eq!(download_all(&t.engine, &sealed.share_code).await.unwrap(), data);
}

#[tokio::test]
async fn test_gc_expires_idle_uploads() {
    let t = TestEngine::with_config(|c| c.transfer.session_idle_secs = 1).await;
    let data = seeded_bytes(33, 2 * CHUNK as usize);
    let upload_id = open(&t.engine, "a.bin", data.len() as u64).await;
    send_chunks(&t.engine, &upload_id, &data, CHUNK, 0..1).await;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let stats = t.engine.run_gc(false).await.unwrap().unwrap();
    assert_eq!(stats.uploads_expired, 1);
    assert_eq!(stats.refs_released, 1);
    assert_eq!(stats.chunks_deleted, 1);

    let manifest = t.engine.manifests().load(&upload_id).await.unwrap();
    assert_eq!(manifest.state, ferry_core::ManifestState::Expired);
    assert!(!manifest.cancelled);
    assert!(t.engine.sessions().upload(&upload_id).is_none());
    assert!(matches!(
        t.engine.upload_status(&upload_id).await.unwrap_err(),
        Error::Expired(_)
    ));
}

#[tokio::test]
async fn test_gc_expires_lapsed_shares() {
    let t = TestEngine::with_config(|c| c.transfer.share_ttl_secs = 1).await;
    let data = seeded_bytes(34, CHUNK as usize + 9);
    let (upload_id, sealed) = upload(&t.engine, "a.bin", &data).await;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let stats = t.engine.run_gc(false).await.unwrap().unwrap();
    assert_eq!(stats.shares_expired, 1);
    assert_eq!(stats.codes_released, 1);
    assert_eq!(stats.chunks_deleted, 2);

    assert!(t.engine.codes().is_empty().await);
    let err = t.engine.open_download(&sealed.share_code).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    let manifest = t.engine.manifests().load(&upload_id).await.unwrap();
    assert_eq!(manifest.state, ferry_core::ManifestState::Expired);
}

#[tokio::test]
async fn test_dry_run_changes_nothing() {
    let t = TestEngine::new().await;
    let data = seeded_bytes(35, 2 * CHUNK as usize);
    let upload_id = open(&t.engine, "a.bin", data.len() as u64).await;
    send_chunks(&t.engine, &upload_id, &data, CHUNK, 0..2).await;
    t.engine.cancel_upload(&upload_id).await.unwrap();

    let stats = t.engine.run_gc(true).await.unwrap().unwrap();
    assert!(stats.dry_run);
    assert_eq!(stats.refs_released, 2);
    for hash in hashes(&data) {
        assert!(t.engine.chunks().exists(&hash).await.unwrap());
        assert_eq!(t.engine.chunks().refcount(&hash).await.unwrap(), 1);
    }

    let stats = t.engine.run_gc(false).await.unwrap().unwrap();
    assert_eq!(stats.chunks_deleted, 2);
}

#[tokio::test]
async fn test_gc_deletes_manifests_after_retention() {
    let t = TestEngine::with_config(|c| c.gc.retention_secs = 0).await;
    let data = seeded_bytes(36, CHUNK as usize);
    let upload_id = open(&t.engine, "a.bin", data.len() as u64).await;
    t.engine.cancel_upload(&upload_id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    let stats = t.engine.run_gc(false).await.unwrap().unwrap();
    assert_eq!(stats.manifests_deleted, 1);
    assert!(matches!(
        t.engine.upload_status(&upload_id).await.unwrap_err(),
        Error::NotFound(_)
    ));
}

#[tokio::test]
async fn test_gc_keeps_expired_manifests_within_retention() {
    let t = TestEngine::new().await;
    let upload_id = open(&t.engine, "a.bin", 10).await;
    t.engine.cancel_upload(&upload_id).await.unwrap();

    let stats = t.engine.run_gc(false).await.unwrap().unwrap();
    assert_eq!(stats.manifests_deleted, 0);
    assert!(t.engine.manifests().load(&upload_id).await.is_ok());
}

#[tokio::test]
async fn test_only_one_run_at_a_time() {
    let t = TestEngine::new().await;
    let held = Uuid::new_v4();
    t.engine.metadata().begin_gc_run(held, false).await.unwrap();

    assert!(t.engine.run_gc(false).await.unwrap().is_none());

    t.engine
        .metadata()
        .finish_gc_run(held, ferry_metadata::GcRunState::Finished, None, None)
        .await
        .unwrap();
    t.engine.run_gc(false).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_runs_are_recorded() {
    let t = TestEngine::new().await;
    t.engine.run_gc(false).await.unwrap().unwrap();
    t.engine.run_gc(true).await.unwrap().unwrap();

    let runs = t.engine.metadata().recent_gc_runs(10).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.state == "finished"));
    assert!(runs.iter().any(|r| r.dry_run));
    let stats: serde_json::Value =
        serde_json::from_str(runs[0].stats_json.as_deref().unwrap()).unwrap();
    assert!(stats.get("chunks_deleted").is_some());
}

#[tokio::test]
async fn test_gc_removes_orphan_blobs() {
    let t = TestEngine::new().await;
    let orphan = seeded_bytes(37, 64);
    let hash = ChunkHash::compute(&orphan);
    let path = t.dir.path().join("storage").join(hash.to_object_key());
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, &orphan).unwrap();

    let stats = t.engine.run_gc(false).await.unwrap().unwrap();
    assert_eq!(stats.orphans_deleted, 1);
    assert!(!path.exists());
}
