//! Integration tests for the upload API and its error mapping.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use bytes::Bytes;
use common::{TEST_CHUNK, TestServer, seeded_bytes, chunk_hash_hex};
use serde_json::json;

fn error_code(body: &serde_json::Value) -> &str {
    body["code"].as_str().unwrap_or_default()
}

#[tokio::test]
async fn test_health_check() {
    let server = TestServer::new().await;

    let response = server.json("GET", "/health", None).await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["status"], "ok");
    assert_eq!(response.body["upload_sessions"], 0);
}

#[tokio::test]
async fn test_open_upload_response() {
    let server = TestServer::new().await;

    let response = server
        .json(
            "POST",
            "/upload/open",
            Some(json!({"filename": "notes.txt", "mime": "text/plain", "total_size": 10_000})),
        )
        .await;

    assert_eq!(response.status, StatusCode::CREATED);
    assert!(response.body["upload_id"].is_string());
    assert_eq!(response.body["chunk_max"], TEST_CHUNK as u64);
    assert_eq!(response.body["chunks_expected"], 3);
    assert_eq!(response.body["max_outstanding_chunks"], 1);
}

#[tokio::test]
async fn test_open_upload_rejects_bad_input() {
    let server = TestServer::new().await;

    let request = Request::builder()
        .method("POST")
        .uri("/upload/open")
        .header("Content-Type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, _, bytes) = server.send(request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(error_code(&body), "bad_input");

    let response = server
        .json(
            "POST",
            "/upload/open",
            Some(json!({"filename": "", "mime": "text/plain", "total_size": 1})),
        )
        .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&response.body), "bad_input");
    assert!(response.body.get("correlation_id").is_none());
}

#[tokio::test]
async fn test_open_upload_over_quota() {
    let server = TestServer::with_config(|config| {
        config.transfer.max_upload_bytes = 64 * 1024;
    })
    .await;

    let response = server
        .json(
            "POST",
            "/upload/open",
            Some(json!({"filename": "big.bin", "mime": "application/octet-stream", "total_size": 64 * 1024 + 1})),
        )
        .await;

    assert_eq!(response.status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(error_code(&response.body), "quota_exceeded");
}

#[tokio::test]
async fn test_chunk_flow_and_status() {
    let server = TestServer::new().await;
    let data = seeded_bytes(1, TEST_CHUNK * 2 + 100);
    let upload_id = server.open("data.bin", data.len()).await;

    let response = server
        .put_chunk(&upload_id, 0, data.slice(0..TEST_CHUNK))
        .await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["status"], "stored");
    assert_eq!(response.body["next_index"], 1);

    let status = server
        .json("GET", &format!("/upload/{upload_id}/status"), None)
        .await;
    assert_eq!(status.status, StatusCode::OK);
    assert_eq!(status.body["state"], "receiving");
    assert_eq!(status.body["cursor"], 1);
    assert_eq!(status.body["bytes_received"], TEST_CHUNK as u64);
}

#[tokio::test]
async fn test_resent_chunk_is_duplicate() {
    let server = TestServer::new().await;
    let data = seeded_bytes(2, TEST_CHUNK * 2);
    let upload_id = server.open("dup.bin", data.len()).await;
    server.send_chunks(&upload_id, &data, 0..1).await;

    let response = server
        .put_chunk(&upload_id, 0, data.slice(0..TEST_CHUNK))
        .await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["status"], "duplicate");
    assert_eq!(response.body["next_index"], 1);
}

#[tokio::test]
async fn test_out_of_order_chunk_is_bad_sequence() {
    let server = TestServer::new().await;
    let data = seeded_bytes(3, TEST_CHUNK * 3);
    let upload_id = server.open("order.bin", data.len()).await;

    let response = server
        .put_chunk(&upload_id, 2, data.slice(TEST_CHUNK * 2..))
        .await;

    assert_eq!(response.status, StatusCode::CONFLICT);
    assert_eq!(error_code(&response.body), "bad_sequence");
}

#[tokio::test]
async fn test_hash_mismatch_then_retry() {
    let server = TestServer::new().await;
    let data = seeded_bytes(4, TEST_CHUNK * 2);
    let upload_id = server.open("retry.bin", data.len()).await;
    let chunk = data.slice(0..TEST_CHUNK);

    let wrong = chunk_hash_hex(b"something else");
    let response = server
        .put_chunk_with_hash(&upload_id, 0, chunk.clone(), &wrong)
        .await;
    assert_eq!(response.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(error_code(&response.body), "hash_mismatch");

    let status = server
        .json("GET", &format!("/upload/{upload_id}/status"), None)
        .await;
    assert_eq!(status.body["cursor"], 0);

    let response = server.put_chunk(&upload_id, 0, chunk).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["next_index"], 1);
}

#[tokio::test]
async fn test_chunk_header_validation() {
    let server = TestServer::new().await;
    let upload_id = server.open("hdr.bin", TEST_CHUNK).await;

    let request = Request::builder()
        .method("POST")
        .uri(format!("/upload/{upload_id}/chunk/0"))
        .body(Body::from(vec![0u8; TEST_CHUNK]))
        .unwrap();
    let (status, _, _) = server.send(request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let response = server
        .put_chunk_with_hash(&upload_id, 0, Bytes::from(vec![0u8; TEST_CHUNK]), "zz")
        .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&response.body), "bad_input");

    let request = Request::builder()
        .method("POST")
        .uri(format!("/upload/{upload_id}/chunk/first"))
        .header("X-Chunk-Hash", chunk_hash_hex(&[0u8; TEST_CHUNK]))
        .body(Body::from(vec![0u8; TEST_CHUNK]))
        .unwrap();
    let (status, _, _) = server.send(request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_oversized_chunk_rejected() {
    let server = TestServer::new().await;
    let upload_id = server.open("big.bin", TEST_CHUNK * 4).await;

    let response = server
        .put_chunk(&upload_id, 0, Bytes::from(vec![7u8; TEST_CHUNK * 2]))
        .await;

    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&response.body), "bad_input");
}

#[tokio::test]
async fn test_seal_incomplete_upload() {
    let server = TestServer::new().await;
    let data = seeded_bytes(5, TEST_CHUNK * 2);
    let upload_id = server.open("half.bin", data.len()).await;
    server.send_chunks(&upload_id, &data, 0..1).await;

    let response = server
        .json("POST", &format!("/upload/{upload_id}/seal"), None)
        .await;

    assert_eq!(response.status, StatusCode::CONFLICT);
    assert_eq!(error_code(&response.body), "incomplete_upload");
}

#[tokio::test]
async fn test_seal_is_idempotent_and_final() {
    let server = TestServer::new().await;
    let data = seeded_bytes(6, TEST_CHUNK + 10);
    let (upload_id, code) = server.upload("final.bin", &data).await;
    assert_eq!(code.len(), 6);

    let again = server
        .json("POST", &format!("/upload/{upload_id}/seal"), None)
        .await;
    assert_eq!(again.status, StatusCode::OK);
    assert_eq!(again.body["share_code"], code.as_str());

    let status = server
        .json("GET", &format!("/upload/{upload_id}/status"), None)
        .await;
    assert_eq!(status.body["state"], "done");

    let response = server
        .put_chunk(&upload_id, 1, data.slice(TEST_CHUNK..))
        .await;
    assert_eq!(response.status, StatusCode::CONFLICT);
    assert_eq!(error_code(&response.body), "sealed_already");

    let cancel = server
        .json("POST", &format!("/upload/{upload_id}/cancel"), None)
        .await;
    assert_eq!(cancel.status, StatusCode::CONFLICT);
    assert_eq!(error_code(&cancel.body), "sealed_already");
}

#[tokio::test]
async fn test_cancel_upload() {
    let server = TestServer::new().await;
    let data = seeded_bytes(7, TEST_CHUNK * 3);
    let upload_id = server.open("cancel.bin", data.len()).await;
    server.send_chunks(&upload_id, &data, 0..2).await;

    let response = server
        .json("POST", &format!("/upload/{upload_id}/cancel"), None)
        .await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body, json!({}));

    let chunk = server
        .put_chunk(&upload_id, 2, data.slice(TEST_CHUNK * 2..))
        .await;
    assert_eq!(chunk.status, StatusCode::GONE);
    assert_eq!(error_code(&chunk.body), "cancelled");

    let status = server
        .json("GET", &format!("/upload/{upload_id}/status"), None)
        .await;
    assert_eq!(status.status, StatusCode::GONE);
    assert_eq!(error_code(&status.body), "expired");

    // Cancelling twice is harmless.
    let again = server
        .json("POST", &format!("/upload/{upload_id}/cancel"), None)
        .await;
    assert_eq!(again.status, StatusCode::OK);
}

#[tokio::test]
async fn test_cancel_then_gc_deletes_chunks() {
    let server = TestServer::new().await;
    let data = seeded_bytes(8, TEST_CHUNK * 3);
    let upload_id = server.open("gc.bin", data.len()).await;
    server.send_chunks(&upload_id, &data, 0..3).await;
    assert_eq!(server.state.engine.chunks().stats().await.unwrap().count, 3);

    server
        .json("POST", &format!("/upload/{upload_id}/cancel"), None)
        .await;
    let stats = ferry_server::scheduler::run_once(server.state.engine.clone(), false)
        .await
        .unwrap();

    assert_eq!(stats.chunks_deleted, 3);
    assert_eq!(server.state.engine.chunks().stats().await.unwrap().count, 0);
    let status = server
        .json("GET", &format!("/upload/{upload_id}/status"), None)
        .await;
    assert!(matches!(
        error_code(&status.body),
        "expired" | "not_found"
    ));
}

#[tokio::test]
async fn test_unknown_upload_is_not_found() {
    let server = TestServer::new().await;

    let response = server
        .json(
            "GET",
            &format!("/upload/{}/status", ferry_core::UploadId::new()),
            None,
        )
        .await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert_eq!(error_code(&response.body), "not_found");

    let response = server.json("POST", "/upload/garbage/seal", None).await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_resume_from_status_cursor() {
    let server = TestServer::new().await;
    let data = seeded_bytes(9, TEST_CHUNK * 4);
    let upload_id = server.open("resume.bin", data.len()).await;
    server.send_chunks(&upload_id, &data, 0..2).await;

    let status = server
        .json("GET", &format!("/upload/{upload_id}/status"), None)
        .await;
    let cursor = status.body["cursor"].as_u64().unwrap();
    assert_eq!(cursor, 2);

    server.send_chunks(&upload_id, &data, cursor..4).await;
    let sealed = server
        .json("POST", &format!("/upload/{upload_id}/seal"), None)
        .await;
    assert_eq!(sealed.status, StatusCode::OK);

    let code = sealed.body["share_code"].as_str().unwrap();
    let (status, _, body) = server.download(code, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, data);
}

#[tokio::test]
async fn test_trace_id_header() {
    let server = TestServer::new().await;

    let response = server.json("GET", "/health", None).await;
    let generated = response.headers["x-trace-id"].to_str().unwrap();
    assert_eq!(generated.len(), 36);

    let request = Request::builder()
        .method("GET")
        .uri("/health")
        .header("X-Trace-Id", "client-trace-42")
        .body(Body::empty())
        .unwrap();
    let (_, headers, _) = server.send(request).await;
    assert_eq!(headers["x-trace-id"], "client-trace-42");

    // Error responses carry it too.
    let response = server.json("GET", "/download/nosuchcode", None).await;
    assert!(response.headers.contains_key("x-trace-id"));
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let server = TestServer::new().await;
    server.open("metrics.bin", 10).await;

    let request = Request::builder()
        .method("GET")
        .uri("/metrics")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = server.send(request).await;

    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("ferry_uploads_opened_total"));
}

#[tokio::test]
async fn test_metrics_endpoint_disabled() {
    let server = TestServer::with_config(|config| {
        config.server.metrics_enabled = false;
    })
    .await;

    let request = Request::builder()
        .method("GET")
        .uri("/metrics")
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = server.send(request).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}
