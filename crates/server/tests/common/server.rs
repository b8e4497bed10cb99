//! Server test utilities.

use super::fixtures::chunk_hash_hex;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use bytes::Bytes;
use ferry_core::config::AppConfig;
use ferry_server::{AppState, create_router};
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;

/// Chunk size used by most server tests.
#[allow(dead_code)]
pub const TEST_CHUNK: usize = 4096;

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    _temp_dir: TempDir,
}

/// A response with its body parsed as JSON (`Null` when empty or not JSON).
#[allow(dead_code)]
pub struct JsonResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

#[allow(dead_code)]
impl TestServer {
    /// Create a new test server with temporary storage and 4 KiB chunks.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server with custom config modifications.
    pub async fn with_config<F>(modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        ferry_server::metrics::register_metrics();
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");

        let mut config = AppConfig::for_testing(temp_dir.path());
        config.transfer.chunk_max = TEST_CHUNK as u64;
        config.server.metrics_enabled = true;
        modifier(&mut config);

        let state = AppState::from_config(config)
            .await
            .expect("Failed to create app state");
        let router = create_router(state.clone());

        Self {
            router,
            state,
            _temp_dir: temp_dir,
        }
    }

    fn chunk_size(&self) -> usize {
        self.state.config.transfer.chunk_max as usize
    }

    /// Send a request and collect the raw response.
    pub async fn send(&self, request: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, headers, body)
    }

    /// Send a JSON (or empty) request and parse the JSON response.
    pub async fn json(&self, method: &str, uri: &str, body: Option<Value>) -> JsonResponse {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(v) => builder
                .header("Content-Type", "application/json")
                .body(Body::from(serde_json::to_vec(&v).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let (status, headers, bytes) = self.send(request).await;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        JsonResponse {
            status,
            headers,
            body,
        }
    }

    /// POST /upload/open, asserting success. Returns the upload id.
    pub async fn open(&self, filename: &str, total_size: usize) -> String {
        let response = self
            .json(
                "POST",
                "/upload/open",
                Some(json!({
                    "filename": filename,
                    "mime": "application/octet-stream",
                    "total_size": total_size,
                })),
            )
            .await;
        assert_eq!(response.status, StatusCode::CREATED, "{}", response.body);
        response.body["upload_id"].as_str().unwrap().to_string()
    }

    /// POST one chunk with an explicit `X-Chunk-Hash` value.
    pub async fn put_chunk_with_hash(
        &self,
        upload_id: &str,
        index: u64,
        data: Bytes,
        hash: &str,
    ) -> JsonResponse {
        let request = Request::builder()
            .method("POST")
            .uri(format!("/upload/{upload_id}/chunk/{index}"))
            .header("X-Chunk-Hash", hash)
            .body(Body::from(data))
            .unwrap();
        let (status, headers, bytes) = self.send(request).await;
        JsonResponse {
            status,
            headers,
            body: serde_json::from_slice(&bytes).unwrap_or(Value::Null),
        }
    }

    /// POST one chunk with its correct hash.
    pub async fn put_chunk(&self, upload_id: &str, index: u64, data: Bytes) -> JsonResponse {
        let hash = chunk_hash_hex(&data);
        self.put_chunk_with_hash(upload_id, index, data, &hash).await
    }

    /// Send chunks `range` of `data`, asserting each is stored.
    pub async fn send_chunks(&self, upload_id: &str, data: &Bytes, range: std::ops::Range<u64>) {
        let size = self.chunk_size();
        for index in range {
            let start = index as usize * size;
            let end = (start + size).min(data.len());
            let response = self
                .put_chunk(upload_id, index, data.slice(start..end))
                .await;
            assert_eq!(response.status, StatusCode::OK, "{}", response.body);
            assert_eq!(response.body["next_index"], index + 1);
        }
    }

    /// Open, upload and seal `data`. Returns `(upload_id, share_code)`.
    pub async fn upload(&self, filename: &str, data: &Bytes) -> (String, String) {
        let upload_id = self.open(filename, data.len()).await;
        let chunks = data.len().div_ceil(self.chunk_size()) as u64;
        self.send_chunks(&upload_id, data, 0..chunks).await;

        let sealed = self
            .json("POST", &format!("/upload/{upload_id}/seal"), None)
            .await;
        assert_eq!(sealed.status, StatusCode::OK, "{}", sealed.body);
        let code = sealed.body["share_code"].as_str().unwrap().to_string();
        (upload_id, code)
    }

    /// GET /download/{code} with an optional `Range` header.
    pub async fn download(&self, code: &str, range: Option<&str>) -> (StatusCode, HeaderMap, Bytes) {
        let mut builder = Request::builder()
            .method("GET")
            .uri(format!("/download/{code}"));
        if let Some(range) = range {
            builder = builder.header("Range", range);
        }
        self.send(builder.body(Body::empty()).unwrap()).await
    }
}
