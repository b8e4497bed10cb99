//! Transport abstraction and the HTTP implementation.

use crate::error::{ClientError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use ferry_core::{
    CHUNK_HASH_HEADER, ChunkAck, ChunkHash, OpenUploadRequest, OpenUploadResponse, SealResponse,
    TRACE_ID_HEADER, UploadStatus,
};
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;

/// The body of a download, starting at `offset`.
pub struct DownloadBody {
    /// Size of the whole file.
    pub total_size: u64,
    /// Position of the first streamed byte.
    pub offset: u64,
    /// File name from `Content-Disposition`, if the server sent one.
    pub filename: Option<String>,
    pub stream: BoxStream<'static, Result<Bytes>>,
}

/// The wire operations the client drivers are built on.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open_upload(&self, request: &OpenUploadRequest) -> Result<OpenUploadResponse>;

    async fn put_chunk(
        &self,
        upload_id: &str,
        index: u64,
        hash: &ChunkHash,
        data: Bytes,
    ) -> Result<ChunkAck>;

    async fn upload_status(&self, upload_id: &str) -> Result<UploadStatus>;

    async fn seal_upload(&self, upload_id: &str) -> Result<SealResponse>;

    async fn cancel_upload(&self, upload_id: &str) -> Result<()>;

    /// Fetch a shared file from byte `offset` to the end.
    async fn download(&self, share_code: &str, offset: u64) -> Result<DownloadBody>;
}

/// [`Transport`] over HTTP with `reqwest`.
#[derive(Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: Url,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// `base_url` may carry a path prefix; every endpoint is resolved below it.
    pub fn with_client(http: reqwest::Client, base_url: &str) -> Result<Self> {
        let mut base_url =
            Url::parse(base_url).map_err(|e| ClientError::InvalidUrl(format!("{base_url}: {e}")))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self { http, base_url })
    }

    /// Resolve `path` relative to the base URL. `path` must not start with `/`.
    fn url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| ClientError::InvalidUrl(format!("{path}: {e}")))
    }

    /// Send a request and turn any non-success status into a [`ClientError`].
    async fn send(&self, req: RequestBuilder) -> Result<Response> {
        let response = req.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let trace_id = response
            .headers()
            .get(TRACE_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let total_size = (status == StatusCode::RANGE_NOT_SATISFIABLE)
            .then(|| unsatisfied_range_total(&response))
            .flatten();
        let body = response.bytes().await.unwrap_or_default();
        if let Some(total_size) = total_size {
            return Err(ClientError::RangeNotSatisfiable { total_size });
        }

        let err = ClientError::from_response(status.as_u16(), &body);
        tracing::debug!(status = status.as_u16(), trace_id = ?trace_id, error = %err, "Request failed");
        Err(err)
    }

    async fn send_json<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T> {
        let response = self.send(req).await?;
        let body = response.bytes().await?;
        serde_json::from_slice(&body)
            .map_err(|e| ClientError::Protocol(format!("invalid response body: {e}")))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open_upload(&self, request: &OpenUploadRequest) -> Result<OpenUploadResponse> {
        let url = self.url("upload/open")?;
        self.send_json(self.http.post(url).json(request)).await
    }

    async fn put_chunk(
        &self,
        upload_id: &str,
        index: u64,
        hash: &ChunkHash,
        data: Bytes,
    ) -> Result<ChunkAck> {
        let url = self.url(&format!("upload/{upload_id}/chunk/{index}"))?;
        let req = self
            .http
            .post(url)
            .header(CHUNK_HASH_HEADER, hash.to_hex())
            .body(data);
        self.send_json(req).await
    }

    async fn upload_status(&self, upload_id: &str) -> Result<UploadStatus> {
        let url = self.url(&format!("upload/{upload_id}/status"))?;
        self.send_json(self.http.get(url)).await
    }

    async fn seal_upload(&self, upload_id: &str) -> Result<SealResponse> {
        let url = self.url(&format!("upload/{upload_id}/seal"))?;
        self.send_json(self.http.post(url)).await
    }

    async fn cancel_upload(&self, upload_id: &str) -> Result<()> {
        let url = self.url(&format!("upload/{upload_id}/cancel"))?;
        self.send(self.http.post(url)).await?;
        Ok(())
    }

    async fn download(&self, share_code: &str, offset: u64) -> Result<DownloadBody> {
        let url = self.url(&format!("download/{share_code}"))?;
        let mut req = self.http.get(url);
        if offset > 0 {
            req = req.header(RANGE, format!("bytes={offset}-"));
        }
        let response = self.send(req).await?;

        let filename = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(attachment_filename);
        let (offset, total_size) = if response.status() == StatusCode::PARTIAL_CONTENT {
            let value = response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| ClientError::Protocol("206 without Content-Range".into()))?;
            parse_content_range(value)
                .ok_or_else(|| ClientError::Protocol(format!("bad Content-Range {value:?}")))?
        } else {
            let length = response
                .headers()
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| ClientError::Protocol("download without Content-Length".into()))?;
            (0, length)
        };

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(ClientError::from))
            .boxed();
        Ok(DownloadBody {
            total_size,
            offset,
            filename,
            stream,
        })
    }
}

/// `bytes first-last/total` -> `(first, total)`.
fn parse_content_range(value: &str) -> Option<(u64, u64)> {
    let (span, total) = value.strip_prefix("bytes ")?.split_once('/')?;
    let (first, _last) = span.split_once('-')?;
    Some((first.trim().parse().ok()?, total.trim().parse().ok()?))
}

/// Total size from the `bytes */total` form sent with a 416.
fn unsatisfied_range_total(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_RANGE)?
        .to_str()
        .ok()?
        .strip_prefix("bytes */")?
        .trim()
        .parse()
        .ok()
}

/// The quoted `filename` parameter of an `attachment` disposition.
fn attachment_filename(value: &str) -> Option<String> {
    let start = value.find("filename=\"")? + "filename=\"".len();
    let rest = &value[start..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string()).filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_range() {
        assert_eq!(
            parse_content_range("bytes 1048570-1048579/3670016"),
            Some((1_048_570, 3_670_016))
        );
        assert_eq!(parse_content_range("bytes */10"), None);
        assert_eq!(parse_content_range("items 0-1/2"), None);
    }

    #[test]
    fn test_attachment_filename() {
        assert_eq!(
            attachment_filename("attachment; filename=\"report.pdf\"").as_deref(),
            Some("report.pdf")
        );
        assert_eq!(
            attachment_filename("attachment; filename=\"na_ve.txt\"; filename*=UTF-8''na%C3%AFve.txt")
                .as_deref(),
            Some("na_ve.txt")
        );
        assert_eq!(attachment_filename("inline"), None);
    }

    #[test]
    fn test_endpoints_resolve_below_base_path() {
        for base in ["http://files.example/ferry", "http://files.example/ferry/"] {
            let transport = HttpTransport::new(base).unwrap();
            assert_eq!(
                transport.url("upload/open").unwrap().as_str(),
                "http://files.example/ferry/upload/open"
            );
        }
        let transport = HttpTransport::new("http://files.example").unwrap();
        assert_eq!(
            transport.url("download/ABC123").unwrap().as_str(),
            "http://files.example/download/ABC123"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(matches!(
            HttpTransport::new("not a url"),
            Err(ClientError::InvalidUrl(_))
        ));
    }
}
