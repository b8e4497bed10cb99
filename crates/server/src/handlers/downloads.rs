//! Download handler.

use crate::error::{ApiError, ApiResult};
use crate::metrics::{BYTES_DOWNLOADED, DOWNLOADS_STARTED};
use crate::state::AppState;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::{
    ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE,
};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use ferry_core::ByteRange;
use futures::StreamExt;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};

/// GET /download/{share_code} - Stream a sealed upload.
///
/// Honors a single `Range` header and answers `206 Partial Content` for
/// anything short of the whole file.
#[tracing::instrument(skip(state, headers))]
pub async fn download(
    State(state): State<AppState>,
    Path(share_code): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let download = state.engine.open_download(&share_code).await?;
    let total_size = download.total_size();

    let range = match headers.get(RANGE) {
        Some(value) => {
            let value = value.to_str().unwrap_or_default();
            ByteRange::parse_header(value, total_size).map_err(|e| {
                ApiError::RangeNotSatisfiable {
                    total_size,
                    message: e.to_string(),
                }
            })?
        }
        None => ByteRange::full(total_size),
    };
    let partial = !range.is_full(total_size);

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_str(download.mime_type())
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    response_headers.insert(CONTENT_LENGTH, HeaderValue::from(range.len()));
    response_headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Ok(value) = HeaderValue::from_str(&content_disposition(download.filename())) {
        response_headers.insert(CONTENT_DISPOSITION, value);
    }
    if partial && let Ok(value) = HeaderValue::from_str(&range.content_range(total_size)) {
        response_headers.insert(CONTENT_RANGE, value);
    }

    tracing::debug!(
        upload_id = %download.upload_id(),
        start = range.start,
        end = range.end,
        "Starting download"
    );
    DOWNLOADS_STARTED.inc();

    let stream = state
        .engine
        .read(download, range)
        .inspect(|result| {
            if let Ok(bytes) = result {
                BYTES_DOWNLOADED.inc_by(bytes.len() as u64);
            }
        })
        .map(|result| {
            result.map_err(|e| {
                tracing::error!(error = %e, "Download streaming failed mid-transfer");
                std::io::Error::other(e.to_string())
            })
        });

    let status = if partial {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };
    Ok((status, response_headers, Body::from_stream(stream)).into_response())
}

/// `attachment; filename="..."` with an ASCII fallback and an RFC 5987
/// `filename*` carrying the exact UTF-8 name.
fn content_disposition(filename: &str) -> String {
    let fallback: String = filename
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if fallback == filename {
        format!("attachment; filename=\"{filename}\"")
    } else {
        format!(
            "attachment; filename=\"{fallback}\"; filename*=UTF-8''{}",
            utf8_percent_encode(filename, NON_ALPHANUMERIC)
        )
    }
}
