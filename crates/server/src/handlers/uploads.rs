//! Upload handlers.

use crate::error::{ApiError, ApiResult};
use crate::handlers::{parse_upload_id, read_json};
use crate::metrics::{
    ACTIVE_UPLOAD_SESSIONS, BYTES_DEDUPLICATED, BYTES_UPLOADED, CHUNK_HASH_MISMATCHES,
    CHUNK_UPLOAD_DURATION, CHUNKS_DEDUPLICATED, CHUNKS_STORED, SEAL_DURATION, UPLOADS_CANCELLED,
    UPLOADS_OPENED, UPLOADS_SEALED,
};
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use ferry_core::{
    CHUNK_HASH_HEADER, ChunkAck, ChunkHash, ChunkStatus, Error, OpenUploadRequest,
    OpenUploadResponse, SealResponse, UploadStatus,
};
use serde::Serialize;
use std::time::Instant;

/// Additional buffer for chunk bodies beyond the chunk size, so an
/// oversized chunk is reported with its length instead of a read error.
const CHUNK_UPLOAD_BUFFER: usize = 1024;

/// Empty JSON object returned by cancel.
#[derive(Debug, Serialize)]
pub struct Empty {}

fn track_sessions(state: &AppState) {
    ACTIVE_UPLOAD_SESSIONS.set(state.engine.sessions().upload_count() as i64);
}

/// POST /upload/open - Start a new upload.
#[tracing::instrument(skip(state, req))]
pub async fn open_upload(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<(StatusCode, Json<OpenUploadResponse>)> {
    let body: OpenUploadRequest = read_json(req).await?;
    let response = state.engine.open_upload(body).await?;

    UPLOADS_OPENED.inc();
    track_sessions(&state);
    Ok((StatusCode::CREATED, Json(response)))
}

/// POST /upload/{upload_id}/chunk/{index} - Append one chunk.
///
/// The body is the raw chunk; `X-Chunk-Hash` carries its hex SHA-256.
#[tracing::instrument(skip(state, req), fields(upload_id = %upload_id, chunk_index = %index))]
pub async fn put_chunk(
    State(state): State<AppState>,
    Path((upload_id, index)): Path<(String, String)>,
    req: Request,
) -> ApiResult<Json<ChunkAck>> {
    let start_time = Instant::now();
    let upload_id = parse_upload_id(&upload_id)?;
    let index: u64 = index
        .parse()
        .map_err(|_| Error::BadInput(format!("invalid chunk index {index:?}")))?;

    let claimed = req
        .headers()
        .get(CHUNK_HASH_HEADER)
        .ok_or_else(|| Error::BadInput(format!("missing {CHUNK_HASH_HEADER} header")))?
        .to_str()
        .map_err(|_| Error::BadInput(format!("{CHUNK_HASH_HEADER} is not ASCII")))?;
    let claimed = ChunkHash::from_hex(claimed.trim())?;

    let limit = state.engine.transfer_config().chunk_max as usize + CHUNK_UPLOAD_BUFFER;
    let data = axum::body::to_bytes(req.into_body(), limit)
        .await
        .map_err(|e| Error::BadInput(format!("failed to read chunk body: {e}")))?;
    let size = data.len() as u64;

    let receipt = match state
        .engine
        .put_chunk(&upload_id, index, &claimed, data)
        .await
    {
        Ok(receipt) => receipt,
        Err(e) => {
            if let Error::HashMismatch { .. } = e {
                CHUNK_HASH_MISMATCHES.inc();
            }
            return Err(ApiError::from(e));
        }
    };

    if receipt.ack.status == ChunkStatus::Stored {
        CHUNKS_STORED.inc();
        if receipt.deduplicated {
            CHUNKS_DEDUPLICATED.inc();
            BYTES_DEDUPLICATED.inc_by(size);
        } else {
            BYTES_UPLOADED.inc_by(size);
        }
    }
    CHUNK_UPLOAD_DURATION.observe(start_time.elapsed().as_secs_f64());
    Ok(Json(receipt.ack))
}

/// GET /upload/{upload_id}/status - Report upload progress.
#[tracing::instrument(skip(state))]
pub async fn upload_status(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> ApiResult<Json<UploadStatus>> {
    let upload_id = parse_upload_id(&upload_id)?;
    let status = state.engine.upload_status(&upload_id).await?;
    track_sessions(&state);
    Ok(Json(status))
}

/// POST /upload/{upload_id}/seal - Verify the upload and issue a share code.
#[tracing::instrument(skip(state))]
pub async fn seal_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> ApiResult<Json<SealResponse>> {
    let start_time = Instant::now();
    let upload_id = parse_upload_id(&upload_id)?;
    let response = state.engine.seal_upload(&upload_id).await?;

    UPLOADS_SEALED.inc();
    SEAL_DURATION.observe(start_time.elapsed().as_secs_f64());
    track_sessions(&state);
    Ok(Json(response))
}

/// POST /upload/{upload_id}/cancel - Abandon an upload.
#[tracing::instrument(skip(state))]
pub async fn cancel_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> ApiResult<Json<Empty>> {
    let upload_id = parse_upload_id(&upload_id)?;
    state.engine.cancel_upload(&upload_id).await?;

    UPLOADS_CANCELLED.inc();
    track_sessions(&state);
    Ok(Json(Empty {}))
}
