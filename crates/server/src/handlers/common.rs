//! Shared handler helpers.

use crate::error::ApiResult;
use axum::extract::Request;
use ferry_core::{Error, UploadId};
use serde::de::DeserializeOwned;

/// Maximum size of a JSON control-plane request body.
const MAX_JSON_BODY_SIZE: usize = 64 * 1024;

/// Read a JSON request body, reporting failures as `BadInput`.
pub async fn read_json<T: DeserializeOwned>(req: Request) -> ApiResult<T> {
    let bytes = axum::body::to_bytes(req.into_body(), MAX_JSON_BODY_SIZE)
        .await
        .map_err(|e| Error::BadInput(format!("failed to read body: {e}")))?;
    Ok(serde_json::from_slice(&bytes)
        .map_err(|e| Error::BadInput(format!("invalid JSON: {e}")))?)
}

/// Parse the `{upload_id}` path segment.
///
/// A token that cannot name any upload is reported as `NotFound`.
pub fn parse_upload_id(raw: &str) -> ApiResult<UploadId> {
    Ok(UploadId::parse(raw).map_err(|_| Error::NotFound(format!("upload {raw} not found")))?)
}
