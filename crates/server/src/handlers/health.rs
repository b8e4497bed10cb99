//! Health check handler.

use crate::error::ApiResult;
use crate::state::AppState;
use axum::Json;
use axum::extract::State;
use serde::Serialize;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub upload_sessions: usize,
    pub download_sessions: usize,
}

/// GET /health - Health check.
///
/// Unauthenticated so load balancers and orchestrators can reach it. Fails with
/// `Transient` or `Internal` when either backing store does not respond.
pub async fn health_check(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    state.engine.health_check().await?;

    let sessions = state.engine.sessions();
    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        upload_sessions: sessions.upload_count(),
        download_sessions: sessions.download_count(),
    }))
}
