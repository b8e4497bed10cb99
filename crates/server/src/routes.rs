//! Route configuration.

use crate::handlers;
use crate::metrics::metrics_handler;
use crate::state::AppState;
use crate::trace::trace_id_middleware;
use axum::Router;
use axum::middleware;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let upload_routes = Router::new()
        .route("/upload/open", post(handlers::open_upload))
        .route(
            "/upload/{upload_id}/chunk/{index}",
            post(handlers::put_chunk),
        )
        .route("/upload/{upload_id}/status", get(handlers::upload_status))
        .route("/upload/{upload_id}/seal", post(handlers::seal_upload))
        .route("/upload/{upload_id}/cancel", post(handlers::cancel_upload));

    let download_routes = Router::new().route("/download/{share_code}", get(handlers::download));

    let mut router = Router::new()
        .merge(upload_routes)
        .merge(download_routes)
        // Health check (unauthenticated for load balancers/k8s)
        .route("/health", get(handlers::health_check));

    // When enabled, this endpoint should be reachable only from the scraper's
    // network. See crate::metrics module documentation.
    if state.config.server.metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    // Layers run outermost first: TraceLayer -> trace id -> handler.
    router
        .layer(middleware::from_fn(trace_id_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
