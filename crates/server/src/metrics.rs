//! Prometheus metrics for the ferry server.
//!
//! Exposes counters for uploads, chunk deduplication, downloads and garbage
//! collection, plus request latency histograms.
//!
//! The `/metrics` endpoint is unauthenticated. It exposes aggregate usage only
//! (no upload ids, hashes or share codes) but should still be reachable only
//! from the scraper's network.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    self, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Upload metrics
pub static UPLOADS_OPENED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("ferry_uploads_opened_total", "Total number of uploads opened")
        .expect("metric creation failed")
});

pub static UPLOADS_SEALED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "ferry_uploads_sealed_total",
        "Total number of uploads sealed with a share code",
    )
    .expect("metric creation failed")
});

pub static UPLOADS_CANCELLED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "ferry_uploads_cancelled_total",
        "Total number of uploads cancelled by the client",
    )
    .expect("metric creation failed")
});

pub static UPLOADS_EXPIRED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "ferry_uploads_expired_total",
        "Total number of uploads expired for inactivity",
    )
    .expect("metric creation failed")
});

// Chunk metrics
pub static CHUNKS_STORED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "ferry_chunks_stored_total",
        "Total number of chunks committed to an upload",
    )
    .expect("metric creation failed")
});

pub static CHUNKS_DEDUPLICATED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "ferry_chunks_deduplicated_total",
        "Total number of chunks whose bytes were already stored",
    )
    .expect("metric creation failed")
});

pub static BYTES_UPLOADED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "ferry_bytes_uploaded_total",
        "Total chunk bytes received (new blobs only)",
    )
    .expect("metric creation failed")
});

pub static BYTES_DEDUPLICATED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "ferry_bytes_deduplicated_total",
        "Total chunk bytes that matched an existing blob",
    )
    .expect("metric creation failed")
});

pub static CHUNK_HASH_MISMATCHES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "ferry_chunk_hash_mismatches_total",
        "Total number of chunks rejected for a wrong X-Chunk-Hash",
    )
    .expect("metric creation failed")
});

// Download metrics
pub static DOWNLOADS_STARTED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "ferry_downloads_started_total",
        "Total number of downloads started",
    )
    .expect("metric creation failed")
});

pub static BYTES_DOWNLOADED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("ferry_bytes_downloaded_total", "Total bytes sent to downloaders")
        .expect("metric creation failed")
});

pub static ACTIVE_UPLOAD_SESSIONS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "ferry_active_upload_sessions",
        "Upload sessions currently held in memory",
    )
    .expect("metric creation failed")
});

// Timing metrics
pub static CHUNK_UPLOAD_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "ferry_chunk_upload_duration_seconds",
            "Time taken to store a single chunk",
        )
        .buckets(vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
    )
    .expect("metric creation failed")
});

pub static SEAL_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "ferry_seal_duration_seconds",
            "Time taken to verify and seal an upload",
        )
        .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
    )
    .expect("metric creation failed")
});

// Error metrics
pub static REQUEST_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("ferry_request_errors_total", "Total error responses by kind"),
        &["kind"],
    )
    .expect("metric creation failed")
});

// GC metrics
pub static GC_RUNS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "ferry_gc_runs_total",
            "Garbage collection runs by outcome (finished, failed, skipped, panicked)",
        ),
        &["outcome"],
    )
    .expect("metric creation failed")
});

pub static GC_RUN_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "ferry_gc_run_duration_seconds",
            "Time taken by one garbage collection run",
        )
        .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 60.0, 300.0]),
    )
    .expect("metric creation failed")
});

pub static GC_CHUNKS_DELETED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "ferry_gc_chunks_deleted_total",
        "Total chunks deleted by garbage collection",
    )
    .expect("metric creation failed")
});

pub static GC_BYTES_RECLAIMED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "ferry_gc_bytes_reclaimed_total",
        "Total bytes reclaimed by garbage collection",
    )
    .expect("metric creation failed")
});

/// Guard to ensure metrics are only registered once.
static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Idempotent, so tests may build as many routers as they like.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(UPLOADS_OPENED.clone()),
            Box::new(UPLOADS_SEALED.clone()),
            Box::new(UPLOADS_CANCELLED.clone()),
            Box::new(UPLOADS_EXPIRED.clone()),
            Box::new(CHUNKS_STORED.clone()),
            Box::new(CHUNKS_DEDUPLICATED.clone()),
            Box::new(BYTES_UPLOADED.clone()),
            Box::new(BYTES_DEDUPLICATED.clone()),
            Box::new(CHUNK_HASH_MISMATCHES.clone()),
            Box::new(DOWNLOADS_STARTED.clone()),
            Box::new(BYTES_DOWNLOADED.clone()),
            Box::new(ACTIVE_UPLOAD_SESSIONS.clone()),
            Box::new(CHUNK_UPLOAD_DURATION.clone()),
            Box::new(SEAL_DURATION.clone()),
            Box::new(REQUEST_ERRORS.clone()),
            Box::new(GC_RUNS.clone()),
            Box::new(GC_RUN_DURATION.clone()),
            Box::new(GC_CHUNKS_DELETED.clone()),
            Box::new(GC_BYTES_RECLAIMED.clone()),
        ];
        for collector in collectors {
            REGISTRY
                .register(collector)
                .expect("metric registration failed");
        }
    });
}

/// GET /metrics - Prometheus metrics endpoint.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}

/// Count an error response by kind.
pub fn record_error(kind: &str) {
    REQUEST_ERRORS.with_label_values(&[kind]).inc();
}

/// Count the outcome of a garbage collection run.
pub fn record_gc_run(outcome: &str) {
    GC_RUNS.with_label_values(&[outcome]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        register_metrics();
        register_metrics();
        record_error("bad_input");
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&REGISTRY.gather(), &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("ferry_request_errors_total{kind=\"bad_input\"}"));
    }
}
