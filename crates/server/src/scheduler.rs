//! Periodic garbage collection.
//!
//! Each run is spawned as its own task so a panic inside the collector is
//! caught, logged and counted instead of killing the scheduler.

use crate::metrics::{GC_BYTES_RECLAIMED, GC_CHUNKS_DELETED, GC_RUN_DURATION, UPLOADS_EXPIRED};
use ferry_core::config::GcConfig;
use ferry_transfer::{Engine, GcStats};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Run the collector every `config.interval()` until `shutdown` fires.
pub fn spawn_gc_scheduler(
    engine: Arc<Engine>,
    config: GcConfig,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = config.interval();
        tracing::info!(
            interval_secs = interval.as_secs(),
            dry_run = config.dry_run,
            "Garbage collection scheduler started"
        );

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(interval) => {}
            }
            run_once(engine.clone(), config.dry_run).await;
        }
        tracing::info!("Garbage collection scheduler stopped");
    })
}

/// Run one collection in its own task and record the outcome.
pub async fn run_once(engine: Arc<Engine>, dry_run: bool) -> Option<GcStats> {
    let start = Instant::now();
    let handle = tokio::spawn(async move { engine.run_gc(dry_run).await });

    match handle.await {
        Ok(Ok(Some(stats))) => {
            GC_RUN_DURATION.observe(start.elapsed().as_secs_f64());
            crate::metrics::record_gc_run("finished");
            if !stats.dry_run {
                GC_CHUNKS_DELETED.inc_by(stats.chunks_deleted);
                GC_BYTES_RECLAIMED.inc_by(stats.bytes_reclaimed);
                UPLOADS_EXPIRED.inc_by(stats.uploads_expired);
            }
            Some(stats)
        }
        Ok(Ok(None)) => {
            tracing::debug!("Garbage collection skipped; another run is active");
            crate::metrics::record_gc_run("skipped");
            None
        }
        Ok(Err(e)) if e.is_retryable() => {
            tracing::warn!(error = %e, "Scheduled garbage collection failed; retrying next interval");
            crate::metrics::record_gc_run("failed");
            None
        }
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Scheduled garbage collection failed");
            crate::metrics::record_gc_run("failed");
            None
        }
        Err(join_err) if join_err.is_panic() => {
            tracing::error!(panic = ?join_err, "Garbage collection task panicked");
            crate::metrics::record_gc_run("panicked");
            None
        }
        Err(join_err) => {
            tracing::warn!(error = ?join_err, "Garbage collection task was cancelled");
            None
        }
    }
}
