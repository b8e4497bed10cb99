//! ferry server binary.

use anyhow::{Context, Result};
use clap::Parser;
use ferry_core::config::AppConfig;
use ferry_server::{AppState, create_router, spawn_gc_scheduler};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// ferry - resumable, chunked file transfer server
#[derive(Parser, Debug)]
#[command(name = "ferryd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "FERRY_CONFIG", default_value = "config/server.toml")]
    config: String,
}

/// Layer the optional TOML file under `FERRY_`-prefixed environment variables.
fn load_config(path: &str) -> Result<AppConfig> {
    let mut figment = Figment::new();
    if std::path::Path::new(path).exists() {
        tracing::info!(config_path = %path, "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::info!(config_path = %path, "No config file found, using defaults and environment");
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("FERRY_").ignore(&["CONFIG"]).split("__"))
        .extract()
        .context("failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    Ok(config)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("ferry v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args.config)?;

    ferry_server::metrics::register_metrics();
    tracing::info!("Prometheus metrics registered");

    let state = AppState::from_config(config.clone())
        .await
        .context("failed to initialize transfer engine")?;
    state
        .engine
        .health_check()
        .await
        .context("store health check failed")?;
    tracing::info!(
        storage = %config.storage.path.display(),
        metadata = %config.metadata.path.display(),
        "Transfer engine initialized"
    );

    let shutdown = CancellationToken::new();
    let scheduler = if config.gc.enabled {
        Some(spawn_gc_scheduler(
            state.engine.clone(),
            config.gc.clone(),
            shutdown.clone(),
        ))
    } else {
        tracing::info!("Scheduled garbage collection disabled");
        None
    };

    let engine = state.engine.clone();
    let app = create_router(state);

    let addr: SocketAddr = config.server.bind.parse().context("invalid bind address")?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown.cancel();
    if let Some(handle) = scheduler
        && let Err(e) = handle.await
    {
        tracing::warn!(error = %e, "Garbage collection scheduler did not stop cleanly");
    }
    engine.shutdown().await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_config_file_uses_defaults() {
        figment::Jail::expect_with(|_jail| {
            let config = load_config("does/not/exist.toml").unwrap();
            assert_eq!(config.server.bind, AppConfig::default().server.bind);
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "server.toml",
                r#"
                [transfer]
                chunk_max = 2097152

                [gc]
                dry_run = true
                "#,
            )?;
            jail.set_env("FERRY_TRANSFER__SHARE_TTL_SECS", "60");
            jail.set_env("FERRY_CONFIG", "ignored.toml");

            let config = load_config("server.toml").unwrap();
            assert_eq!(config.transfer.chunk_max, 2 * 1024 * 1024);
            assert_eq!(config.transfer.share_ttl_secs, 60);
            assert!(config.gc.dry_run);
            Ok(())
        });
    }

    #[test]
    fn test_invalid_config_rejected() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("FERRY_TRANSFER__CHUNK_MAX", "0");
            assert!(load_config("none.toml").is_err());
            Ok(())
        });
    }
}
