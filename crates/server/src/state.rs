//! Application state shared across handlers.

use ferry_core::config::AppConfig;
use ferry_transfer::Engine;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Transfer engine: chunk store, manifests, share codes and sessions.
    pub engine: Arc<Engine>,
}

impl AppState {
    pub fn new(config: AppConfig, engine: Arc<Engine>) -> Self {
        Self {
            config: Arc::new(config),
            engine,
        }
    }

    /// Open the configured stores and build the engine over them.
    pub async fn from_config(config: AppConfig) -> ferry_core::Result<Self> {
        let engine = Engine::from_config(&config).await?;
        Ok(Self::new(config, Arc::new(engine)))
    }
}
