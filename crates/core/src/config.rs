//! Configuration types shared across crates.

use crate::share_code::{CodePolicy, MAX_CODE_LENGTH, MIN_CODE_LENGTH};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use time::Duration;

/// HTTP server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Enable the /metrics endpoint for Prometheus scraping (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

/// Blob storage configuration (chunks and manifests).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for storage.
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("./data/storage")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

/// Metadata store configuration (SQLite).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetadataConfig {
    /// Database file path.
    #[serde(default = "default_metadata_path")]
    pub path: PathBuf,
    /// Query timeout in seconds. Advisory: slow queries are logged, not cancelled.
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: Option<u64>,
}

fn default_metadata_path() -> PathBuf {
    PathBuf::from("./data/metadata.db")
}

fn default_query_timeout_secs() -> Option<u64> {
    Some(600)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            path: default_metadata_path(),
            query_timeout_secs: default_query_timeout_secs(),
        }
    }
}

/// Upload and download limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Chunk size in bytes; every chunk but the last has exactly this size.
    #[serde(default = "default_chunk_max")]
    pub chunk_max: u64,
    /// Largest file a single upload may declare.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
    /// Optional cap on the bytes held by the chunk store as a whole.
    #[serde(default)]
    pub max_total_bytes: Option<u64>,
    /// An upload with no activity for this long is expired.
    #[serde(default = "default_session_idle_secs")]
    pub session_idle_secs: u64,
    /// How long a sealed upload stays downloadable.
    #[serde(default = "default_share_ttl_secs")]
    pub share_ttl_secs: u64,
    /// Chunk requests a client may keep in flight per upload.
    #[serde(default = "default_max_outstanding_chunks")]
    pub max_outstanding_chunks: u32,
}

fn default_chunk_max() -> u64 {
    crate::DEFAULT_CHUNK_SIZE
}

fn default_max_upload_bytes() -> u64 {
    10 * 1024 * 1024 * 1024 // 10 GiB
}

fn default_session_idle_secs() -> u64 {
    15 * 60
}

fn default_share_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_max_outstanding_chunks() -> u32 {
    1
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_max: default_chunk_max(),
            max_upload_bytes: default_max_upload_bytes(),
            max_total_bytes: None,
            session_idle_secs: default_session_idle_secs(),
            share_ttl_secs: default_share_ttl_secs(),
            max_outstanding_chunks: default_max_outstanding_chunks(),
        }
    }
}

impl TransferConfig {
    pub fn session_idle(&self) -> Duration {
        Duration::seconds(i64::try_from(self.session_idle_secs).unwrap_or(i64::MAX))
    }

    pub fn share_ttl(&self) -> Duration {
        Duration::seconds(i64::try_from(self.share_ttl_secs).unwrap_or(i64::MAX))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.chunk_max < crate::MIN_CHUNK_SIZE || self.chunk_max > crate::MAX_CHUNK_SIZE {
            return Err(format!(
                "transfer.chunk_max {} must be between {} and {}",
                self.chunk_max,
                crate::MIN_CHUNK_SIZE,
                crate::MAX_CHUNK_SIZE
            ));
        }
        if self.max_upload_bytes == 0 {
            return Err("transfer.max_upload_bytes must be positive".to_string());
        }
        if self.max_outstanding_chunks == 0 {
            return Err("transfer.max_outstanding_chunks must be at least 1".to_string());
        }
        if self.session_idle_secs == 0 || self.share_ttl_secs == 0 {
            return Err(
                "transfer.session_idle_secs and transfer.share_ttl_secs must be positive"
                    .to_string(),
            );
        }
        check_window("transfer.session_idle_secs", self.session_idle_secs)?;
        check_window("transfer.share_ttl_secs", self.share_ttl_secs)?;
        Ok(())
    }
}

/// Share code generation configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShareCodeConfig {
    #[serde(default = "default_code_min_length")]
    pub min_length: usize,
    /// Expected peak number of simultaneously active codes.
    #[serde(default = "default_peak_active_codes")]
    pub peak_active_codes: u64,
    /// Acceptable probability that a fresh code collides with a live one.
    #[serde(default = "default_collision_threshold")]
    pub collision_threshold: f64,
    /// Collisions tolerated before the code length grows by one.
    #[serde(default = "default_max_collisions")]
    pub max_collisions: u32,
    /// Append-only allocation log.
    #[serde(default = "default_code_log_path")]
    pub log_path: PathBuf,
}

fn default_code_min_length() -> usize {
    MIN_CODE_LENGTH
}

fn default_peak_active_codes() -> u64 {
    100
}

fn default_collision_threshold() -> f64 {
    1e-6
}

fn default_max_collisions() -> u32 {
    8
}

fn default_code_log_path() -> PathBuf {
    PathBuf::from("./data/sharecodes.log")
}

impl Default for ShareCodeConfig {
    fn default() -> Self {
        Self {
            min_length: default_code_min_length(),
            peak_active_codes: default_peak_active_codes(),
            collision_threshold: default_collision_threshold(),
            max_collisions: default_max_collisions(),
            log_path: default_code_log_path(),
        }
    }
}

impl ShareCodeConfig {
    pub fn policy(&self) -> CodePolicy {
        CodePolicy {
            min_length: self.min_length,
            peak_active_codes: self.peak_active_codes,
            collision_threshold: self.collision_threshold,
            max_collisions: self.max_collisions,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.min_length < MIN_CODE_LENGTH || self.min_length > MAX_CODE_LENGTH {
            return Err(format!(
                "share_codes.min_length {} must be between {MIN_CODE_LENGTH} and {MAX_CODE_LENGTH}",
                self.min_length
            ));
        }
        if !(self.collision_threshold > 0.0 && self.collision_threshold < 1.0) {
            return Err(format!(
                "share_codes.collision_threshold {} must be in (0, 1)",
                self.collision_threshold
            ));
        }
        if self.max_collisions == 0 {
            return Err("share_codes.max_collisions must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Garbage collection configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GcConfig {
    /// Run the collector on a schedule (default: true).
    #[serde(default = "default_gc_enabled")]
    pub enabled: bool,
    /// Interval in seconds between runs (default: 5 minutes).
    #[serde(default = "default_gc_interval_secs")]
    pub interval_secs: u64,
    /// How long an expired manifest record is kept after its chunks are
    /// released, so late `status` calls still see `expired`.
    #[serde(default = "default_gc_retention_secs")]
    pub retention_secs: u64,
    /// Report what would be collected without deleting anything.
    #[serde(default)]
    pub dry_run: bool,
}

fn default_gc_enabled() -> bool {
    true
}

fn default_gc_interval_secs() -> u64 {
    300
}

fn default_gc_retention_secs() -> u64 {
    24 * 60 * 60
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: default_gc_enabled(),
            interval_secs: default_gc_interval_secs(),
            retention_secs: default_gc_retention_secs(),
            dry_run: false,
        }
    }
}

impl GcConfig {
    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interval_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::seconds(i64::try_from(self.retention_secs).unwrap_or(i64::MAX))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.enabled && self.interval_secs == 0 {
            return Err("gc.interval_secs must be positive when gc is enabled".to_string());
        }
        check_window("gc.interval_secs", self.interval_secs)?;
        check_window("gc.retention_secs", self.retention_secs)?;
        Ok(())
    }
}

/// Longest accepted time window for any expiry or interval setting: 100 years.
pub const MAX_WINDOW_SECS: u64 = 100 * 365 * 24 * 60 * 60;

fn check_window(name: &str, secs: u64) -> Result<(), String> {
    if secs > MAX_WINDOW_SECS {
        return Err(format!("{name} {secs} exceeds the maximum of {MAX_WINDOW_SECS}"));
    }
    Ok(())
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub share_codes: ShareCodeConfig,
    #[serde(default)]
    pub gc: GcConfig,
}

impl AppConfig {
    /// Validate every section, reporting the first problem.
    pub fn validate(&self) -> Result<(), String> {
        self.transfer.validate()?;
        self.share_codes.validate()?;
        self.gc.validate()?;
        Ok(())
    }

    /// Configuration rooted at `dir`, with the scheduled collector disabled.
    ///
    /// **For testing only.**
    pub fn for_testing(dir: &std::path::Path) -> Self {
        Self {
            storage: StorageConfig {
                path: dir.join("storage"),
            },
            metadata: MetadataConfig {
                path: dir.join("metadata.db"),
                query_timeout_secs: None,
            },
            share_codes: ShareCodeConfig {
                log_path: dir.join("sharecodes.log"),
                ..ShareCodeConfig::default()
            },
            gc: GcConfig {
                enabled: false,
                ..GcConfig::default()
            },
            ..Self::default()
        }
    }
}
