use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::limits::{Limits, TenantLimits};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Root directory for the local table cache.
    pub cache_dir: PathBuf,
    /// Interval (seconds) between sync passes against remote storage.
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    /// Maximum idle time (seconds) before a table's unused index is evicted.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Number of days of index, counted back from the active table, to keep
    /// downloaded ahead of queries regardless of tenant.
    #[serde(default)]
    pub query_ready_num_days: i32,
    #[serde(default)]
    pub limits: LimitsConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

fn default_sync_interval_secs() -> u64 {
    900
}

fn default_cache_ttl_secs() -> u64 {
    86_400
}

impl Config {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// The subset of this config consumed by the table manager.
    pub fn table_manager_config(&self) -> crate::table_manager::Config {
        crate::table_manager::Config {
            cache_dir: self.cache_dir.clone(),
            sync_interval: self.sync_interval(),
            cache_ttl: self.cache_ttl(),
            query_ready_num_days: self.query_ready_num_days,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-tenant limits
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LimitsConfig {
    /// Limits applied to tenants without an explicit override.
    #[serde(default)]
    pub default: TenantLimits,
    /// Per-tenant overrides, keyed by tenant ID.
    #[serde(default)]
    pub tenants: HashMap<String, TenantLimits>,
}

impl Limits for LimitsConfig {
    fn default_limits(&self) -> TenantLimits {
        self.default
    }

    fn all_by_user_id(&self) -> HashMap<String, TenantLimits> {
        self.tenants.clone()
    }
}

// ---------------------------------------------------------------------------
// Storage (S3)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub s3: S3StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3StorageConfig {
    pub bucket: String,
    #[serde(default = "default_s3_prefix")]
    pub prefix: String,
    pub region: String,
    /// Use the FIPS endpoints for S3 operations.
    #[serde(default)]
    pub use_fips: bool,
}

fn default_s3_prefix() -> String {
    "index/".to_string()
}

// ---------------------------------------------------------------------------
// Admin server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address for the health/metrics listener.
    #[serde(default = "default_http_listen")]
    pub http_listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_listen: default_http_listen(),
        }
    }
}

fn default_http_listen() -> String {
    "0.0.0.0:9100".to_string()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
pub fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        config.sync_interval_secs > 0,
        "sync_interval_secs must be greater than zero"
    );
    anyhow::ensure!(
        config.cache_ttl_secs > 0,
        "cache_ttl_secs must be greater than zero"
    );
    anyhow::ensure!(
        config.query_ready_num_days >= 0,
        "query_ready_num_days must not be negative"
    );
    anyhow::ensure!(
        config.limits.default.query_ready_index_num_days >= 0,
        "limits.default.query_ready_index_num_days must not be negative"
    );
    for (user_id, limits) in &config.limits.tenants {
        anyhow::ensure!(
            limits.query_ready_index_num_days >= 0,
            "limits.tenants.{user_id}.query_ready_index_num_days must not be negative"
        );
    }
    Ok(())
}
