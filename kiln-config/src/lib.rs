//! Configuration management for the Kiln fleet.
//!
//! Loading hierarchy: environment > file > defaults. The file lives at
//! `~/.kiln/config.toml` unless a path is passed explicitly. Secrets never
//! live in the file — API keys come from environment variables or the
//! credential store.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KilnConfig {
    pub database: DatabaseConfig,
    pub events: EventsConfig,
    pub printer: PrinterConfig,
    pub billing: BillingConfig,
    pub fulfillment: FulfillmentConfig,
    pub watcher: WatcherConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to the SQLite store; `None` means `~/.kiln/kiln.db`.
    pub path: Option<String>,
    /// Separate credentials database; `None` means `~/.kiln/credentials.db`.
    pub credentials_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Bounded size of the async event queue.
    pub queue_size: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { queue_size: 10_000 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PrinterConfig {
    /// Default printer name for sugared CLI commands.
    pub default: Option<String>,
    /// Per-request HTTP timeout in seconds.
    pub http_timeout_secs: Option<u64>,
    /// Attempts for transient HTTP failures.
    pub http_retries: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    pub network_fee_percent: f64,
    pub min_fee: f64,
    pub max_fee: f64,
    pub free_tier_jobs: u32,
    pub currency: String,
    pub max_per_order: f64,
    pub max_per_day: f64,
    pub max_per_month: f64,
    /// Preferred rail name; `None` falls back to the first registered.
    pub default_rail: Option<String>,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            network_fee_percent: 5.0,
            min_fee: 0.25,
            max_fee: 200.0,
            free_tier_jobs: 5,
            currency: "USD".into(),
            max_per_order: 500.0,
            max_per_day: 1000.0,
            max_per_month: 2000.0,
            default_rail: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FulfillmentConfig {
    /// Server-side quote TTL in seconds.
    pub quote_ttl_seconds: u64,
}

impl Default for FulfillmentConfig {
    fn default() -> Self {
        Self {
            quote_ttl_seconds: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub poll_interval_s: f64,
    pub timeout_s: f64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_s: 10.0,
            timeout_s: 1800.0,
        }
    }
}

/// Default config file path: `~/.kiln/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".kiln").join("config.toml"))
}

/// Load configuration: file (when present) then environment overrides.
pub fn load_config(path: Option<&Path>) -> ConfigResult<KilnConfig> {
    let resolved = path.map(Path::to_path_buf).or_else(default_config_path);
    let mut config = match resolved {
        Some(path) if path.exists() => load_from_file(&path)?,
        _ => KilnConfig::default(),
    };
    apply_env_overrides(&mut config);
    validate(&config)?;
    Ok(config)
}

/// Parse a config file.
pub fn load_from_file(path: &Path) -> ConfigResult<KilnConfig> {
    let content = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Apply `KILN_*` environment overrides on top of the loaded file.
pub fn apply_env_overrides(config: &mut KilnConfig) {
    if let Ok(path) = std::env::var("KILN_DB_PATH") {
        if !path.is_empty() {
            config.database.path = Some(path);
        }
    }
    if let Ok(path) = std::env::var("KILN_CREDENTIAL_DB_PATH") {
        if !path.is_empty() {
            config.database.credentials_path = Some(path);
        }
    }
    if let Ok(size) = std::env::var("KILN_EVENT_QUEUE_SIZE") {
        if let Ok(parsed) = size.parse() {
            config.events.queue_size = parsed;
        }
    }
    if let Ok(ttl) = std::env::var("KILN_QUOTE_CACHE_TTL") {
        if let Ok(parsed) = ttl.parse() {
            config.fulfillment.quote_ttl_seconds = parsed;
        }
    }
    if let Ok(rail) = std::env::var("KILN_DEFAULT_RAIL") {
        if !rail.is_empty() {
            config.billing.default_rail = Some(rail);
        }
    }
}

fn validate(config: &KilnConfig) -> ConfigResult<()> {
    if config.billing.network_fee_percent < 0.0 || config.billing.network_fee_percent > 100.0 {
        return Err(ConfigError::Validation(
            "billing.network_fee_percent must be within 0-100".into(),
        ));
    }
    if config.billing.min_fee > config.billing.max_fee {
        return Err(ConfigError::Validation(
            "billing.min_fee must not exceed billing.max_fee".into(),
        ));
    }
    if config.events.queue_size == 0 {
        return Err(ConfigError::Validation("events.queue_size must be > 0".into()));
    }
    if config.watcher.poll_interval_s <= 0.0 {
        return Err(ConfigError::Validation(
            "watcher.poll_interval_s must be > 0".into(),
        ));
    }
    Ok(())
}
