//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/ctxreport/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/ctxreport/` (~/.config/ctxreport/)
//! - Data: `$XDG_DATA_HOME/ctxreport/` (~/.local/share/ctxreport/)
//! - State/Logs: `$XDG_STATE_HOME/ctxreport/` (~/.local/state/ctxreport/)

use crate::error::{Error, Result};
use crate::source::{RefreshDelay, SourceConfig};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Remote collector configuration
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Local sample storage
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Per-source settings
    #[serde(default)]
    pub sources: SourcesConfig,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Local sample storage configuration
#[derive(Debug, Deserialize, Default, Clone)]
pub struct StorageConfig {
    /// Override for the SQLite database path
    pub database_path: Option<PathBuf>,

    /// Skip the database and buffer samples in memory only
    #[serde(default)]
    pub in_memory: bool,
}

/// Remote context collector configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CollectorConfig {
    /// Context collector endpoint receiving report batches
    #[serde(default = "default_collector_endpoint")]
    pub endpoint: String,

    /// Bearer token used when no session has been established in-process
    pub token: Option<String>,

    /// Milliseconds to wait after a report cycle completes before the next one
    #[serde(default = "default_report_delay")]
    pub report_delay_ms: u64,

    /// HTTP request timeout in seconds
    #[serde(default = "default_collector_timeout")]
    pub timeout_secs: u64,

    /// Max retry attempts for transient failures within one report cycle
    #[serde(default = "default_collector_max_retries")]
    pub max_retries: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            endpoint: default_collector_endpoint(),
            token: None,
            report_delay_ms: default_report_delay(),
            timeout_secs: default_collector_timeout(),
            max_retries: default_collector_max_retries(),
        }
    }
}

impl CollectorConfig {
    /// Delay between report cycles
    pub fn report_delay(&self) -> Duration {
        Duration::from_millis(self.report_delay_ms)
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        let endpoint = self.endpoint.trim();
        if endpoint.is_empty() {
            return Err(Error::Config("collector.endpoint is required".to_string()));
        }
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(Error::Config(format!(
                "collector.endpoint must be an http(s) URL, got {:?}",
                endpoint
            )));
        }
        if self.report_delay_ms == 0 {
            return Err(Error::Config(
                "collector.report_delay_ms must be greater than 0".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(Error::Config(
                "collector.timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_collector_endpoint() -> String {
    "https://gateway.flybits.com/ctxdata".to_string()
}

fn default_report_delay() -> u64 {
    60_000
}

fn default_collector_timeout() -> u64 {
    30
}

fn default_collector_max_retries() -> usize {
    2
}

/// Settings for every built-in source
#[derive(Debug, Deserialize, Default)]
pub struct SourcesConfig {
    #[serde(default)]
    pub network: NetworkSourceConfig,

    #[serde(default)]
    pub location: LocationSourceConfig,
}

/// Buffering and polling knobs shared by all sources
#[derive(Debug, Deserialize, Clone)]
pub struct SourceSettings {
    /// Polling interval in milliseconds, or `"once"`
    #[serde(default)]
    pub refresh_delay: RefreshDelay,

    /// Entry count that triggers eviction
    #[serde(default = "default_max_store_size")]
    pub max_store_size: usize,

    /// Entries older than this are evicted
    #[serde(default = "default_max_store_age")]
    pub max_store_age_ms: u64,

    /// Abort a single collection after this many milliseconds
    pub collect_timeout_ms: Option<u64>,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            refresh_delay: RefreshDelay::default(),
            max_store_size: default_max_store_size(),
            max_store_age_ms: default_max_store_age(),
            collect_timeout_ms: None,
        }
    }
}

impl SourceSettings {
    /// Build the immutable source configuration
    pub fn to_source_config(&self) -> Result<SourceConfig> {
        if self.max_store_size == 0 {
            return Err(Error::Config(
                "max_store_size must be greater than 0".to_string(),
            ));
        }
        let mut config = SourceConfig::default()
            .with_refresh_delay(self.refresh_delay)
            .with_max_store_size(self.max_store_size)
            .with_max_store_age(Duration::from_millis(self.max_store_age_ms));
        if let Some(ms) = self.collect_timeout_ms {
            config = config.with_collect_timeout(Duration::from_millis(ms));
        }
        Ok(config)
    }
}

fn default_max_store_size() -> usize {
    80
}

fn default_max_store_age() -> u64 {
    86_400_000
}

/// Network connectivity source settings
#[derive(Debug, Deserialize, Clone)]
pub struct NetworkSourceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(flatten)]
    pub settings: SourceSettings,

    /// Probe with an HTTP request to `ping_url` instead of a TCP connect
    #[serde(default)]
    pub hard_check: bool,

    /// URL used by the hard check
    #[serde(default = "default_ping_url")]
    pub ping_url: String,

    /// `host:port` used by the soft check
    #[serde(default = "default_probe_addr")]
    pub probe_addr: String,
}

impl Default for NetworkSourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            settings: SourceSettings::default(),
            hard_check: false,
            ping_url: default_ping_url(),
            probe_addr: default_probe_addr(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_ping_url() -> String {
    "http://tenant.flybits.com/v2/ping".to_string()
}

fn default_probe_addr() -> String {
    "1.1.1.1:443".to_string()
}

/// Location source settings
///
/// Hosts without a platform geolocation API can report a fixed position.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct LocationSourceConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(flatten)]
    pub settings: SourceSettings,

    /// Fixed latitude reported by the static provider
    pub latitude: Option<f64>,

    /// Fixed longitude reported by the static provider
    pub longitude: Option<f64>,

    /// Accuracy radius in meters
    pub accuracy: Option<f64>,

    /// Oldest cached position the provider may return, in milliseconds
    pub maximum_age_ms: Option<u64>,
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/ctxreport/config.toml` (~/.config/ctxreport/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("ctxreport").join("config.toml")
    }

    /// Returns the data directory path (for SQLite database)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("ctxreport")
    }

    /// Returns the state directory path (for logs)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("ctxreport")
    }

    /// Returns the sample database path, honoring `storage.database_path`
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("samples.db"))
    }

    /// Returns the log file path
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("ctxreport.log")
    }
}
