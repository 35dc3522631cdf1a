//! Engine configuration.
//!
//! Each component reads one section. Values left at zero or empty are replaced
//! by engine defaults in that section's `resolve()`, so the default policy lives
//! in exactly one place per component.

use crate::data::error::{DataError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CACHE_ROOT: &str = "./data";
pub const DEFAULT_EXCHANGE: &str = "binance";
pub const DEFAULT_MARKET: &str = "futures-um";

pub const DEFAULT_BASE_URL: &str = "https://data.binance.vision";
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 4;

pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;
pub const DEFAULT_MAX_MEMORY_MB: u64 = 1_024;

pub const DEFAULT_MAX_PRICE_DEVIATION_PCT: f64 = 50.0;
pub const DEFAULT_MAX_VOLUME_DEVIATION_PCT: f64 = 1_000.0;
pub const DEFAULT_MAX_TIME_GAP_MS: i64 = 300_000;

/// Top-level configuration, one section per component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub download: DownloadConfig,
    pub stream: StreamConfig,
    pub validation: ValidationConfig,
}

impl EngineConfig {
    /// Load a configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| DataError::io(path, e))?;
        Self::from_toml(&content)
    }

    /// Parse a configuration from a TOML string. Missing sections and keys take
    /// their zero value and are defaulted by `resolve()`.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| DataError::Config(format!("parse TOML: {e}")))
    }

    /// Apply engine defaults to every section.
    pub fn resolve(self) -> Self {
        Self {
            cache: self.cache.resolve(),
            download: self.download.resolve(),
            stream: self.stream.resolve(),
            validation: self.validation.resolve(),
        }
    }
}

/// Cache location and layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub root: PathBuf,
    pub exchange: String,
    pub market: String,
}

impl CacheConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
        .resolve()
    }

    pub fn resolve(self) -> Self {
        Self {
            root: if self.root.as_os_str().is_empty() {
                PathBuf::from(DEFAULT_CACHE_ROOT)
            } else {
                self.root
            },
            exchange: non_empty_or(self.exchange, DEFAULT_EXCHANGE),
            market: non_empty_or(self.market, DEFAULT_MARKET),
        }
    }
}

/// Downloader behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub base_url: String,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub timeout_secs: u64,
    pub max_concurrent_downloads: usize,
    pub verify_checksum: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            max_retries: 0,
            retry_delay_ms: 0,
            timeout_secs: 0,
            max_concurrent_downloads: 0,
            verify_checksum: true,
        }
    }
}

impl DownloadConfig {
    /// Apply defaults. A `max_retries` of zero counts as unset.
    pub fn resolve(self) -> Self {
        Self {
            base_url: non_empty_or(self.base_url, DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            max_retries: non_zero_or(self.max_retries, DEFAULT_MAX_RETRIES),
            retry_delay_ms: non_zero_or(self.retry_delay_ms, DEFAULT_RETRY_DELAY_MS),
            timeout_secs: non_zero_or(self.timeout_secs, DEFAULT_TIMEOUT_SECS),
            max_concurrent_downloads: non_zero_or(
                self.max_concurrent_downloads,
                DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            ),
            verify_checksum: self.verify_checksum,
        }
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Streaming reader behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub buffer_size: usize,
    pub max_memory_mb: u64,
    pub enable_metrics: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_size: 0,
            max_memory_mb: 0,
            enable_metrics: true,
        }
    }
}

impl StreamConfig {
    pub fn resolve(self) -> Self {
        Self {
            buffer_size: non_zero_or(self.buffer_size, DEFAULT_BUFFER_SIZE),
            max_memory_mb: non_zero_or(self.max_memory_mb, DEFAULT_MAX_MEMORY_MB),
            enable_metrics: self.enable_metrics,
        }
    }
}

/// Batch validation thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub max_price_deviation_pct: f64,
    pub max_volume_deviation_pct: f64,
    pub max_time_gap_ms: i64,
    pub require_monotonic_time: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_price_deviation_pct: 0.0,
            max_volume_deviation_pct: 0.0,
            max_time_gap_ms: 0,
            require_monotonic_time: true,
        }
    }
}

impl ValidationConfig {
    pub fn resolve(self) -> Self {
        Self {
            max_price_deviation_pct: positive_or(
                self.max_price_deviation_pct,
                DEFAULT_MAX_PRICE_DEVIATION_PCT,
            ),
            max_volume_deviation_pct: positive_or(
                self.max_volume_deviation_pct,
                DEFAULT_MAX_VOLUME_DEVIATION_PCT,
            ),
            max_time_gap_ms: if self.max_time_gap_ms > 0 {
                self.max_time_gap_ms
            } else {
                DEFAULT_MAX_TIME_GAP_MS
            },
            require_monotonic_time: self.require_monotonic_time,
        }
    }
}

fn non_empty_or(value: String, default: &str) -> String {
    if value.trim().is_empty() {
        default.to_string()
    } else {
        value
    }
}

fn non_zero_or<T: PartialEq + Default>(value: T, default: T) -> T {
    if value == T::default() {
        default
    } else {
        value
    }
}

fn positive_or(value: f64, default: f64) -> f64 {
    if value > 0.0 {
        value
    } else {
        default
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_resolves_to_defaults() {
        let cfg = EngineConfig::default().resolve();
        assert_eq!(cfg.cache.root, PathBuf::from(DEFAULT_CACHE_ROOT));
        assert_eq!(cfg.cache.exchange, "binance");
        assert_eq!(cfg.download.base_url, DEFAULT_BASE_URL);
        assert_eq!(cfg.download.max_retries, 3);
        assert_eq!(cfg.download.retry_delay(), Duration::from_secs(1));
        assert_eq!(cfg.download.timeout(), Duration::from_secs(30));
        assert!(cfg.download.verify_checksum);
        assert_eq!(cfg.stream.buffer_size, 64 * 1024);
        assert_eq!(cfg.stream.max_memory_mb, 1_024);
        assert_eq!(cfg.validation.max_price_deviation_pct, 50.0);
        assert_eq!(cfg.validation.max_volume_deviation_pct, 1_000.0);
        assert_eq!(cfg.validation.max_time_gap_ms, 300_000);
        assert!(cfg.validation.require_monotonic_time);
    }

    #[test]
    fn explicit_values_survive_resolve() {
        let cfg = DownloadConfig {
            base_url: "http://127.0.0.1:9000/".into(),
            max_retries: 1,
            retry_delay_ms: 5,
            timeout_secs: 2,
            max_concurrent_downloads: 8,
            verify_checksum: false,
        }
        .resolve();
        assert_eq!(cfg.base_url, "http://127.0.0.1:9000");
        assert_eq!(cfg.max_retries, 1);
        assert_eq!(cfg.retry_delay_ms, 5);
        assert_eq!(cfg.max_concurrent_downloads, 8);
        assert!(!cfg.verify_checksum);
    }

    #[test]
    fn negative_thresholds_fall_back_to_defaults() {
        let cfg = ValidationConfig {
            max_price_deviation_pct: -1.0,
            max_volume_deviation_pct: 0.0,
            max_time_gap_ms: -5,
            require_monotonic_time: false,
        }
        .resolve();
        assert_eq!(cfg.max_price_deviation_pct, 50.0);
        assert_eq!(cfg.max_time_gap_ms, 300_000);
        assert!(!cfg.require_monotonic_time);
    }

    #[test]
    fn parses_partial_toml() {
        let cfg = EngineConfig::from_toml(
            r#"
            [download]
            max_retries = 5
            verify_checksum = false

            [stream]
            max_memory_mb = 256
            "#,
        )
        .unwrap()
        .resolve();

        assert_eq!(cfg.download.max_retries, 5);
        assert!(!cfg.download.verify_checksum);
        assert_eq!(cfg.download.timeout_secs, 30);
        assert_eq!(cfg.stream.max_memory_mb, 256);
        assert!(cfg.stream.enable_metrics);
        assert!(cfg.validation.require_monotonic_time);
    }

    #[test]
    fn malformed_toml_is_config_error() {
        let err = EngineConfig::from_toml("[download\nmax_retries = ").unwrap_err();
        assert!(matches!(err, DataError::Config(_)));
    }
}
