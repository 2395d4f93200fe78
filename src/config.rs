use crate::candle::Interval;
use crate::error::CacheError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// Largest page the spot k-line endpoint accepts.
pub const MAX_PAGE_SIZE: u32 = 1000;

// CONFIGURATION STRUCT
// Every field has a default, so a config file only needs the keys it overrides.

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub cache_dir: PathBuf,
    pub cache_file_suffix: String, // e.g., "klines_cache.json"
    pub base_url: String,

    pub default_symbol: String,
    pub quote_asset: String, // appended to the base asset given on the command line
    pub default_interval: Interval,

    pub chunk_size: u32, // candles per request
    pub history_years: u32,

    // Delays in milliseconds
    pub rate_limit_delay_ms: u64,
    pub retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub max_chunk_retries: u32,

    pub page_retries: u32,
    pub page_retry_delay_ms: u64,
    pub request_timeout_ms: u64, // per HTTP request, connect included
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("./cache"),
            cache_file_suffix: "klines_cache.json".to_string(),
            base_url: "https://api.binance.com/api/v3".to_string(),
            default_symbol: "SOLUSDT".to_string(),
            quote_asset: "USDT".to_string(),
            default_interval: Interval::Min15,
            chunk_size: MAX_PAGE_SIZE,
            history_years: 9,
            rate_limit_delay_ms: 100,
            retry_delay_ms: 1000,
            max_retry_delay_ms: 30_000,
            max_chunk_retries: 5,
            page_retries: 3,
            page_retry_delay_ms: 1000,
            request_timeout_ms: 10_000,
        }
    }
}

impl CacheConfig {
    /// Reads a JSON config file and validates it.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self, CacheError> {
        let path = path.as_ref();
        let content = fs::read(path).await?;
        let config: CacheConfig = serde_json::from_slice(&content)
            .map_err(|e| CacheError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CacheError> {
        if self.chunk_size == 0 || self.chunk_size > MAX_PAGE_SIZE {
            return Err(CacheError::Config(format!(
                "chunk_size must be within 1..={}, got {}",
                MAX_PAGE_SIZE, self.chunk_size
            )));
        }
        if self.cache_file_suffix.is_empty() {
            return Err(CacheError::Config("cache_file_suffix must not be empty".to_string()));
        }
        if self.request_timeout_ms == 0 {
            return Err(CacheError::Config("request_timeout_ms must be positive".to_string()));
        }
        if self.retry_delay_ms > self.max_retry_delay_ms {
            return Err(CacheError::Config(
                "retry_delay_ms must not exceed max_retry_delay_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Builds the full trading pair from a base asset, e.g. "SOL" -> "SOLUSDT".
    pub fn symbol_for(&self, base: &str) -> String {
        format!("{}{}", base.to_uppercase(), self.quote_asset)
    }

    pub fn rate_limit_delay(&self) -> Duration {
        Duration::from_millis(self.rate_limit_delay_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn page_retry_delay(&self) -> Duration {
        Duration::from_millis(self.page_retry_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
