//! On-disk store: one JSON series file per `(symbol, interval)` key.

use crate::candle::{Interval, Series};
use crate::error::CacheError;
use crate::Result;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Summary of one cached series, as found on disk.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct CachedSeries {
    pub symbol: String,
    pub interval: Interval,
    pub candles: usize,
    pub first_open_time: Option<i64>,
    pub last_open_time: Option<i64>,
}

/// One pretty-printed JSON file per (symbol, interval).
///
/// Writes are whole-file replacements. Nothing serializes concurrent writers
/// to the same key; callers run one writer per key at a time.
pub struct CacheStore {
    // Cache directory, e.g. "./cache"
    pub base_dir: PathBuf,
    suffix: String,
}

impl CacheStore {
    /// Opens the store, creating its directory if needed.
    pub async fn new<P: AsRef<Path>>(base_dir: P, suffix: &str) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        if !base_dir.exists() {
            fs::create_dir_all(&base_dir).await?;
        }

        Ok(Self {
            base_dir,
            suffix: suffix.to_string(),
        })
    }

    pub fn cache_key(symbol: &str, interval: Interval) -> String {
        format!("{}_{}_", symbol, interval)
    }

    pub fn path_for(&self, symbol: &str, interval: Interval) -> PathBuf {
        self.base_dir
            .join(format!("{}{}", Self::cache_key(symbol, interval), self.suffix))
    }

    /// Missing file reads as an empty series.
    pub async fn read(&self, symbol: &str, interval: Interval) -> Result<Series> {
        let path = self.path_for(symbol, interval);

        // serde_json scans the bytes anyway, skip the UTF-8 pass of read_to_string.
        let content = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice(&content).map_err(|source| CacheError::CorruptCache { path, source })
    }

    /// Replaces the stored series. Written to a `.tmp` sibling first and then
    /// renamed, so a crash mid-write leaves the previous file intact.
    pub async fn write(&self, symbol: &str, interval: Interval, series: &Series) -> Result<()> {
        if !self.base_dir.exists() {
            fs::create_dir_all(&self.base_dir).await?;
        }

        let final_path = self.path_for(symbol, interval);
        let mut tmp_name = final_path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        let json_bytes = serde_json::to_vec_pretty(series).map_err(std::io::Error::other)?;

        fs::write(&tmp_path, json_bytes).await?;
        fs::rename(&tmp_path, &final_path).await?;

        debug!(symbol, %interval, candles = series.len(), path = ?final_path, "Saved series");
        Ok(())
    }

    /// Lists every series in the cache directory, sorted by symbol then interval.
    pub async fn list(&self) -> Result<Vec<CachedSeries>> {
        let mut entries = match fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some((symbol, interval)) = self.parse_file_name(name) else {
                debug!(file = name, "Skipping file that is not a cached series");
                continue;
            };

            let series = self.read(&symbol, interval).await?;
            found.push(CachedSeries {
                first_open_time: series.first().map(|c| c.open_time),
                last_open_time: series.last().map(|c| c.open_time),
                candles: series.len(),
                symbol,
                interval,
            });
        }

        found.sort_by(|a, b| {
            a.symbol
                .cmp(&b.symbol)
                .then(a.interval.duration_ms().cmp(&b.interval.duration_ms()))
        });
        Ok(found)
    }

    /// Inverse of `path_for`: "SOLUSDT_1h_klines_cache.json" -> ("SOLUSDT", 1h).
    fn parse_file_name(&self, name: &str) -> Option<(String, Interval)> {
        let key = name.strip_suffix(self.suffix.as_str())?.strip_suffix('_')?;
        let (symbol, interval) = key.rsplit_once('_')?;
        if symbol.is_empty() {
            return None;
        }
        let interval = interval.parse::<Interval>().ok()?;
        Some((symbol.to_string(), interval))
    }
}
