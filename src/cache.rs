//! Cache coordinator: serves ranges from disk when fully covered, otherwise
//! fetches, merges and persists.

use crate::candle::{self, Interval, Series};
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::fetcher::{CancelFlag, RangeFetcher};
use crate::klines::{BinanceClient, KlineSource};
use crate::storage::CacheStore;
use crate::Result;
use chrono::{DateTime, Months, Utc};
use std::sync::Arc;
use tracing::{debug, info};

pub struct KlineCache {
    store: CacheStore,
    fetcher: RangeFetcher,
    history_years: u32,
}

impl KlineCache {
    pub fn new(store: CacheStore, fetcher: RangeFetcher, history_years: u32) -> Self {
        Self {
            store,
            fetcher,
            history_years,
        }
    }

    /// Wires the Binance client, the range fetcher and the on-disk store from
    /// one configuration.
    pub async fn from_config(config: &CacheConfig, cancel: Option<CancelFlag>) -> Result<Self> {
        config.validate()?;
        let source: Arc<dyn KlineSource> = Arc::new(BinanceClient::new(config)?);
        let mut fetcher = RangeFetcher::new(source, config);
        if let Some(cancel) = cancel {
            fetcher = fetcher.with_cancel(cancel);
        }
        let store = CacheStore::new(&config.cache_dir, &config.cache_file_suffix).await?;
        Ok(Self::new(store, fetcher, config.history_years))
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Returns candles with open time in `[start_time, end_time]`.
    ///
    /// A fully covered range is answered from disk without any request.
    /// Otherwise exactly `[start_time, end_time]` is fetched, merged into the
    /// cached series (earlier candles outside the window are kept) and the
    /// fetched candles are returned.
    pub async fn fetch_with_cache(
        &self,
        symbol: &str,
        start_time: i64,
        end_time: i64,
        interval: Interval,
    ) -> Result<Series> {
        let cached = self.store.read(symbol, interval).await?;

        if candle::covers(&cached, start_time, end_time) {
            let hit = candle::slice_range(&cached, start_time, end_time);
            debug!(symbol, %interval, candles = hit.len(), "Cache hit");
            return Ok(hit);
        }

        debug!(symbol, %interval, start_time, end_time, cached = cached.len(), "Cache miss");
        let fetched = self
            .fetcher
            .fetch_range(symbol, interval, start_time, end_time)
            .await?;

        let merged = candle::merge(cached, fetched.clone());
        self.store.write(symbol, interval, &merged).await?;
        Ok(fetched)
    }

    /// Extends the cached series up to now.
    pub async fn update(&self, symbol: &str, interval: Interval) -> Result<Series> {
        self.update_at(symbol, interval, Utc::now().timestamp_millis()).await
    }

    /// Extends the cached series up to `now_ms`. An empty cache starts
    /// `history_years` back. The store is only written after the fetch
    /// succeeds.
    pub async fn update_at(&self, symbol: &str, interval: Interval, now_ms: i64) -> Result<Series> {
        let cached = self.store.read(symbol, interval).await?;

        let range_start = match cached.last() {
            Some(last) => last.open_time,
            None => years_before(now_ms, self.history_years)?,
        };

        let fresh = self
            .fetcher
            .fetch_range(symbol, interval, range_start, now_ms)
            .await?;
        let fetched = fresh.len();

        let merged = candle::merge(cached, fresh);
        self.store.write(symbol, interval, &merged).await?;

        info!(symbol, %interval, fetched, total = merged.len(), "Cache updated");
        Ok(merged)
    }

    /// Backfills `history_years` of candles ending now.
    pub async fn initialize(&self, symbol: &str, interval: Interval) -> Result<Series> {
        self.initialize_at(symbol, interval, Utc::now().timestamp_millis()).await
    }

    pub async fn initialize_at(&self, symbol: &str, interval: Interval, now_ms: i64) -> Result<Series> {
        let start = years_before(now_ms, self.history_years)?;
        self.fetch_with_cache(symbol, start, now_ms, interval).await
    }
}

/// Calendar subtraction, so leap days are accounted for.
pub fn years_before(now_ms: i64, years: u32) -> Result<i64> {
    DateTime::<Utc>::from_timestamp_millis(now_ms)
        .and_then(|now| now.checked_sub_months(Months::new(years.saturating_mul(12))))
        .map(|start| start.timestamp_millis())
        .ok_or_else(|| CacheError::Config(format!("cannot go back {} years from {}", years, now_ms)))
}
