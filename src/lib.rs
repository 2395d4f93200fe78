//! Local on-disk cache of exchange k-line (candlestick) data.
//!
//! Candles are fetched from the Binance REST API in page-sized chunks,
//! de-duplicated by open time and kept as one JSON file per
//! `(symbol, interval)`. [`KlineCache`] answers range queries from disk when
//! the cached series covers them and extends the series incrementally with
//! [`KlineCache::update`].

pub mod cache;
pub mod candle;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod klines;
pub mod report;
pub mod storage;

pub use cache::KlineCache;
pub use candle::{Candle, Interval, Series};
pub use config::CacheConfig;
pub use error::CacheError;
pub use fetcher::{CancelFlag, RangeFetcher};
pub use klines::{BinanceClient, KlineSource};
pub use storage::{CacheStore, CachedSeries};

/// Result type alias
pub type Result<T> = std::result::Result<T, CacheError>;
