use async_trait::async_trait;
use kline_cache::cache::years_before;
use kline_cache::{
    CacheConfig, CacheError, CacheStore, CancelFlag, Candle, Interval, KlineCache, KlineSource,
    RangeFetcher, Series,
};
use std::sync::{Arc, Mutex};
use tempfile::{TempDir, tempdir};

const HOUR: i64 = 3_600_000;
// 2024-01-01T00:00:00Z
const NOW: i64 = 1_704_067_200_000;

/// In-memory exchange with one candle per interval between `first_open` and
/// `last_open`. Mirrors the REST endpoint: inclusive bounds, capped at `limit`.
struct SimulatedExchange {
    first_open: i64,
    last_open: i64,
    fail_with: Option<fn() -> CacheError>,
    calls: Mutex<Vec<(i64, i64)>>,
}

impl SimulatedExchange {
    fn new(first_open: i64, last_open: i64) -> Self {
        Self {
            first_open,
            last_open,
            fail_with: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn failing(fail_with: fn() -> CacheError) -> Self {
        Self {
            fail_with: Some(fail_with),
            ..Self::new(0, NOW)
        }
    }

    fn calls(&self) -> Vec<(i64, i64)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl KlineSource for SimulatedExchange {
    async fn fetch_page(
        &self,
        _symbol: &str,
        interval: Interval,
        limit: u32,
        start_time: Option<i64>,
        end_time: Option<i64>,
    ) -> kline_cache::Result<Vec<Candle>> {
        let start = start_time.unwrap_or(self.first_open);
        let end = end_time.unwrap_or(self.last_open);
        self.calls.lock().unwrap().push((start, end));

        if let Some(fail_with) = self.fail_with {
            return Err(fail_with());
        }

        let step = interval.duration_ms();
        let lower = start.max(self.first_open);
        let mut t = (lower + step - 1).div_euclid(step) * step;
        let mut page = Vec::new();
        while t <= end && t <= self.last_open && page.len() < limit as usize {
            page.push(candle(t, 100.0));
            t += step;
        }
        Ok(page)
    }
}

fn candle(open_time: i64, close: f64) -> Candle {
    Candle::new(open_time, close, close + 1.0, close - 1.0, close, 50.0)
}

fn hourly(from: i64, to: i64, close: f64) -> Series {
    (from..=to).map(|h| candle(h * HOUR, close)).collect()
}

fn test_config(dir: &TempDir) -> CacheConfig {
    CacheConfig {
        cache_dir: dir.path().to_path_buf(),
        rate_limit_delay_ms: 0,
        retry_delay_ms: 0,
        max_retry_delay_ms: 0,
        max_chunk_retries: 1,
        ..CacheConfig::default()
    }
}

async fn build_cache(
    config: &CacheConfig,
    source: Arc<SimulatedExchange>,
    cancel: Option<CancelFlag>,
) -> KlineCache {
    let store = CacheStore::new(&config.cache_dir, &config.cache_file_suffix)
        .await
        .unwrap();
    let mut fetcher = RangeFetcher::new(source, config);
    if let Some(cancel) = cancel {
        fetcher = fetcher.with_cancel(cancel);
    }
    KlineCache::new(store, fetcher, config.history_years)
}

#[tokio::test]
async fn covered_range_is_served_without_network() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir);
    let exchange = Arc::new(SimulatedExchange::new(0, NOW));
    let cache = build_cache(&config, exchange.clone(), None).await;

    cache
        .store()
        .write("SOLUSDT", Interval::Hour1, &hourly(10, 20, 5.0))
        .await
        .unwrap();

    let hit = cache
        .fetch_with_cache("SOLUSDT", 12 * HOUR, 15 * HOUR, Interval::Hour1)
        .await
        .unwrap();
    let times: Vec<i64> = hit.iter().map(|c| c.open_time / HOUR).collect();
    assert_eq!(times, vec![12, 13, 14, 15]);

    // Exact bounds of the cached series are still a hit.
    cache
        .fetch_with_cache("SOLUSDT", 10 * HOUR, 20 * HOUR, Interval::Hour1)
        .await
        .unwrap();
    assert!(exchange.calls().is_empty());
}

#[tokio::test]
async fn partial_coverage_refetches_requested_range_and_merges() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir);
    let exchange = Arc::new(SimulatedExchange::new(0, NOW));
    let cache = build_cache(&config, exchange.clone(), None).await;

    cache
        .store()
        .write("SOLUSDT", Interval::Hour1, &hourly(10, 20, 5.0))
        .await
        .unwrap();

    let fetched = cache
        .fetch_with_cache("SOLUSDT", 5 * HOUR, 15 * HOUR, Interval::Hour1)
        .await
        .unwrap();
    assert_eq!(fetched.len(), 11);
    assert_eq!(exchange.calls(), vec![(5 * HOUR, 15 * HOUR)]);

    // Candles after the requested window survive the miss.
    let stored = cache.store().read("SOLUSDT", Interval::Hour1).await.unwrap();
    assert_eq!(stored.first().unwrap().open_time, 5 * HOUR);
    assert_eq!(stored.last().unwrap().open_time, 20 * HOUR);
    assert_eq!(stored.len(), 16);
    // Overlap was replaced by the freshly fetched values.
    assert_eq!(stored[5].close, 100.0);
    assert_eq!(stored[15].close, 5.0);
}

#[tokio::test]
async fn update_on_empty_cache_backfills_history_then_only_fetches_tail() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir);
    let exchange = Arc::new(SimulatedExchange::new(0, NOW));
    let cache = build_cache(&config, exchange.clone(), None).await;

    let start = years_before(NOW, 9).unwrap();
    let expected = ((NOW - start) / HOUR + 1) as usize;

    let series = cache.update_at("SOLUSDT", Interval::Hour1, NOW).await.unwrap();
    assert_eq!(series.len(), expected);
    assert_eq!(series.first().unwrap().open_time, start);
    assert_eq!(series.last().unwrap().open_time, NOW);
    assert!(series.windows(2).all(|w| w[0].open_time < w[1].open_time));

    let chunk = config.chunk_size as usize;
    let calls = exchange.calls();
    assert_eq!(calls.len(), expected.div_ceil(chunk));
    assert_eq!(calls[0], (start, start + chunk as i64 * HOUR));

    let persisted = cache.store().read("SOLUSDT", Interval::Hour1).await.unwrap();
    assert_eq!(persisted.len(), expected);

    // Ten minutes later no new candle has opened yet.
    let again = cache
        .update_at("SOLUSDT", Interval::Hour1, NOW + 10 * 60 * 1000)
        .await
        .unwrap();
    assert_eq!(again.len(), expected);
    assert_eq!(exchange.calls().len(), calls.len() + 1);
}

#[tokio::test]
async fn update_appends_new_candles() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir);
    let exchange = Arc::new(SimulatedExchange::new(0, 30 * HOUR));
    let cache = build_cache(&config, exchange.clone(), None).await;

    cache
        .store()
        .write("SOLUSDT", Interval::Hour1, &hourly(10, 20, 5.0))
        .await
        .unwrap();

    let merged = cache.update_at("SOLUSDT", Interval::Hour1, 30 * HOUR).await.unwrap();
    assert_eq!(merged.len(), 21);
    assert_eq!(merged.last().unwrap().open_time, 30 * HOUR);
    assert_eq!(exchange.calls()[0].0, 20 * HOUR);
}

#[tokio::test]
async fn failed_update_leaves_store_untouched() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir);
    let exchange = Arc::new(SimulatedExchange::failing(|| CacheError::InvalidData {
        index: 0,
        reason: "field `close` is not finite".to_string(),
    }));
    let cache = build_cache(&config, exchange.clone(), None).await;

    let original = hourly(10, 20, 5.0);
    cache
        .store()
        .write("SOLUSDT", Interval::Hour1, &original)
        .await
        .unwrap();

    let err = cache
        .update_at("SOLUSDT", Interval::Hour1, 40 * HOUR)
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::InvalidData { .. }));
    // One attempt plus one retry.
    assert_eq!(exchange.calls().len(), 2);

    let stored = cache.store().read("SOLUSDT", Interval::Hour1).await.unwrap();
    assert_eq!(stored, original);
}

#[tokio::test]
async fn cancelled_update_writes_nothing() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir);
    let exchange = Arc::new(SimulatedExchange::new(0, NOW));
    let cancel = CancelFlag::new();
    let cache = build_cache(&config, exchange.clone(), Some(cancel.clone())).await;

    cancel.cancel();
    let err = cache
        .update_at("SOLUSDT", Interval::Hour1, NOW)
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::Cancelled));
    assert!(exchange.calls().is_empty());
    assert!(!cache.store().path_for("SOLUSDT", Interval::Hour1).exists());
}

#[tokio::test]
async fn corrupt_cache_propagates() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir);
    let exchange = Arc::new(SimulatedExchange::new(0, NOW));
    let cache = build_cache(&config, exchange.clone(), None).await;

    std::fs::write(cache.store().path_for("SOLUSDT", Interval::Min15), "{ oops").unwrap();

    let err = cache.update_at("SOLUSDT", Interval::Min15, NOW).await.unwrap_err();
    assert!(matches!(err, CacheError::CorruptCache { .. }));
    assert!(exchange.calls().is_empty());
}

#[tokio::test]
async fn initialize_backfills_and_second_run_hits_cache() {
    let dir = tempdir().unwrap();
    let config = CacheConfig {
        history_years: 1,
        ..test_config(&dir)
    };
    let exchange = Arc::new(SimulatedExchange::new(0, NOW));
    let cache = build_cache(&config, exchange.clone(), None).await;

    let first = cache.initialize_at("SOLUSDT", Interval::Day1, NOW).await.unwrap();
    // 2023 has 365 days; both ends are included.
    assert_eq!(first.len(), 366);
    let requests = exchange.calls().len();
    assert_eq!(requests, 1);

    let second = cache.initialize_at("SOLUSDT", Interval::Day1, NOW).await.unwrap();
    assert_eq!(second, first);
    assert_eq!(exchange.calls().len(), requests);
}
