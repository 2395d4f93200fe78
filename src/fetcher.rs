//! Chunked range fetch: walks a cursor across `[start, end)` one page at a
//! time and returns a sorted, de-duplicated series.

use crate::candle::{self, Candle, Interval, Series};
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::klines::KlineSource;
use crate::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Shared cancellation flag. Checked before each chunk request and raced
/// against every sleep in the fetch loop.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        loop {
            // Register before checking so a concurrent cancel is not missed.
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

pub struct RangeFetcher {
    source: Arc<dyn KlineSource>,
    chunk_size: u32,
    rate_limit_delay: Duration,
    retry_delay: Duration,
    max_retry_delay: Duration,
    max_chunk_retries: u32,
    cancel: Option<CancelFlag>,
}

impl RangeFetcher {
    pub fn new(source: Arc<dyn KlineSource>, config: &CacheConfig) -> Self {
        Self {
            source,
            chunk_size: config.chunk_size,
            rate_limit_delay: config.rate_limit_delay(),
            retry_delay: config.retry_delay(),
            max_retry_delay: config.max_retry_delay(),
            max_chunk_retries: config.max_chunk_retries,
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Fetches every candle with open time in `[start_time, end_time]`.
    /// Chunks are requested strictly in order, one at a time.
    pub async fn fetch_range(
        &self,
        symbol: &str,
        interval: Interval,
        start_time: i64,
        end_time: i64,
    ) -> Result<Series> {
        if start_time >= end_time {
            return Ok(Vec::new());
        }

        let step = interval.duration_ms();
        let chunk_width = i64::from(self.chunk_size) * step;
        let mut all_klines: Vec<Candle> = Vec::new();
        let mut cursor = start_time;
        let mut requests = 0usize;

        while cursor < end_time {
            let chunk_end = cursor.saturating_add(chunk_width).min(end_time);
            let klines = self.fetch_chunk(symbol, interval, cursor, chunk_end).await?;
            requests += 1;

            let Some(last) = klines.last() else {
                // No trades in this window; skip a full chunk.
                cursor = cursor.saturating_add(chunk_width);
                debug!(symbol, %interval, cursor, "Empty chunk, advancing cursor");
                continue;
            };

            // Never step backwards, even if the source returns stale rows.
            cursor = last
                .open_time
                .saturating_add(step)
                .max(cursor.saturating_add(step));
            all_klines.extend(klines);

            self.pause(self.rate_limit_delay).await?;
        }

        let series = candle::normalize(all_klines);
        info!(
            symbol,
            %interval,
            requests,
            candles = series.len(),
            "Fetched range"
        );
        Ok(series)
    }

    /// One chunk with bounded exponential backoff. After the last retry the
    /// underlying error is returned unchanged.
    async fn fetch_chunk(
        &self,
        symbol: &str,
        interval: Interval,
        start: i64,
        end: i64,
    ) -> Result<Vec<Candle>> {
        let mut delay = self.retry_delay;
        let mut attempt = 0u32;

        loop {
            if self.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
                return Err(CacheError::Cancelled);
            }

            match self
                .source
                .fetch_page(symbol, interval, self.chunk_size, Some(start), Some(end))
                .await
            {
                Ok(klines) => return Ok(klines),
                // Retrying cannot fix a bad request or undo a cancel.
                Err(e @ (CacheError::Config(_) | CacheError::Cancelled)) => return Err(e),
                Err(e) if attempt < self.max_chunk_retries => {
                    attempt += 1;
                    warn!(
                        symbol,
                        start,
                        attempt,
                        max = self.max_chunk_retries,
                        error = %e,
                        "Error fetching chunk, retrying"
                    );
                    self.pause(delay).await?;
                    delay = (delay * 2).min(self.max_retry_delay);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Sleeps for `delay`, cut short with `Cancelled` if the flag is raised.
    async fn pause(&self, delay: Duration) -> Result<()> {
        match &self.cancel {
            Some(cancel) => tokio::select! {
                _ = tokio::time::sleep(delay) => Ok(()),
                _ = cancel.cancelled() => Err(CacheError::Cancelled),
            },
            None => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }
}
