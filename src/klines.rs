//! Remote k-line source: one paged request against the exchange REST API,
//! translated from positional rows into named [`Candle`] records.

use crate::candle::{Candle, Interval};
use crate::config::{CacheConfig, MAX_PAGE_SIZE};
use crate::error::CacheError;
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// Positions of the fields inside one wire row.
const KLINE_KEYS: &[&str] = &[
    "openTime",
    "open",
    "high",
    "low",
    "close",
    "volume",
    "closeTime",
    "quoteVolume",
    "trades",
    "takerBuyBaseVolume",
    "takerBuyQuoteVolume",
    "ignore",
];

/// Abstract interface for fetching one page of candles.
#[async_trait]
pub trait KlineSource: Send + Sync {
    async fn fetch_page(
        &self,
        symbol: &str,
        interval: Interval,
        limit: u32,
        start_time: Option<i64>,
        end_time: Option<i64>,
    ) -> Result<Vec<Candle>>;
}

/// Binance spot `/klines` client.
pub struct BinanceClient {
    client: Client,
    base_url: String,
    page_retries: u32,
    page_retry_delay: Duration,
    ban_until: Regex,
}

impl BinanceClient {
    pub fn new(config: &CacheConfig) -> Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(4)
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| CacheError::Config(format!("http client: {}", e)))?;
        let ban_until = Regex::new(r"until\s+(\d+)").map_err(|e| CacheError::Config(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            page_retries: config.page_retries,
            page_retry_delay: config.page_retry_delay(),
            ban_until,
        })
    }

    /// Sends one request and returns the raw body text.
    async fn request(&self, query: &[(&str, String)]) -> Result<String> {
        let url = format!("{}/klines", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| CacheError::FetchFailed(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| CacheError::FetchFailed(e.to_string()))?;

        if status == StatusCode::IM_A_TEAPOT || status == StatusCode::TOO_MANY_REQUESTS {
            self.wait_for_ban(&text).await;
            return Err(CacheError::FetchFailed(format!("rate limited ({}): {}", status, text)));
        }

        if !status.is_success() {
            return Err(CacheError::FetchFailed(format!("API response error ({}): {}", status, text)));
        }

        Ok(text)
    }

    /// An IP ban (-1003) names the epoch ms it lifts at. Sleep past it so the
    /// caller's retry does not extend the ban.
    async fn wait_for_ban(&self, body: &str) {
        if !body.contains("-1003") {
            return;
        }
        let Some(ban_until) = self
            .ban_until
            .captures(body)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<i64>().ok())
        else {
            return;
        };

        let now = Utc::now().timestamp_millis();
        if ban_until > now {
            let wait_sec = ((ban_until - now) as f64 / 1000.0) + 5.0;
            warn!(wait_sec, "IP banned by exchange, waiting for the ban to lift");
            tokio::time::sleep(Duration::from_secs_f64(wait_sec)).await;
        }
    }
}

#[async_trait]
impl KlineSource for BinanceClient {
    async fn fetch_page(
        &self,
        symbol: &str,
        interval: Interval,
        limit: u32,
        start_time: Option<i64>,
        end_time: Option<i64>,
    ) -> Result<Vec<Candle>> {
        if symbol.is_empty() {
            return Err(CacheError::Config("symbol must not be empty".to_string()));
        }
        if limit == 0 || limit > MAX_PAGE_SIZE {
            return Err(CacheError::Config(format!(
                "limit must be within 1..={}, got {}",
                MAX_PAGE_SIZE, limit
            )));
        }

        let mut query = vec![
            ("symbol", symbol.to_string()),
            ("interval", interval.to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(start) = start_time {
            query.push(("startTime", start.to_string()));
        }
        if let Some(end) = end_time {
            query.push(("endTime", end.to_string()));
        }

        let mut body = self.request(&query).await?;
        let mut retries = self.page_retries;
        while retries > 0 && is_empty_body(&body) {
            tokio::time::sleep(self.page_retry_delay).await;
            body = self.request(&query).await?;
            retries -= 1;
        }
        if is_empty_body(&body) {
            return Err(CacheError::FetchFailed(
                "empty response body after retries".to_string(),
            ));
        }

        let rows: Vec<Vec<Value>> = serde_json::from_str(&body)
            .map_err(|e| CacheError::FetchFailed(format!("unexpected response shape: {}", e)))?;
        let candles = parse_rows(rows)?;

        debug!(
            symbol,
            %interval,
            count = candles.len(),
            first = candles.first().map(|c| c.open_time),
            last = candles.last().map(|c| c.open_time),
            "Fetched klines"
        );
        Ok(candles)
    }
}

fn is_empty_body(body: &str) -> bool {
    let trimmed = body.trim();
    trimmed.is_empty() || trimmed == "null"
}

/// Translates positional wire rows into candles. A single invalid row fails
/// the whole page.
pub fn parse_rows(rows: Vec<Vec<Value>>) -> Result<Vec<Candle>> {
    rows.iter()
        .enumerate()
        .map(|(index, row)| parse_row(index, row))
        .collect()
}

fn parse_row(index: usize, row: &[Value]) -> Result<Candle> {
    let required_f64 = |pos: usize| -> Result<f64> {
        let value = row.get(pos).and_then(as_f64).ok_or_else(|| CacheError::InvalidData {
            index,
            reason: format!("field `{}` is missing or not numeric", KLINE_KEYS[pos]),
        })?;
        if !value.is_finite() {
            return Err(CacheError::InvalidData {
                index,
                reason: format!("field `{}` is not finite", KLINE_KEYS[pos]),
            });
        }
        Ok(value)
    };

    let open_time = row.get(0).and_then(as_i64).ok_or_else(|| CacheError::InvalidData {
        index,
        reason: format!("field `{}` is missing or not an integer", KLINE_KEYS[0]),
    })?;

    Ok(Candle {
        open_time,
        open: required_f64(1)?,
        high: required_f64(2)?,
        low: required_f64(3)?,
        close: required_f64(4)?,
        volume: required_f64(5)?,
        close_time: row.get(6).and_then(as_i64),
        quote_volume: row.get(7).and_then(as_f64),
        trades: row.get(8).and_then(as_i64).and_then(|t| u64::try_from(t).ok()),
        taker_buy_base_volume: row.get(9).and_then(as_f64),
        taker_buy_quote_volume: row.get(10).and_then(as_f64),
    })
}

// The exchange sends prices as strings and times as numbers; accept either.

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) if !s.trim().is_empty() => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}
