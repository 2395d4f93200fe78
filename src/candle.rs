//! Candle record, interval enumeration and series helpers.

use crate::error::CacheError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

const MINUTE_MS: i64 = 60 * 1000;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;

/// One OHLCV bar. Field names on disk match the exchange naming so that
/// existing cache files stay readable.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote_volume: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trades: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taker_buy_base_volume: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taker_buy_quote_volume: Option<f64>,
}

impl Candle {
    /// Bare OHLCV candle without the extended exchange fields.
    pub fn new(open_time: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            open_time,
            open,
            high,
            low,
            close,
            volume,
            close_time: None,
            quote_volume: None,
            trades: None,
            taker_buy_base_volume: None,
            taker_buy_quote_volume: None,
        }
    }
}

/// Ordered candles for one (symbol, interval), strictly increasing `open_time`.
pub type Series = Vec<Candle>;

/// Supported k-line intervals. The calendar month is left out on purpose
/// because it has no fixed duration to step a cursor by.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interval {
    #[serde(rename = "1m")]
    Min1,
    #[serde(rename = "3m")]
    Min3,
    #[serde(rename = "5m")]
    Min5,
    #[serde(rename = "15m")]
    Min15,
    #[serde(rename = "30m")]
    Min30,
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "2h")]
    Hour2,
    #[serde(rename = "4h")]
    Hour4,
    #[serde(rename = "6h")]
    Hour6,
    #[serde(rename = "8h")]
    Hour8,
    #[serde(rename = "12h")]
    Hour12,
    #[serde(rename = "1d")]
    Day1,
    #[serde(rename = "3d")]
    Day3,
    #[serde(rename = "1w")]
    Week1,
}

impl Interval {
    pub const ALL: [Interval; 14] = [
        Interval::Min1,
        Interval::Min3,
        Interval::Min5,
        Interval::Min15,
        Interval::Min30,
        Interval::Hour1,
        Interval::Hour2,
        Interval::Hour4,
        Interval::Hour6,
        Interval::Hour8,
        Interval::Hour12,
        Interval::Day1,
        Interval::Day3,
        Interval::Week1,
    ];

    /// Wire string used by the exchange and in cache file names.
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::Min1 => "1m",
            Interval::Min3 => "3m",
            Interval::Min5 => "5m",
            Interval::Min15 => "15m",
            Interval::Min30 => "30m",
            Interval::Hour1 => "1h",
            Interval::Hour2 => "2h",
            Interval::Hour4 => "4h",
            Interval::Hour6 => "6h",
            Interval::Hour8 => "8h",
            Interval::Hour12 => "12h",
            Interval::Day1 => "1d",
            Interval::Day3 => "3d",
            Interval::Week1 => "1w",
        }
    }

    pub fn duration_ms(&self) -> i64 {
        match self {
            Interval::Min1 => MINUTE_MS,
            Interval::Min3 => 3 * MINUTE_MS,
            Interval::Min5 => 5 * MINUTE_MS,
            Interval::Min15 => 15 * MINUTE_MS,
            Interval::Min30 => 30 * MINUTE_MS,
            Interval::Hour1 => HOUR_MS,
            Interval::Hour2 => 2 * HOUR_MS,
            Interval::Hour4 => 4 * HOUR_MS,
            Interval::Hour6 => 6 * HOUR_MS,
            Interval::Hour8 => 8 * HOUR_MS,
            Interval::Hour12 => 12 * HOUR_MS,
            Interval::Day1 => DAY_MS,
            Interval::Day3 => 3 * DAY_MS,
            Interval::Week1 => 7 * DAY_MS,
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Interval::ALL
            .iter()
            .copied()
            .find(|i| i.as_str() == s)
            .ok_or_else(|| CacheError::UnknownInterval(s.to_string()))
    }
}

/// Sorts ascending by `open_time` and keeps one candle per key. When a key
/// repeats, the occurrence latest in the input wins.
pub fn normalize(candles: Vec<Candle>) -> Series {
    let by_time: BTreeMap<i64, Candle> = candles.into_iter().map(|c| (c.open_time, c)).collect();
    by_time.into_values().collect()
}

/// Merges freshly fetched candles into an existing series. Fresh data wins
/// on key collisions.
pub fn merge(existing: Series, fresh: Series) -> Series {
    let mut all = existing;
    all.extend(fresh);
    normalize(all)
}

/// True when the series spans `[start, end]` by open time.
pub fn covers(series: &[Candle], start: i64, end: i64) -> bool {
    match (series.first(), series.last()) {
        (Some(first), Some(last)) => first.open_time <= start && end <= last.open_time,
        _ => false,
    }
}

/// Candles whose open time falls inside `[start, end]`, both ends inclusive.
pub fn slice_range(series: &[Candle], start: i64, end: i64) -> Series {
    series
        .iter()
        .filter(|c| c.open_time >= start && c.open_time <= end)
        .cloned()
        .collect()
}
