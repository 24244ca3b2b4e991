//! Daily price history from the Yahoo Finance chart API.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, NaiveDate};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::sink::{write_csv, StorageError};

/// One daily OHLCV bar. Field names match the stock CSV header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockBar {
    #[serde(rename = "Date")]
    pub date: NaiveDate,
    #[serde(rename = "Open")]
    pub open: f64,
    #[serde(rename = "High")]
    pub high: f64,
    #[serde(rename = "Low")]
    pub low: f64,
    #[serde(rename = "Close")]
    pub close: f64,
    #[serde(rename = "Volume")]
    pub volume: u64,
}

#[derive(Debug, Error)]
pub enum StockError {
    #[error("stock request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("stock API error {code}: {description}")]
    Api { code: String, description: String },
    #[error("stock API returned no data for {0}")]
    Empty(String),
}

#[async_trait::async_trait]
pub trait StockSource: Send + Sync {
    /// Bars for `ticker` over `range` (e.g. "5d") at `interval` (e.g. "1d"),
    /// oldest first.
    async fn history(&self, ticker: &str, range: &str, interval: &str) -> Result<Vec<StockBar>, StockError>;
}

pub struct YahooStockSource {
    base_url: String,
    client: Client,
}

impl YahooStockSource {
    pub fn new(base_url: impl Into<String>, timeout_secs: u64) -> Result<Self, StockError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent("Mozilla/5.0")
            .build()?;
        Ok(Self {
            base_url: base_url.into(),
            client,
        })
    }
}

#[async_trait::async_trait]
impl StockSource for YahooStockSource {
    async fn history(&self, ticker: &str, range: &str, interval: &str) -> Result<Vec<StockBar>, StockError> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), ticker);
        let response: YahooResponse = self
            .client
            .get(&url)
            .query(&[("range", range), ("interval", interval)])
            .send()
            .await?
            .json()
            .await?;

        if let Some(error) = response.chart.error {
            return Err(StockError::Api {
                code: error.code,
                description: error.description,
            });
        }

        let data = response
            .chart
            .result
            .and_then(|r| r.into_iter().next())
            .ok_or_else(|| StockError::Empty(ticker.to_string()))?;

        let bars = bars_from_chart(data);
        info!(ticker, bars = bars.len(), range, "fetched stock history");
        Ok(bars)
    }
}

fn bars_from_chart(data: ChartData) -> Vec<StockBar> {
    let offset = data.meta.gmtoffset.unwrap_or(0);
    let timestamps = data.timestamp.unwrap_or_default();
    let Some(quote) = data.indicators.quote.into_iter().next() else {
        return Vec::new();
    };

    let mut bars: Vec<StockBar> = timestamps
        .iter()
        .enumerate()
        .filter_map(|(i, ts)| {
            let date = DateTime::from_timestamp(ts + offset, 0)?.date_naive();
            Some(StockBar {
                date,
                open: (*quote.open.get(i)?)?,
                high: (*quote.high.get(i)?)?,
                low: (*quote.low.get(i)?)?,
                close: (*quote.close.get(i)?)?,
                volume: (*quote.volume.get(i)?)?,
            })
        })
        .collect();
    bars.sort_by_key(|b| b.date);
    bars
}

/// Write bars to `path` with a `Date,Open,High,Low,Close,Volume` header.
pub fn write_stock_csv(path: &Path, bars: &[StockBar]) -> Result<(), StorageError> {
    write_csv(path, bars)?;
    info!(path = %path.display(), rows = bars.len(), "stock CSV written");
    Ok(())
}

/// Bars dated `date`.
pub fn bars_on(bars: &[StockBar], date: NaiveDate) -> Vec<StockBar> {
    bars.iter().filter(|b| b.date == date).cloned().collect()
}

/// Earliest and latest dates present.
pub fn date_span(bars: &[StockBar]) -> Option<(NaiveDate, NaiveDate)> {
    let min = bars.iter().map(|b| b.date).min()?;
    let max = bars.iter().map(|b| b.date).max()?;
    Some((min, max))
}

#[derive(Debug, Deserialize)]
struct YahooResponse {
    chart: ChartResult,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    result: Option<Vec<ChartData>>,
    error: Option<YahooError>,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    meta: ChartMeta,
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct ChartMeta {
    #[serde(default)]
    gmtoffset: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<Quote>,
}

#[derive(Debug, Deserialize)]
struct Quote {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<u64>>,
}

#[derive(Debug, Deserialize)]
struct YahooError {
    code: String,
    description: String,
}
