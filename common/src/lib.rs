/*!
common/src/lib.rs

Shared configuration types for tickerpulse.

This file provides:
- Config data structures (deserialized from TOML, every section optional)
- An async loader that merges a default file with an override file
- Validation of the few values that would make the tool misbehave
*/

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// News headlines provider section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NewsConfig {
    /// Top-headlines endpoint (NewsAPI compatible)
    pub api_url: String,
    /// Name of the environment variable holding the API key
    pub api_key_env: String,
    /// ISO 3166 country code passed to the provider
    pub country: String,
    pub timeout_seconds: u64,
    /// Total attempts (first try included) on transient failures
    pub max_retries: u32,
}

impl Default for NewsConfig {
    fn default() -> Self {
        Self {
            api_url: "https://newsapi.org/v2/top-headlines".to_string(),
            api_key_env: "NEWSAPI_KEY".to_string(),
            country: "us".to_string(),
            timeout_seconds: 15,
            max_retries: 3,
        }
    }
}

/// Sentiment / emotion classifier section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SentimentConfig {
    pub adapter: String, // "inference", "llm"
    /// Base URL of the hosted inference API; the model id is appended
    pub api_url: String,
    pub api_key_env: String,
    pub model: String,
    pub emotion_model: String,
    pub timeout_seconds: u64,
    pub llm: Option<LlmConfig>,
}

impl Default for SentimentConfig {
    fn default() -> Self {
        Self {
            adapter: "inference".to_string(),
            api_url: "https://api-inference.huggingface.co/models".to_string(),
            api_key_env: "HF_API_TOKEN".to_string(),
            model: "distilbert/distilbert-base-uncased-finetuned-sst-2-english".to_string(),
            emotion_model: "nateraw/bert-base-uncased-emotion".to_string(),
            timeout_seconds: 30,
            llm: None,
        }
    }
}

/// Chat-completions endpoint used when `sentiment.adapter = "llm"`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub api_url: Option<String>,
    pub api_key_env: Option<String>,
    pub model: Option<String>,
    pub timeout_seconds: Option<u64>,
}

/// Stock history provider section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StockConfig {
    /// Chart endpoint; the ticker is appended as a path segment
    pub api_url: String,
    pub tickers: Vec<String>,
    pub default_ticker: String,
    pub range: String,
    pub interval: String,
    pub timeout_seconds: u64,
}

impl Default for StockConfig {
    fn default() -> Self {
        Self {
            api_url: "https://query1.finance.yahoo.com/v8/finance/chart".to_string(),
            tickers: ["AAPL", "MSFT", "GOOGL", "AMZN", "TSLA"]
                .iter()
                .map(|t| t.to_string())
                .collect(),
            default_ticker: "AAPL".to_string(),
            range: "5d".to_string(),
            interval: "1d".to_string(),
            timeout_seconds: 15,
        }
    }
}

/// Daily refresh budget for the news update
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub max_per_day: u32,
    /// Two-line record: last update timestamp, then same-day count
    pub info_file: String,
    /// Age after which a leftover lock file is considered abandoned
    pub stale_lock_seconds: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            max_per_day: 2,
            info_file: "data/news_update_info.txt".to_string(),
            stale_lock_seconds: 300,
        }
    }
}

/// CSV outputs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub news_csv: String,
    pub stock_csv: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            news_csv: "data/integrated_news_data.csv".to_string(),
            stock_csv: "data/integrated_stock_data.csv".to_string(),
        }
    }
}

/// Dashboard HTTP server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8000,
        }
    }
}

/// Top-level application configuration (deserialized from config.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub news: NewsConfig,
    pub sentiment: SentimentConfig,
    pub stock: StockConfig,
    pub refresh: RefreshConfig,
    pub output: OutputConfig,
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from a single TOML file asynchronously.
    ///
    /// Example:
    ///   let cfg = Config::from_file("config.toml").await?;
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let cfg: Config = toml::from_str(&data).context("Failed to parse TOML configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load configuration with an optional default file and an optional override file.
    /// If both are present, they are merged (override takes precedence). Missing files
    /// are skipped, so with neither present the built-in defaults apply.
    pub async fn load_with_defaults(
        default_path: Option<&Path>,
        override_path: Option<&Path>,
    ) -> Result<Self> {
        let mut config_value = toml::Value::Table(toml::map::Map::new());

        if let Some(path) = default_path {
            if path.exists() {
                let data = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("Failed to read default config: {}", path.display()))?;
                let val: toml::Value =
                    toml::from_str(&data).context("Failed to parse default configuration")?;
                merge_toml(&mut config_value, val);
            }
        }

        if let Some(path) = override_path {
            if path.exists() {
                let data = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("Failed to read override config: {}", path.display()))?;
                let val: toml::Value =
                    toml::from_str(&data).context("Failed to parse override configuration")?;
                merge_toml(&mut config_value, val);
            }
        }

        let cfg: Config = config_value
            .try_into()
            .context("Failed to parse merged configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values that cannot produce a working gate or dashboard.
    pub fn validate(&self) -> Result<()> {
        if self.refresh.max_per_day == 0 {
            anyhow::bail!("refresh.max_per_day must be at least 1");
        }
        if self.stock.tickers.is_empty() {
            anyhow::bail!("stock.tickers must list at least one ticker");
        }
        if !self.stock.tickers.contains(&self.stock.default_ticker) {
            anyhow::bail!(
                "stock.default_ticker '{}' is not one of stock.tickers {:?}",
                self.stock.default_ticker,
                self.stock.tickers
            );
        }
        Ok(())
    }

    /// Whether `ticker` may be requested from the stock provider.
    pub fn is_known_ticker(&self, ticker: &str) -> bool {
        self.stock.tickers.iter().any(|t| t.eq_ignore_ascii_case(ticker))
    }
}

fn merge_toml(a: &mut toml::Value, b: toml::Value) {
    match (a, b) {
        (toml::Value::Table(a_map), toml::Value::Table(b_map)) => {
            for (k, v) in b_map {
                if let Some(a_val) = a_map.get_mut(&k) {
                    merge_toml(a_val, v);
                } else {
                    a_map.insert(k, v);
                }
            }
        }
        (a_val, b_val) => *a_val = b_val,
    }
}
