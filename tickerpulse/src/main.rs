/*
tickerpulse - single-binary main.rs
Runs the dashboard server or one of the one-shot commands (gated news refresh,
stock download, emotion scan).
*/

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use common::Config;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use tickerpulse::news::{NewsApiSource, NewsSource};
use tickerpulse::record_store::RecordStore;
use tickerpulse::refresh::{RefreshOutcome, RefreshService};
use tickerpulse::sentiment::inference::InferenceClassifier;
use tickerpulse::sentiment::llm::LlmClassifier;
use tickerpulse::sentiment::{SentimentClassifier, EMOTION_LABELS, SENTIMENT_LABELS};
use tickerpulse::server::{launch_dashboard, AppState};
use tickerpulse::sink::CsvNewsSink;
use tickerpulse::stock::{self, StockSource, YahooStockSource};

const EXAMPLE_HEADLINES: &[&str] = &[
    "Apple posts record revenue amid strong iPhone sales",
    "Market crashes as investors panic over global tensions",
    "Tech giants show renewed optimism for future growth",
    "Economic slowdown raises concerns among industry experts",
];

#[derive(Parser, Debug)]
#[command(name = "tickerpulse", about = "Stock history, news sentiment and dashboard")]
struct Args {
    /// Path to config.toml
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (info, debug, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the dashboard HTTP server (default)
    Serve,
    /// Fetch and score top headlines if today's refresh budget allows it
    Refresh,
    /// Show the last news update and the remaining refreshes for today
    Status,
    /// Download recent price history and write the stock CSV
    Stock {
        #[arg(long)]
        ticker: Option<String>,
        /// Range understood by the provider, e.g. 5d, 1mo
        #[arg(long)]
        range: Option<String>,
    },
    /// Download stock history, then run a gated news refresh
    Ingest {
        #[arg(long)]
        ticker: Option<String>,
    },
    /// Print every emotion the emotion model detects in each headline
    Emotions {
        /// Headlines to analyse (defaults to a few financial examples)
        headlines: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    // API keys may live in a local .env file
    if let Err(e) = dotenv::dotenv() {
        tracing::debug!(%e, "no .env file loaded");
    }

    let config = load_config(args.config.as_deref()).await?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Refresh => refresh(&config).await,
        Command::Status => record_status(&config).await,
        Command::Stock { ticker, range } => download_stock(&config, ticker, range).await,
        Command::Ingest { ticker } => {
            download_stock(&config, ticker, None).await?;
            refresh(&config).await
        }
        Command::Emotions { headlines } => detect_emotions(&config, headlines).await,
    }
}

async fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let default_path = PathBuf::from("config.default.toml");

    let override_path = match explicit {
        Some(p) => {
            if !p.exists() {
                error!(path = ?p, "specified config file not found");
                anyhow::bail!("Config file not found: {}", p.display());
            }
            Some(p.to_path_buf())
        }
        None => {
            let p = PathBuf::from("config.toml");
            if p.exists() {
                Some(p)
            } else {
                None
            }
        }
    };

    // Missing files are skipped by the loader; built-in defaults fill the gaps
    let config = Config::load_with_defaults(Some(default_path.as_path()), override_path.as_deref())
        .await
        .context("failed to load configuration")?;
    info!(defaults = ?default_path, overrides = ?override_path, "configuration loaded");
    Ok(config)
}

async fn serve(config: Config) -> Result<()> {
    let refresh = Arc::new(build_refresh_service(&config)?);
    let stocks = create_stock_source(&config)?;
    let state = AppState::new(Arc::new(config), refresh, stocks);
    launch_dashboard(state).await
}

async fn refresh(config: &Config) -> Result<()> {
    let service = build_refresh_service(config)?;
    let outcome = service
        .do_refresh_if_allowed()
        .await
        .context("news refresh could not be recorded")?;

    match &outcome {
        RefreshOutcome::Succeeded { .. } => println!("{}", outcome.message()),
        RefreshOutcome::Denied { .. } => println!("{}", outcome.message()),
        RefreshOutcome::Failed { .. } => anyhow::bail!(outcome.message()),
    }
    print_status(&service).await;
    Ok(())
}

async fn print_status(service: &RefreshService) {
    let status = service.status().await;
    print_budget(status.last_update.as_deref(), status.refresh_count, status.max_per_day);
}

/// Budget report straight from the record file, so no API keys are needed.
async fn record_status(config: &Config) -> Result<()> {
    let store = RecordStore::new(&config.refresh.info_file);
    let record = store.load_or_absent().await;
    let today = Local::now().date_naive();
    let count = record.map(|r| r.effective_count(today)).unwrap_or(0);
    let last_update = record.map(|r| r.formatted_last_update());
    print_budget(last_update.as_deref(), count, config.refresh.max_per_day);
    Ok(())
}

fn print_budget(last_update: Option<&str>, refresh_count: u32, max_per_day: u32) {
    match last_update {
        Some(ts) => println!("News Data Last Updated: {ts}"),
        None => println!("News data has never been refreshed"),
    }
    println!(
        "Refreshes today: {}/{} ({} remaining)",
        refresh_count,
        max_per_day,
        max_per_day.saturating_sub(refresh_count)
    );
}

async fn download_stock(config: &Config, ticker: Option<String>, range: Option<String>) -> Result<()> {
    let ticker = ticker
        .unwrap_or_else(|| config.stock.default_ticker.clone())
        .to_ascii_uppercase();
    if !config.is_known_ticker(&ticker) {
        warn!(ticker = %ticker, "ticker is not in the configured dashboard list");
    }
    let range = range.unwrap_or_else(|| config.stock.range.clone());

    let source = create_stock_source(config)?;
    let bars = source
        .history(&ticker, &range, &config.stock.interval)
        .await
        .with_context(|| format!("failed to fetch stock data for {ticker}"))?;

    println!("past {range} historical data for: {ticker}");
    println!("{:<12} {:>10} {:>10} {:>10} {:>10} {:>14}", "Date", "Open", "High", "Low", "Close", "Volume");
    for bar in bars.iter().take(5) {
        println!(
            "{:<12} {:>10.2} {:>10.2} {:>10.2} {:>10.2} {:>14}",
            bar.date.to_string(), bar.open, bar.high, bar.low, bar.close, bar.volume
        );
    }

    stock::write_stock_csv(Path::new(&config.output.stock_csv), &bars)?;
    Ok(())
}

async fn detect_emotions(config: &Config, headlines: Vec<String>) -> Result<()> {
    let classifier = create_classifier(config, ClassifierTask::Emotion)?;
    let headlines = if headlines.is_empty() {
        EXAMPLE_HEADLINES.iter().map(|h| h.to_string()).collect()
    } else {
        headlines
    };

    for headline in &headlines {
        println!("Headline: {headline}");
        match classifier.classify_all(headline).await {
            Ok(emotions) => {
                println!("Detected Emotions:");
                for emotion in emotions {
                    println!("  - {}: {:.3}", emotion.label, emotion.score);
                }
            }
            Err(e) => println!("  emotion detection failed: {e}"),
        }
        println!();
    }
    Ok(())
}

fn build_refresh_service(config: &Config) -> Result<RefreshService> {
    let store = RecordStore::new(&config.refresh.info_file)
        .with_stale_after(Duration::from_secs(config.refresh.stale_lock_seconds));

    Ok(RefreshService::new(
        store,
        config.refresh.max_per_day,
        config.news.country.clone(),
        create_news_source(config)?,
        create_classifier(config, ClassifierTask::Sentiment)?,
        Arc::new(CsvNewsSink::new(&config.output.news_csv)),
    ))
}

fn create_news_source(config: &Config) -> Result<Arc<dyn NewsSource>> {
    // A missing key only fails refreshes; the dashboard still serves stored data
    let source = NewsApiSource::from_env(&config.news.api_url, &config.news.api_key_env, config.news.timeout_seconds)
        .context("failed to build news HTTP client")?
        .with_retries(config.news.max_retries);
    Ok(Arc::new(source))
}

fn create_stock_source(config: &Config) -> Result<Arc<dyn StockSource>> {
    let source = YahooStockSource::new(&config.stock.api_url, config.stock.timeout_seconds)
        .context("failed to build stock HTTP client")?;
    Ok(Arc::new(source))
}

/// Which model a classifier is built for
#[derive(Debug, Clone, Copy)]
enum ClassifierTask {
    Sentiment,
    Emotion,
}

/// Create a classifier based on configuration and task
fn create_classifier(config: &Config, task: ClassifierTask) -> Result<Arc<dyn SentimentClassifier>> {
    let cfg = &config.sentiment;
    match cfg.adapter.as_str() {
        "inference" => {
            let model = match task {
                ClassifierTask::Sentiment => &cfg.model,
                ClassifierTask::Emotion => &cfg.emotion_model,
            };
            let api_key = std::env::var(&cfg.api_key_env).ok();
            if api_key.is_none() {
                warn!("Inference API key env var '{}' not set, sending anonymous requests", cfg.api_key_env);
            }
            let classifier = InferenceClassifier::new(&cfg.api_url, model, api_key).with_timeout(cfg.timeout_seconds);
            info!(endpoint = classifier.endpoint(), ?task, "inference classifier initialized");
            Ok(Arc::new(classifier))
        }
        "llm" => {
            let llm = cfg
                .llm
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("sentiment.adapter = \"llm\" but no [sentiment.llm] section"))?;
            let api_key_env = llm
                .api_key_env
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("Missing api_key_env in [sentiment.llm]"))?;
            let api_key = std::env::var(api_key_env)
                .with_context(|| format!("LLM API key env var '{}' not set", api_key_env))?;

            let model = llm.model.clone().unwrap_or_else(|| "gpt-4o-mini".to_string());
            let api_url = llm
                .api_url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434/v1/chat/completions".to_string());
            let labels = match task {
                ClassifierTask::Sentiment => SENTIMENT_LABELS,
                ClassifierTask::Emotion => EMOTION_LABELS,
            };

            info!(%model, %api_url, ?task, "LLM classifier initialized");
            let classifier = LlmClassifier::new(api_url, api_key, model, labels)
                .with_timeout(llm.timeout_seconds.unwrap_or(cfg.timeout_seconds));
            Ok(Arc::new(classifier))
        }
        other => anyhow::bail!("Unknown sentiment adapter type: {}", other),
    }
}
