use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, Utc};
use common::Config;
use rocket::figment::Figment;
use rocket::fs::{relative, FileServer};
use rocket::http::Status;
use rocket::response::Redirect;
use rocket::serde::json::Json;
use rocket::{get, post, routes, Build, Rocket, State};
use serde::Serialize;

use crate::record_store::PersistenceError;
use crate::refresh::{RefreshError, RefreshService, RefreshStatus};
use crate::sink::{self, NewsRow, StorageError, ALL_LABELS};
use crate::stock::{self, StockBar, StockSource};

/// Application state stored inside Rocket managed state.
#[derive(Clone)]
pub struct AppState {
    pub started_at: DateTime<Utc>,
    pub config: Arc<Config>,
    pub refresh: Arc<RefreshService>,
    pub stocks: Arc<dyn StockSource>,
}

impl AppState {
    pub fn new(config: Arc<Config>, refresh: Arc<RefreshService>, stocks: Arc<dyn StockSource>) -> Self {
        Self {
            started_at: Utc::now(),
            config,
            refresh,
            stocks,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

type ApiError = (Status, Json<ErrorBody>);

fn api_error(status: Status, error: impl Into<String>) -> ApiError {
    (status, Json(ErrorBody { error: error.into() }))
}

#[derive(Serialize)]
struct HealthStatus {
    status: &'static str,
    uptime_seconds: i64,
}

#[derive(Serialize)]
struct TickersResponse {
    tickers: Vec<String>,
    default_ticker: String,
}

#[derive(Serialize)]
struct TrendPoint {
    date: NaiveDate,
    close: f64,
}

#[derive(Serialize)]
struct StockResponse {
    ticker: String,
    selected_date: Option<NaiveDate>,
    min_date: Option<NaiveDate>,
    max_date: Option<NaiveDate>,
    /// Bars on `selected_date`
    bars: Vec<StockBar>,
    /// Close prices over the whole range, oldest first
    trend: Vec<TrendPoint>,
}

#[derive(Serialize)]
struct NewsResponse {
    labels: Vec<String>,
    selected: String,
    rows: Vec<NewsRow>,
}

#[derive(Serialize)]
struct RefreshResponse {
    outcome: &'static str,
    message: String,
    status: RefreshStatus,
}

/// Redirect root to static index.html
#[get("/")]
async fn index_redirect() -> Redirect {
    Redirect::to("/static/index.html")
}

#[get("/health")]
async fn health() -> &'static str {
    "OK"
}

#[get("/api/v1/status")]
async fn status(state: &State<AppState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        uptime_seconds: (Utc::now() - state.started_at).num_seconds(),
    })
}

#[get("/api/v1/tickers")]
async fn tickers(state: &State<AppState>) -> Json<TickersResponse> {
    Json(TickersResponse {
        tickers: state.config.stock.tickers.clone(),
        default_ticker: state.config.stock.default_ticker.clone(),
    })
}

/// Price history for one configured ticker. `date` (YYYY-MM-DD) selects the
/// table rows; it defaults to the most recent trading day.
#[get("/api/v1/stock/<ticker>?<date>")]
async fn stock_history(
    state: &State<AppState>,
    ticker: &str,
    date: Option<&str>,
) -> Result<Json<StockResponse>, ApiError> {
    let ticker = ticker.to_ascii_uppercase();
    if !state.config.is_known_ticker(&ticker) {
        return Err(api_error(Status::NotFound, format!("unknown ticker {ticker}")));
    }

    let requested = date
        .map(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d"))
        .transpose()
        .map_err(|e| api_error(Status::BadRequest, format!("invalid date: {e}")))?;

    let cfg = &state.config.stock;
    let bars = state
        .stocks
        .history(&ticker, &cfg.range, &cfg.interval)
        .await
        .map_err(|e| {
            tracing::error!(%e, ticker = %ticker, "failed to fetch stock data");
            api_error(Status::BadGateway, format!("Error fetching stock data: {e}"))
        })?;

    let span = stock::date_span(&bars);
    let selected_date = requested.or(span.map(|(_, max)| max));
    let selected = selected_date
        .map(|d| stock::bars_on(&bars, d))
        .unwrap_or_default();
    let trend = bars
        .iter()
        .map(|b| TrendPoint {
            date: b.date,
            close: b.close,
        })
        .collect();

    Ok(Json(StockResponse {
        ticker,
        selected_date,
        min_date: span.map(|(min, _)| min),
        max_date: span.map(|(_, max)| max),
        bars: selected,
        trend,
    }))
}

#[get("/api/v1/news?<sentiment>")]
async fn news(state: &State<AppState>, sentiment: Option<&str>) -> Result<Json<NewsResponse>, ApiError> {
    let path = PathBuf::from(&state.config.output.news_csv);
    let read = tokio::task::spawn_blocking(move || sink::read_news_rows(&path))
        .await
        .map_err(|e| api_error(Status::InternalServerError, e.to_string()))?;
    let rows = match read {
        Ok(rows) => rows,
        Err(StorageError::Missing(_)) => {
            return Err(api_error(
                Status::NotFound,
                "News sentiment data file not found. Please refresh the news data first.",
            ))
        }
        Err(e) => {
            tracing::error!(%e, "failed to read news CSV");
            return Err(api_error(Status::InternalServerError, e.to_string()));
        }
    };

    let labels = sink::sentiment_labels(&rows);
    Ok(Json(NewsResponse {
        labels,
        selected: sentiment.unwrap_or(ALL_LABELS).to_string(),
        rows: sink::filter_by_label(rows, sentiment),
    }))
}

#[get("/api/v1/news/status")]
async fn news_status(state: &State<AppState>) -> Json<RefreshStatus> {
    Json(state.refresh.status().await)
}

/// Run a gated news refresh. A denial is a normal response, not an error.
#[post("/api/v1/news/refresh")]
async fn refresh_news(state: &State<AppState>) -> Result<Json<RefreshResponse>, ApiError> {
    match state.refresh.do_refresh_if_allowed().await {
        Ok(outcome) => Ok(Json(RefreshResponse {
            outcome: outcome.kind(),
            message: outcome.message(),
            status: state.refresh.status().await,
        })),
        Err(RefreshError::Persistence(e @ PersistenceError::Locked { .. })) => {
            Err(api_error(Status::Conflict, format!("A news refresh is already running ({e})")))
        }
        Err(e) => {
            tracing::error!(%e, "news refresh could not be recorded");
            Err(api_error(Status::InternalServerError, e.to_string()))
        }
    }
}

/// Rocket instance with state and routes mounted, not yet launched.
pub fn build_rocket(figment: Figment, state: AppState) -> Rocket<Build> {
    rocket::custom(figment)
        .manage(state)
        .mount(
            "/",
            routes![
                index_redirect,
                health,
                status,
                tickers,
                stock_history,
                news,
                news_status,
                refresh_news,
            ],
        )
        .mount("/static", FileServer::from(relative!("static")))
}

pub async fn launch_dashboard(state: AppState) -> Result<()> {
    let fig = rocket::Config::figment()
        .merge(("address", state.config.server.bind.clone()))
        .merge(("port", state.config.server.port));

    tracing::info!(
        bind = %state.config.server.bind,
        port = state.config.server.port,
        "Starting Rocket HTTP server"
    );
    build_rocket(fig, state)
        .launch()
        .await
        .map_err(|e| anyhow!("Rocket failed: {}", e))?;

    tracing::info!("Rocket HTTP server has shut down");
    Ok(())
}
