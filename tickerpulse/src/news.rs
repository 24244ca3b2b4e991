use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Title used when the provider returns an article without one.
pub const MISSING_TITLE: &str = "No Title";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Headline {
    pub title: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("news request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("news API returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("news API error {code}: {message}")]
    Api { code: String, message: String },
    #[error("{0} not set")]
    MissingKey(String),
}

/// Source of top headlines for a country.
#[async_trait::async_trait]
pub trait NewsSource: Send + Sync {
    async fn fetch_top_headlines(&self, country_code: &str) -> Result<Vec<Headline>, FetchError>;
}

/// NewsAPI `top-headlines` client.
pub struct NewsApiSource {
    api_url: String,
    api_key: Option<String>,
    key_env: String,
    max_retries: u32,
    client: Client,
}

impl NewsApiSource {
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout_secs: u64,
    ) -> Result<Self, FetchError> {
        Self::build(api_url.into(), Some(api_key.into()), "NEWSAPI_KEY".to_string(), timeout_secs)
    }

    /// Key read from `key_env`. A missing variable is not an error here:
    /// every fetch then fails with [`FetchError::MissingKey`], so the rest of
    /// the application keeps working without news access.
    pub fn from_env(api_url: impl Into<String>, key_env: &str, timeout_secs: u64) -> Result<Self, FetchError> {
        let api_key = std::env::var(key_env).ok().filter(|k| !k.is_empty());
        if api_key.is_none() {
            warn!(key_env, "news API key not set, refreshes will fail");
        }
        Self::build(api_url.into(), api_key, key_env.to_string(), timeout_secs)
    }

    fn build(
        api_url: String,
        api_key: Option<String>,
        key_env: String,
        timeout_secs: u64,
    ) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(concat!("tickerpulse/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            api_url,
            api_key,
            key_env,
            max_retries: 3,
            client,
        })
    }

    /// Total attempts including the first one; at least one is always made.
    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    async fn fetch_once(&self, country_code: &str, api_key: &str) -> Result<Vec<Headline>, Attempt> {
        let response = self
            .client
            .get(&self.api_url)
            .query(&[("country", country_code), ("apiKey", api_key)])
            .send()
            .await
            .map_err(|e| Attempt::Retry(e.into()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Attempt::Retry(e.into()))?;

        match serde_json::from_str::<NewsApiResponse>(&body) {
            Ok(parsed) if parsed.status == "ok" => Ok(parsed
                .articles
                .into_iter()
                .map(|a| Headline {
                    title: a.title.unwrap_or_else(|| MISSING_TITLE.to_string()),
                })
                .collect()),
            Ok(parsed) => {
                let err = FetchError::Api {
                    code: parsed.code.unwrap_or_else(|| parsed.status.clone()),
                    message: parsed.message.unwrap_or_default(),
                };
                Err(classify_status(status, err))
            }
            Err(_) => Err(classify_status(
                status,
                FetchError::Status {
                    status: status.as_u16(),
                    body,
                },
            )),
        }
    }
}

/// Outcome of one attempt: whether another try could help.
enum Attempt {
    Retry(FetchError),
    Fatal(FetchError),
}

fn classify_status(status: StatusCode, err: FetchError) -> Attempt {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Attempt::Retry(err)
    } else {
        Attempt::Fatal(err)
    }
}

#[async_trait::async_trait]
impl NewsSource for NewsApiSource {
    async fn fetch_top_headlines(&self, country_code: &str) -> Result<Vec<Headline>, FetchError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| FetchError::MissingKey(self.key_env.clone()))?;

        let mut attempt = 1;
        loop {
            match self.fetch_once(country_code, api_key).await {
                Ok(headlines) => {
                    info!(country = country_code, count = headlines.len(), "fetched top headlines");
                    return Ok(headlines);
                }
                Err(Attempt::Fatal(e)) => return Err(e),
                Err(Attempt::Retry(e)) if attempt >= self.max_retries => return Err(e),
                Err(Attempt::Retry(e)) => {
                    let backoff = Duration::from_secs(2u64.pow(attempt - 1)); // 1s, 2s, 4s...
                    debug!(%e, attempt, ?backoff, "retrying headline fetch");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct NewsApiResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    articles: Vec<NewsApiArticle>,
}

#[derive(Debug, Deserialize)]
struct NewsApiArticle {
    #[serde(default)]
    title: Option<String>,
}
