use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{rank, ClassificationError, Sentiment, SentimentClassifier};

/// Text-classification model served by a hosted inference API
/// (`POST {base_url}/{model}` with `{"inputs": text}`).
pub struct InferenceClassifier {
    endpoint: String,
    api_key: Option<String>,
    timeout: Duration,
    client: Client,
}

impl InferenceClassifier {
    pub fn new(base_url: &str, model: &str, api_key: Option<String>) -> Self {
        Self {
            endpoint: format!("{}/{}", base_url.trim_end_matches('/'), model),
            api_key,
            timeout: Duration::from_secs(30),
            client: Client::new(),
        }
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout = Duration::from_secs(timeout_secs);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait::async_trait]
impl SentimentClassifier for InferenceClassifier {
    async fn classify_all(&self, text: &str) -> Result<Vec<Sentiment>, ClassificationError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(&InferenceRequest { inputs: text });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| ClassificationError::Timeout(self.timeout.as_secs()))??;

        let status = response.status();
        let body = tokio::time::timeout(self.timeout, response.text())
            .await
            .map_err(|_| ClassificationError::Timeout(self.timeout.as_secs()))??;

        if !status.is_success() {
            let message = serde_json::from_str::<InferenceError>(&body)
                .map(|e| e.error)
                .unwrap_or(body);
            return Err(ClassificationError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: InferenceResponse = serde_json::from_str(&body)
            .map_err(|e| ClassificationError::Malformed(format!("{e}: {body}")))?;

        let verdicts = match parsed {
            InferenceResponse::Nested(mut batches) => {
                if batches.is_empty() {
                    Vec::new()
                } else {
                    batches.swap_remove(0)
                }
            }
            InferenceResponse::Flat(verdicts) => verdicts,
            InferenceResponse::Error(e) => {
                return Err(ClassificationError::Api {
                    status: status.as_u16(),
                    message: e.error,
                })
            }
        };

        debug!(endpoint = %self.endpoint, labels = verdicts.len(), "classified text");
        Ok(rank(verdicts))
    }
}

#[derive(Debug, Serialize)]
struct InferenceRequest<'a> {
    inputs: &'a str,
}

/// Pipelines answer `[[{label, score}, ...]]` for one input, some
/// deployments drop the outer list, and failures come back as `{"error": ...}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InferenceResponse {
    Nested(Vec<Vec<Sentiment>>),
    Flat(Vec<Sentiment>),
    Error(InferenceError),
}

#[derive(Debug, Deserialize)]
struct InferenceError {
    error: String,
}
