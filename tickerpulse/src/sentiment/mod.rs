use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub mod inference;
pub mod llm;

/// Label recorded when a headline could not be classified.
pub const UNKNOWN_LABEL: &str = "UNKNOWN";

/// Labels asked of a chat model for plain sentiment.
pub const SENTIMENT_LABELS: &[&str] = &["POSITIVE", "NEGATIVE"];

/// Labels of the six-class emotion task.
pub const EMOTION_LABELS: &[&str] = &["sadness", "joy", "love", "anger", "fear", "surprise"];

/// One classifier verdict; `score` is a confidence in [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sentiment {
    pub label: String,
    pub score: f64,
}

impl Sentiment {
    pub fn unknown() -> Self {
        Self {
            label: UNKNOWN_LABEL.to_string(),
            score: 0.0,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClassificationError {
    #[error("classifier request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("classifier request timed out after {0}s")]
    Timeout(u64),
    #[error("classifier API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("unexpected classifier output: {0}")]
    Malformed(String),
}

/// Text classifier (sentiment or emotion model).
#[async_trait::async_trait]
pub trait SentimentClassifier: Send + Sync {
    /// Every label the model reports for `text`, best first.
    async fn classify_all(&self, text: &str) -> Result<Vec<Sentiment>, ClassificationError>;

    /// Best label for `text`.
    async fn classify(&self, text: &str) -> Result<Sentiment, ClassificationError> {
        self.classify_all(text)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ClassificationError::Malformed("model returned no labels".to_string()))
    }
}

/// Classify `text`, substituting the `UNKNOWN` sentinel on failure so a batch
/// of headlines is never aborted by one bad request.
pub async fn classify_or_unknown<C: SentimentClassifier + ?Sized>(classifier: &C, text: &str) -> Sentiment {
    match classifier.classify(text).await {
        Ok(sentiment) => sentiment,
        Err(e) => {
            warn!(%e, headline = text, "classification failed, recording UNKNOWN");
            Sentiment::unknown()
        }
    }
}

/// Sort verdicts best first.
pub(crate) fn rank(mut verdicts: Vec<Sentiment>) -> Vec<Sentiment> {
    verdicts.sort_by(|a, b| b.score.total_cmp(&a.score));
    verdicts
}

/// Helper to extract JSON from text that might contain markdown backticks or preamble
pub fn extract_json_from_text(text: &str) -> Option<String> {
    if let Some(start) = text.find("```json") {
        let rest = &text[start + 7..];
        if let Some(end) = rest.find("```") {
            return Some(rest[..end].trim().to_string());
        }
    }

    if let Some(start) = text.find("```") {
        let rest = &text[start + 3..];
        if let Some(end) = rest.find("```") {
            return Some(rest[..end].trim().to_string());
        }
    }

    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => Some(text[start..=end].to_string()),
        _ => None,
    }
}
