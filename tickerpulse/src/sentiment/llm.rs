use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{extract_json_from_text, ClassificationError, Sentiment, SentimentClassifier};

/// Classifier backed by an OpenAI-compatible chat completions endpoint. The
/// model is asked to pick one label from a fixed set and answer in JSON.
pub struct LlmClassifier {
    api_url: String,
    api_key: String,
    model: String,
    labels: Vec<String>,
    timeout: Duration,
    client: reqwest::Client,
}

impl LlmClassifier {
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        labels: &[&str],
    ) -> Self {
        Self {
            api_url: api_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            labels: labels.iter().map(|l| l.to_string()).collect(),
            timeout: Duration::from_secs(30),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout = Duration::from_secs(timeout_secs);
        self
    }

    fn prompt(&self, text: &str) -> String {
        format!(
            r#"Classify the following news headline.

Choose exactly one label from: {labels}
Give a confidence score between 0 and 1.

OUTPUT FORMAT (strict JSON, nothing else):
{{"label": "<one of the labels>", "score": <number>}}

HEADLINE:
{text}
"#,
            labels = self.labels.join(", "),
        )
    }

    fn parse_reply(&self, reply: &str) -> Result<Sentiment, ClassificationError> {
        let json = extract_json_from_text(reply)
            .ok_or_else(|| ClassificationError::Malformed(format!("no JSON in reply: {reply}")))?;
        let verdict: Sentiment = serde_json::from_str(&json)
            .map_err(|e| ClassificationError::Malformed(format!("{e}: {json}")))?;

        // Chat models drift on casing; report the canonical spelling.
        let label = self
            .labels
            .iter()
            .find(|l| l.eq_ignore_ascii_case(verdict.label.trim()))
            .cloned()
            .ok_or_else(|| ClassificationError::Malformed(format!("unknown label '{}'", verdict.label)))?;

        Ok(Sentiment {
            label,
            score: verdict.score.clamp(0.0, 1.0),
        })
    }
}

#[async_trait::async_trait]
impl SentimentClassifier for LlmClassifier {
    async fn classify_all(&self, text: &str) -> Result<Vec<Sentiment>, ClassificationError> {
        let req_body = ChatRequest {
            model: &self.model,
            messages: vec![Message {
                role: "user".to_string(),
                content: self.prompt(text),
            }],
            max_tokens: 50,
            temperature: 0.0,
        };

        let response = tokio::time::timeout(
            self.timeout,
            self.client
                .post(&self.api_url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&req_body)
                .send(),
        )
        .await
        .map_err(|_| ClassificationError::Timeout(self.timeout.as_secs()))??;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(ClassificationError::Api { status, message });
        }

        let resp_body: ChatResponse = response.json().await?;
        let reply = resp_body
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| ClassificationError::Malformed("LLM response has no choices".to_string()))?;

        debug!(model = %self.model, reply, "LLM classification reply");
        Ok(vec![self.parse_reply(reply)?])
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
    max_tokens: usize,
    temperature: f32,
}

#[derive(Debug, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}
