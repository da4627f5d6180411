//! Optional session summarization via the Anthropic Messages API.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::instrument;

/// Upper bound on the transcript excerpt sent to the provider.
const MAX_EXCERPT_BYTES: usize = 16 * 1024;

/// Summary provider seam.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Produce a short summary of a transcript excerpt.
    async fn summarize(&self, excerpt: &str) -> Result<String>;
}

/// Anthropic Messages API client.
pub struct AnthropicSummarizer {
    http_client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentItem>,
}

#[derive(Debug, Deserialize)]
struct ContentItem {
    #[serde(default)]
    text: Option<String>,
}

impl AnthropicSummarizer {
    /// Create a client for the given API key.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(api_key: String) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client for summarizer")?;

        Ok(Self {
            http_client,
            base_url: "https://api.anthropic.com".to_owned(),
            api_key,
            model: "claude-3-5-haiku-latest".to_owned(),
        })
    }

    /// Retry API calls with exponential backoff. Auth errors are not
    /// retried.
    async fn retry_with_backoff<F, T, Fut>(operation: F, max_attempts: u32) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempts = 0;
        let mut delay_ms = 100;

        loop {
            attempts += 1;
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    let error_str = e.to_string();
                    if error_str.contains("API returned error: 401")
                        || error_str.contains("API returned error: 403")
                    {
                        return Err(e);
                    }

                    if attempts >= max_attempts {
                        return Err(e.context(format!("Failed after {} attempts", attempts)));
                    }

                    tracing::debug!(
                        attempt = attempts,
                        delay_ms = delay_ms,
                        "Summary request failed, retrying"
                    );

                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    delay_ms = (delay_ms * 2).min(5000);
                }
            }
        }
    }

    #[instrument(skip(self, excerpt))]
    async fn request_summary(&self, excerpt: &str) -> Result<String> {
        let url = format!("{}/v1/messages", self.base_url);

        let body = json!({
            "model": self.model,
            "max_tokens": 300,
            "messages": [{
                "role": "user",
                "content": format!(
                    "Summarize this AI coding session transcript in 2-3 sentences. \
                     Focus on what was built or changed.\n\n{excerpt}"
                ),
            }],
        });

        let response = self
            .http_client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .context("Failed to reach summary provider")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_else(|_| String::new());
            anyhow::bail!("API returned error: {} - {}", status, body);
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .context("Failed to parse summary response")?;

        parsed
            .content
            .into_iter()
            .find_map(|item| item.text)
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("Summary response contained no text"))
    }
}

impl std::fmt::Debug for AnthropicSummarizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicSummarizer")
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Summarizer for AnthropicSummarizer {
    async fn summarize(&self, excerpt: &str) -> Result<String> {
        let excerpt = truncate_excerpt(excerpt, MAX_EXCERPT_BYTES);
        Self::retry_with_backoff(|| self.request_summary(excerpt), 3).await
    }
}

/// Cut the excerpt at a char boundary at or below the byte cap.
fn truncate_excerpt(excerpt: &str, max_bytes: usize) -> &str {
    if excerpt.len() <= max_bytes {
        return excerpt;
    }
    let mut end = max_bytes;
    while end > 0 && !excerpt.is_char_boundary(end) {
        end -= 1;
    }
    &excerpt[..end]
}
