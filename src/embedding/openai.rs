use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use super::{EmbeddingClient, EmbeddingClientError};

/// Client for OpenAI-compatible `/embeddings` endpoints.
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    dimension: usize,
    max_retries: usize,
}

impl OpenAiEmbedder {
    /// Build a client; the API key is sent as a bearer token on every request.
    pub fn new(
        api_key: &str,
        base_url: &str,
        model: &str,
        dimension: usize,
        timeout: Duration,
        max_retries: usize,
    ) -> Result<Self, EmbeddingClientError> {
        if api_key.trim().is_empty() {
            return Err(EmbeddingClientError::MissingApiKey);
        }
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {}", api_key.trim()))
            .map_err(|e| EmbeddingClientError::GenerationFailed(format!("invalid API key: {e}")))?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", base_url.trim_end_matches('/')),
            model: model.to_string(),
            dimension,
            max_retries: max_retries.max(1),
        })
    }

    fn should_retry(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
    }

    fn retry_backoff(attempt: usize) -> Duration {
        let capped = attempt.min(5) as u32;
        Duration::from_millis(500 * (1 << capped))
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    dimensions: usize,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingEntry>,
}

#[derive(Deserialize)]
struct EmbeddingEntry {
    index: usize,
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingClient for OpenAiEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn generate_embeddings(
        &self,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let request = EmbeddingRequest {
            model: &self.model,
            input: &texts,
            dimensions: self.dimension,
        };

        let mut attempt = 0usize;
        loop {
            let response = self.client.post(&self.endpoint).json(&request).send().await?;
            let status = response.status();
            if status.is_success() {
                let mut parsed: EmbeddingResponse = response.json().await?;
                parsed.data.sort_by_key(|entry| entry.index);
                if parsed.data.len() != texts.len() {
                    return Err(EmbeddingClientError::GenerationFailed(format!(
                        "provider returned {} embeddings for {} inputs",
                        parsed.data.len(),
                        texts.len()
                    )));
                }
                tracing::debug!(model = %self.model, inputs = texts.len(), "Embeddings generated");
                return Ok(parsed.data.into_iter().map(|entry| entry.embedding).collect());
            }

            let body = response.text().await.unwrap_or_default();
            if Self::should_retry(status) && attempt + 1 < self.max_retries {
                attempt += 1;
                let backoff = Self::retry_backoff(attempt);
                tracing::warn!(%status, attempt, backoff_ms = backoff.as_millis() as u64, "Retrying embedding request");
                tokio::time::sleep(backoff).await;
                continue;
            }
            return Err(EmbeddingClientError::UnexpectedStatus { status, body });
        }
    }
}
