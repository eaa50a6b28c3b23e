//! Remote embedding client for OpenAI-compatible `/v1/embeddings` endpoints.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use homecare_common::{Embedder, HomecareError, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::openai::DEFAULT_BASE_URL;

/// Inputs sent per request.
const MAX_BATCH: usize = 256;

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

pub struct OpenAiEmbedder {
    base_url: String,
    model: String,
    api_key: Option<String>,
    dimension: usize,
    request_dimensions: bool,
    http_client: reqwest::Client,
    semaphore: Arc<tokio::sync::Semaphore>,
}

impl OpenAiEmbedder {
    pub fn new(
        base_url: Option<String>,
        model: String,
        api_key: Option<String>,
        dimension: usize,
        timeout: Duration,
        max_concurrent: usize,
    ) -> Result<Self> {
        if dimension == 0 {
            return Err(HomecareError::Config(
                "Embedding dimension must be positive".to_string(),
            ));
        }
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HomecareError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            model,
            api_key,
            dimension,
            request_dimensions: false,
            http_client,
            semaphore: Arc::new(tokio::sync::Semaphore::new(max_concurrent.max(1))),
        })
    }

    /// Ask the provider to truncate vectors to the configured dimension.
    pub fn with_requested_dimensions(mut self, enabled: bool) -> Self {
        self.request_dimensions = enabled;
        self
    }

    async fn embed_chunk(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| HomecareError::Embedding(format!("Semaphore acquire failed: {e}")))?;

        let url = format!("{}/v1/embeddings", self.base_url);
        let body = EmbeddingRequest {
            model: &self.model,
            input: texts,
            dimensions: self.request_dimensions.then_some(self.dimension),
        };

        let mut http_req = self.http_client.post(&url).json(&body);
        if let Some(ref key) = self.api_key {
            http_req = http_req.bearer_auth(key);
        }

        let response = http_req
            .send()
            .await
            .map_err(|e| HomecareError::Embedding(format!("Embedding request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(HomecareError::Embedding(format!(
                "Embedding API error {status}: {body_text}"
            )));
        }

        let parsed: EmbeddingResponse = response.json().await.map_err(|e| {
            HomecareError::Embedding(format!("Failed to parse embedding response: {e}"))
        })?;

        order_and_check(parsed.data, texts.len(), self.dimension)
    }
}

/// Restore input order and verify count and dimension.
fn order_and_check(
    mut data: Vec<EmbeddingData>,
    expected: usize,
    dimension: usize,
) -> Result<Vec<Vec<f32>>> {
    if data.len() != expected {
        return Err(HomecareError::Embedding(format!(
            "Expected {expected} embeddings, got {}",
            data.len()
        )));
    }
    data.sort_by_key(|d| d.index);

    let mut vectors = Vec::with_capacity(expected);
    for (i, item) in data.into_iter().enumerate() {
        if item.index != i {
            return Err(HomecareError::Embedding(format!(
                "Embedding response is missing index {i}"
            )));
        }
        if item.embedding.len() != dimension {
            return Err(HomecareError::Embedding(format!(
                "Embedding has dimension {}, expected {dimension}",
                item.embedding.len()
            )));
        }
        vectors.push(item.embedding);
    }
    Ok(vectors)
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_chunk(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| HomecareError::Embedding("Empty embedding response".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(MAX_BATCH) {
            vectors.extend(self.embed_chunk(chunk).await?);
        }
        debug!(count = vectors.len(), model = %self.model, "Embedded batch");
        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(index: usize, embedding: Vec<f32>) -> EmbeddingData {
        EmbeddingData { index, embedding }
    }

    #[test]
    fn responses_are_reordered_by_index() {
        let data = vec![item(1, vec![0.0, 1.0]), item(0, vec![1.0, 0.0])];
        let vectors = order_and_check(data, 2, 2).unwrap();
        assert_eq!(vectors[0], vec![1.0, 0.0]);
        assert_eq!(vectors[1], vec![0.0, 1.0]);
    }

    #[test]
    fn wrong_dimension_is_embedding_failure() {
        let data = vec![item(0, vec![1.0, 0.0, 0.0])];
        assert!(matches!(
            order_and_check(data, 1, 2),
            Err(HomecareError::Embedding(_))
        ));
    }

    #[test]
    fn missing_items_are_embedding_failure() {
        let data = vec![item(0, vec![1.0, 0.0])];
        assert!(order_and_check(data, 2, 2).is_err());

        let gap = vec![item(0, vec![1.0, 0.0]), item(2, vec![0.0, 1.0])];
        assert!(order_and_check(gap, 2, 2).is_err());
    }

    #[test]
    fn request_body_serializes_dimensions_only_when_requested() {
        let input = vec!["Allergic to penicillin".to_string()];
        let without = serde_json::to_value(EmbeddingRequest {
            model: "text-embedding-3-small",
            input: &input,
            dimensions: None,
        })
        .unwrap();
        assert!(without.get("dimensions").is_none());
        assert_eq!(without["input"][0], "Allergic to penicillin");

        let with = serde_json::to_value(EmbeddingRequest {
            model: "text-embedding-3-small",
            input: &input,
            dimensions: Some(512),
        })
        .unwrap();
        assert_eq!(with["dimensions"], 512);
    }

    #[test]
    fn zero_dimension_rejected() {
        let result = OpenAiEmbedder::new(
            None,
            "text-embedding-3-small".to_string(),
            None,
            0,
            Duration::from_secs(5),
            2,
        );
        assert!(matches!(result, Err(HomecareError::Config(_))));
    }
}
