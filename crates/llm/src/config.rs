use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use homecare_common::{FactExtractor, HomecareError, Result};
use serde::{Deserialize, Serialize};

use crate::client::{LlmClient, LlmRequest, LlmResponse};
use crate::embedding::OpenAiEmbedder;
use crate::extractor::{KeywordExtractor, LlmFactExtractor};
use crate::openai::OpenAiClient;

/// Fact extraction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// "openai" or "keyword"
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    /// Falls back to OPENAI_API_KEY when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,
    #[serde(default = "default_llm_timeout")]
    pub timeout_ms: u64,
}

fn default_llm_provider() -> String {
    "openai".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f32 {
    0.0
}

fn default_max_tokens() -> u32 {
    2000
}

fn default_max_concurrent() -> usize {
    2
}

fn default_llm_timeout() -> u64 {
    30_000
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: default_llm_model(),
            api_key: None,
            api_url: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            max_concurrent_requests: default_max_concurrent(),
            timeout_ms: default_llm_timeout(),
        }
    }
}

impl LlmConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_api_key(self.api_key.as_deref(), &self.provider)
    }
}

/// Embedding settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// "openai", "hashing" or "fastembed"
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_dimension")]
    pub dimension: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    /// Send `dimensions` with each request so the provider truncates vectors
    #[serde(default)]
    pub request_dimensions: bool,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,
    #[serde(default = "default_embedding_timeout")]
    pub timeout_ms: u64,
}

fn default_embedding_provider() -> String {
    "openai".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_dimension() -> usize {
    1536
}

fn default_embedding_timeout() -> u64 {
    10_000
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            dimension: default_dimension(),
            api_key: None,
            api_url: None,
            request_dimensions: false,
            max_concurrent_requests: default_max_concurrent(),
            timeout_ms: default_embedding_timeout(),
        }
    }
}

impl EmbeddingConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_api_key(self.api_key.as_deref(), &self.provider)
    }
}

/// Explicit key first, then the provider's environment variable.
fn resolve_api_key(explicit: Option<&str>, provider: &str) -> Option<String> {
    if let Some(key) = explicit.filter(|k| !k.is_empty()) {
        return Some(key.to_string());
    }
    match provider {
        "openai" => std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty()),
        _ => None,
    }
}

/// Bounds the number of in-flight requests to the wrapped client.
pub struct SemaphoredClient {
    inner: Arc<dyn LlmClient>,
    semaphore: Arc<tokio::sync::Semaphore>,
}

impl SemaphoredClient {
    pub fn new(inner: Arc<dyn LlmClient>, max_concurrent: usize) -> Self {
        Self {
            inner,
            semaphore: Arc::new(tokio::sync::Semaphore::new(max_concurrent.max(1))),
        }
    }
}

#[async_trait]
impl LlmClient for SemaphoredClient {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| HomecareError::Extraction(format!("Semaphore acquire failed: {e}")))?;
        self.inner.complete(request).await
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}

pub fn build_llm_client(config: &LlmConfig) -> Result<Arc<dyn LlmClient>> {
    let base_client: Arc<dyn LlmClient> = match config.provider.as_str() {
        "openai" => Arc::new(OpenAiClient::new(
            config.api_url.clone(),
            config.model.clone(),
            config.resolve_api_key(),
            Duration::from_millis(config.timeout_ms),
        )?),
        other => {
            return Err(HomecareError::Config(format!(
                "Unknown LLM provider: {other}"
            )));
        }
    };

    Ok(Arc::new(SemaphoredClient::new(
        base_client,
        config.max_concurrent_requests,
    )))
}

pub fn build_extractor(config: &LlmConfig) -> Result<Arc<dyn FactExtractor>> {
    match config.provider.as_str() {
        "keyword" => Ok(Arc::new(KeywordExtractor)),
        _ => {
            let client = build_llm_client(config)?;
            Ok(Arc::new(
                LlmFactExtractor::new(client).with_sampling(config.temperature, config.max_tokens),
            ))
        }
    }
}

/// Build the remote embedder. Local providers are built by `homecare-memory`.
pub fn build_openai_embedder(config: &EmbeddingConfig) -> Result<OpenAiEmbedder> {
    if config.provider != "openai" {
        return Err(HomecareError::Config(format!(
            "Embedding provider '{}' is not a remote provider",
            config.provider
        )));
    }
    Ok(OpenAiEmbedder::new(
        config.api_url.clone(),
        config.model.clone(),
        config.resolve_api_key(),
        config.dimension,
        Duration::from_millis(config.timeout_ms),
        config.max_concurrent_requests,
    )?
    .with_requested_dimensions(config.request_dimensions))
}

#[cfg(test)]
mod tests {
    use super::*;
    use homecare_common::Embedder;

    const TOML_CONFIG: &str = r#"
provider = "openai"
model = "llama3"
api_url = "http://localhost:11434"
max_concurrent_requests = 4
timeout_ms = 15000
"#;

    #[test]
    fn deserialize_config_from_toml() {
        let config: LlmConfig = toml::from_str(TOML_CONFIG).unwrap();
        assert_eq!(config.provider, "openai");
        assert_eq!(config.model, "llama3");
        assert_eq!(config.api_url.as_deref(), Some("http://localhost:11434"));
        assert!(config.api_key.is_none());
        assert_eq!(config.max_concurrent_requests, 4);
        assert_eq!(config.timeout_ms, 15000);
        assert_eq!(config.max_tokens, 2000);
    }

    #[test]
    fn deserialize_config_defaults() {
        let config: LlmConfig = toml::from_str("").unwrap();
        assert_eq!(config.provider, "openai");
        assert_eq!(config.model, "gpt-4o-mini");
        assert_eq!(config.temperature, 0.0);
        assert_eq!(config.max_concurrent_requests, 2);
        assert_eq!(config.timeout_ms, 30_000);

        let embedding: EmbeddingConfig = toml::from_str("").unwrap();
        assert_eq!(embedding.model, "text-embedding-3-small");
        assert_eq!(embedding.dimension, 1536);
        assert_eq!(embedding.timeout_ms, 10_000);
        assert!(!embedding.request_dimensions);
    }

    #[test]
    fn explicit_api_key_wins() {
        let config = LlmConfig {
            api_key: Some("sk-explicit".to_string()),
            ..Default::default()
        };
        assert_eq!(config.resolve_api_key().as_deref(), Some("sk-explicit"));

        let keyword = LlmConfig {
            provider: "keyword".to_string(),
            ..Default::default()
        };
        assert!(keyword.resolve_api_key().is_none());
    }

    #[test]
    fn build_openai_client() {
        let config = LlmConfig {
            model: "llama3".to_string(),
            api_key: Some("sk-test".to_string()),
            ..Default::default()
        };
        let client = build_llm_client(&config).unwrap();
        assert_eq!(client.model_name(), "llama3");
    }

    #[test]
    fn build_unknown_provider_fails() {
        let config = LlmConfig {
            provider: "unknown".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            build_llm_client(&config),
            Err(HomecareError::Config(_))
        ));
        assert!(build_extractor(&config).is_err());
    }

    #[test]
    fn build_keyword_extractor() {
        let config = LlmConfig {
            provider: "keyword".to_string(),
            ..Default::default()
        };
        let extractor = build_extractor(&config).unwrap();
        assert_eq!(extractor.name(), "keyword");
    }

    #[test]
    fn build_embedder_checks_provider() {
        let embedder = build_openai_embedder(&EmbeddingConfig {
            dimension: 256,
            api_key: Some("sk-test".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(embedder.dimension(), 256);

        let hashing = EmbeddingConfig {
            provider: "hashing".to_string(),
            ..Default::default()
        };
        assert!(build_openai_embedder(&hashing).is_err());
    }
}
