//! Model-backed collaborators: the fact extractor and the remote embedder.

pub mod client;
pub mod config;
pub mod embedding;
pub mod extractor;
pub mod openai;

pub use client::{ChatMessage, LlmClient, LlmRequest, LlmResponse, Role, TokenUsage};
pub use config::{
    build_extractor, build_llm_client, build_openai_embedder, EmbeddingConfig, LlmConfig,
    SemaphoredClient,
};
pub use embedding::OpenAiEmbedder;
pub use extractor::{KeywordExtractor, LlmFactExtractor};
pub use openai::OpenAiClient;
