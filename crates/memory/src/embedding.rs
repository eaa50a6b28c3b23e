//! Local embedders.
//!
//! [`HashingEmbedder`] is a dependency-free bag-of-words embedder used for
//! offline runs and tests. With the `local-embeddings` feature,
//! [`FastEmbedder`] runs a sentence-transformer model in process via
//! fastembed.

use async_trait::async_trait;
use homecare_common::{Embedder, HomecareError, Result};

use crate::similarity::normalize;

/// Feature-hashing embedder over normalized words and word bigrams.
///
/// Texts sharing vocabulary get high cosine similarity, identical texts
/// get identical vectors. Output is L2-normalized.
#[derive(Debug, Clone, Copy)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(HomecareError::Config(
                "Embedding dimension must be positive".to_string(),
            ));
        }
        Ok(Self { dimension })
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        let normalized = normalize(text);
        let words: Vec<&str> = normalized.split_whitespace().collect();

        for word in &words {
            self.accumulate(&mut vector, word.as_bytes(), 1.0);
        }
        for pair in words.windows(2) {
            let bigram = format!("{} {}", pair[0], pair[1]);
            self.accumulate(&mut vector, bigram.as_bytes(), 0.5);
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }

    fn accumulate(&self, vector: &mut [f32], feature: &[u8], weight: f32) {
        let hash = fnv1a(feature);
        let slot = (hash % self.dimension as u64) as usize;
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        vector[slot] += sign * weight;
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(PRIME))
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_sync(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(feature = "local-embeddings")]
pub use local::{EmbeddingError, FastEmbedder};

#[cfg(feature = "local-embeddings")]
mod local {
    use std::sync::Arc;

    use async_trait::async_trait;
    use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
    use homecare_common::{Embedder, HomecareError, Result};
    use once_cell::sync::OnceCell;
    use thiserror::Error;
    use tokio::task;
    use tracing::{debug, info, instrument};

    #[derive(Debug, Error)]
    pub enum EmbeddingError {
        #[error("Failed to initialize embedding model: {0}")]
        ModelInit(String),

        #[error("Failed to generate embeddings: {0}")]
        Generation(String),

        #[error("Blocking task failed: {0}")]
        TaskJoin(#[from] tokio::task::JoinError),
    }

    impl From<EmbeddingError> for HomecareError {
        fn from(e: EmbeddingError) -> Self {
            match e {
                EmbeddingError::ModelInit(msg) => HomecareError::Config(msg),
                other => HomecareError::Embedding(other.to_string()),
            }
        }
    }

    /// In-process sentence embedder. The model is downloaded and loaded on
    /// first use, then shared.
    pub struct FastEmbedder {
        model_name: EmbeddingModel,
        dimension: usize,
        model: OnceCell<Arc<TextEmbedding>>,
    }

    impl FastEmbedder {
        /// Build from a model name, checking it produces `expected_dim`
        /// vectors.
        pub fn from_config(model_name: &str, expected_dim: usize) -> Result<Self> {
            let (model, dimension) = match model_name {
                "all-MiniLM-L6-v2" | "AllMiniLML6V2" => (EmbeddingModel::AllMiniLML6V2, 384),
                "all-MiniLM-L12-v2" | "AllMiniLML12V2" => (EmbeddingModel::AllMiniLML12V2, 384),
                "bge-small-en-v1.5" | "BGESmallENV15" => (EmbeddingModel::BGESmallENV15, 384),
                "bge-base-en-v1.5" | "BGEBaseENV15" => (EmbeddingModel::BGEBaseENV15, 768),
                "bge-large-en-v1.5" | "BGELargeENV15" => (EmbeddingModel::BGELargeENV15, 1024),
                "nomic-embed-text-v1.5" | "NomicEmbedTextV15" => {
                    (EmbeddingModel::NomicEmbedTextV15, 768)
                }
                "multilingual-e5-small" | "MultilingualE5Small" => {
                    (EmbeddingModel::MultilingualE5Small, 384)
                }
                _ => {
                    return Err(EmbeddingError::ModelInit(format!(
                        "Unknown embedding model: '{model_name}'. Supported models: \
                         all-MiniLM-L6-v2, bge-base-en-v1.5, nomic-embed-text-v1.5, etc."
                    ))
                    .into());
                }
            };
            if dimension != expected_dim {
                return Err(EmbeddingError::ModelInit(format!(
                    "Dimension mismatch: model '{model_name}' produces {dimension}-dim vectors \
                     but config specifies {expected_dim}"
                ))
                .into());
            }
            Ok(Self {
                model_name: model,
                dimension,
                model: OnceCell::new(),
            })
        }

        #[instrument(skip(self))]
        fn get_or_init_model(&self) -> std::result::Result<Arc<TextEmbedding>, EmbeddingError> {
            self.model
                .get_or_try_init(|| {
                    info!(model = ?self.model_name, "Initializing embedding model");
                    let mut options = InitOptions::new(self.model_name.clone());
                    options.show_download_progress = false;
                    let model = TextEmbedding::try_new(options)
                        .map_err(|e| EmbeddingError::ModelInit(e.to_string()))?;
                    info!(model = ?self.model_name, dimension = self.dimension, "Embedding model ready");
                    Ok(Arc::new(model))
                })
                .cloned()
        }

        /// Load the model ahead of the first request.
        pub async fn warmup(&self) -> Result<()> {
            if self.model.get().is_some() {
                return Ok(());
            }
            let model_name = self.model_name.clone();
            info!(model = ?model_name, "Warming up embedding model");
            self.get_or_init_model()?;
            Ok(())
        }
    }

    #[async_trait]
    impl Embedder for FastEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let mut vectors = self.embed_batch(&[text.to_string()]).await?;
            vectors
                .pop()
                .ok_or_else(|| HomecareError::Embedding("Empty embedding result".to_string()))
        }

        #[instrument(skip(self, texts), fields(batch_size = texts.len()))]
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            if texts.is_empty() {
                return Ok(Vec::new());
            }
            let model = self.get_or_init_model()?;
            let texts = texts.to_vec();

            // fastembed is synchronous
            let embeddings = task::spawn_blocking(move || {
                model
                    .embed(texts, None)
                    .map_err(|e| EmbeddingError::Generation(e.to_string()))
            })
            .await
            .map_err(EmbeddingError::from)??;

            debug!(batch_size = embeddings.len(), "Generated batch embeddings");
            Ok(embeddings)
        }

        fn dimension(&self) -> usize {
            self.dimension
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_from_config_dimension_mismatch() {
            assert!(FastEmbedder::from_config("all-MiniLM-L6-v2", 512).is_err());
            assert!(FastEmbedder::from_config("all-MiniLM-L6-v2", 384).is_ok());
            assert!(FastEmbedder::from_config("unknown-model", 384).is_err());
        }

        #[tokio::test]
        #[ignore = "Downloads model from network, slow"]
        async fn test_similar_texts_have_similar_embeddings() {
            let embedder = FastEmbedder::from_config("all-MiniLM-L6-v2", 384).unwrap();
            let a = embedder.embed("Patient is allergic to penicillin").await.unwrap();
            let b = embedder.embed("Has a penicillin allergy").await.unwrap();
            let c = embedder.embed("Enjoys gardening on weekends").await.unwrap();
            let near = crate::similarity::cosine(&a, &b);
            let far = crate::similarity::cosine(&a, &c);
            assert!(near > far, "{near} vs {far}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::similarity::cosine;

    #[tokio::test]
    async fn test_hashing_embedder_dimension_and_norm() {
        let embedder = HashingEmbedder::new(64).unwrap();
        let vector = embedder.embed("Patient is allergic to penicillin").await.unwrap();
        assert_eq!(vector.len(), 64);
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_hashing_embedder_is_deterministic() {
        let embedder = HashingEmbedder::new(128).unwrap();
        assert_eq!(
            embedder.embed_sync("Likes tea"),
            embedder.embed_sync("likes TEA!")
        );
    }

    #[test]
    fn test_shared_vocabulary_scores_higher() {
        let embedder = HashingEmbedder::new(256).unwrap();
        let a = embedder.embed_sync("Patient is allergic to penicillin");
        let b = embedder.embed_sync("Patient is severely allergic to penicillin");
        let c = embedder.embed_sync("Enjoys gardening on weekends");
        assert!(cosine(&a, &b) > cosine(&a, &c));
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        let embedder = HashingEmbedder::new(16).unwrap();
        assert!(embedder.embed_sync("...").iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_zero_dimension_rejected() {
        assert!(HashingEmbedder::new(0).is_err());
    }
}
