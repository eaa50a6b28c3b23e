//! Error types for Homecare Memory.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HomecareError {
    /// Malformed input, rejected before any store is touched.
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Memory not found: {id}")]
    NotFound { id: String },

    #[error("Extraction failed: {0}")]
    Extraction(String),

    #[error("Embedding failed: {0}")]
    Embedding(String),

    /// Relational store and vector index disagree about a memory.
    #[error("Store inconsistency: {0}")]
    StoreInconsistency(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Vector index error: {0}")]
    VectorIndex(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HomecareError {
    pub fn not_found(id: impl ToString) -> Self {
        Self::NotFound { id: id.to_string() }
    }

    /// External service failures the caller may retry. The core itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Extraction(_) | Self::Embedding(_))
    }

    /// Stable machine-readable code for transport layers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_FAILURE",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Extraction(_) => "EXTRACTION_FAILURE",
            Self::Embedding(_) => "EMBEDDING_FAILURE",
            Self::StoreInconsistency(_) => "STORE_INCONSISTENCY",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::VectorIndex(_) => "VECTOR_INDEX_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, HomecareError>;
