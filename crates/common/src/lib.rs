//! Common types and traits shared across Homecare Memory crates.
//!
//! This crate provides the memory data model, input validation, the error
//! taxonomy, and the traits every external collaborator implements.

pub mod error;
pub mod memory;
pub mod traits;
pub mod validation;

pub use error::{HomecareError, Result};
pub use memory::{
    CandidateFact, Memory, MemoryCategory, MemoryPatch, MemorySearchResult, Metadata,
    PatientSummary, Priority, merge_metadata,
};
pub use traits::{
    CategoryCount, DeleteOutcome, Embedder, FactExtractor, MemoryRepository, ScoredId,
    VectorIndex,
};
pub use validation::{MAX_CONTENT_CHARS, is_degenerate, validate_content, validate_patient_id};
