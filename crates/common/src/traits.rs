//! Collaborator traits at the boundary of the memory core.
//!
//! These traits are defined in `homecare-common` so that the adapter crates
//! (`homecare-llm`, storage backends) and the core in `homecare-memory` can
//! reference them without circular dependencies.

use crate::{CandidateFact, Memory, MemoryCategory, Priority, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Turns conversation utterances into candidate facts.
#[async_trait]
pub trait FactExtractor: Send + Sync {
    /// Extract candidate facts from an ordered list of utterances.
    ///
    /// May return zero candidates. Failures are reported as
    /// [`HomecareError::Extraction`](crate::HomecareError::Extraction).
    async fn extract(&self, patient_id: &str, conversation: &[String])
        -> Result<Vec<CandidateFact>>;

    fn name(&self) -> &str;
}

/// Turns text into a fixed-length vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed several texts, preserving order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text).await?);
        }
        Ok(vectors)
    }

    fn dimension(&self) -> usize;
}

/// Result of a soft delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    AlreadyDeleted,
    NotFound,
}

/// Active memory count for one (category, priority) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCount {
    pub category: MemoryCategory,
    pub priority: Priority,
    pub count: u64,
}

/// Relational store for memories.
///
/// Rows are written as *pending* and become visible only after [`commit`].
/// Every read method returns committed rows only, and every `*_active` method
/// additionally excludes soft-deleted rows.
///
/// [`commit`]: MemoryRepository::commit
#[async_trait]
pub trait MemoryRepository: Send + Sync {
    async fn insert_pending(&self, memory: &Memory) -> Result<()>;

    async fn commit(&self, id: Uuid) -> Result<()>;

    /// Remove a row that was never committed. No-op for committed rows.
    async fn discard_pending(&self, id: Uuid) -> Result<()>;

    /// Committed memory by id, soft-deleted or not.
    async fn get(&self, id: Uuid) -> Result<Option<Memory>>;

    async fn get_active_many(&self, patient_id: &str, ids: &[Uuid]) -> Result<Vec<Memory>>;

    async fn list_active(&self, patient_id: &str, category: MemoryCategory) -> Result<Vec<Memory>>;

    async fn list_active_ids(&self, patient_id: &str) -> Result<Vec<Uuid>>;

    /// Overwrite content, category, priority, metadata and `updated_at` of an
    /// active memory. Returns `false` if the memory is no longer active.
    async fn update(&self, memory: &Memory) -> Result<bool>;

    async fn soft_delete(&self, id: Uuid, at: DateTime<Utc>) -> Result<DeleteOutcome>;

    async fn count_active(&self, patient_id: &str) -> Result<Vec<CategoryCount>>;

    /// Active memories of a category created at or after `since`, newest first.
    async fn recent(
        &self,
        patient_id: &str,
        category: MemoryCategory,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Memory>>;

    /// Pending rows created before `older_than`.
    async fn list_pending(&self, older_than: DateTime<Utc>) -> Result<Vec<Memory>>;

    /// Patients with at least one active memory.
    async fn list_patients(&self) -> Result<Vec<String>>;
}

/// A vector index hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredId {
    pub id: Uuid,
    /// Cosine similarity to the query vector
    pub score: f32,
}

/// Approximate nearest-neighbour index, scoped by patient.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(&self, id: Uuid, patient_id: &str, vector: &[f32]) -> Result<()>;

    /// Remove an entry. Removing a missing entry is not an error.
    async fn remove(&self, id: Uuid) -> Result<()>;

    /// Stored vectors for the given ids, restricted to `patient_id`.
    async fn vectors(&self, patient_id: &str, ids: &[Uuid]) -> Result<Vec<(Uuid, Vec<f32>)>>;

    /// Top `k` entries of `patient_id` by cosine similarity, best first.
    async fn query(&self, patient_id: &str, vector: &[f32], k: usize) -> Result<Vec<ScoredId>>;

    async fn ids_for_patient(&self, patient_id: &str) -> Result<Vec<Uuid>>;

    /// Patients with at least one index entry.
    async fn list_patients(&self) -> Result<Vec<String>>;
}
