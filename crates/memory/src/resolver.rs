//! Write-path conflict resolution.
//!
//! Decides whether a candidate fact becomes a new memory, refreshes an
//! existing one, or is dropped. Resolution is deterministic: no model is
//! consulted, only embeddings, lexical overlap and a few contradiction rules.
//!
//! ```text
//!   degenerate content ─────────────────────────────▶ Skip
//!   no active memory in category ───────────────────▶ Insert
//!   best ≥ update_threshold ─┬─ unguarded / agrees ─▶ Update(best)
//!                            └─ guarded + contradicts ─┐
//!   guarded, best ≥ floor ────────────────────────────┤
//!                                                      ▼
//!                               supersedes best? ─ yes ▶ Update(best)
//!                                                └ no ─▶ Insert
//!   anything else ──────────────────────────────────▶ Insert
//! ```
//!
//! A pair is *guarded* when either side is critical.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use homecare_common::{
    is_degenerate, CandidateFact, HomecareError, Memory, MemoryRepository, Result, VectorIndex,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::MemoryConfig;
use crate::deadline::within;
use crate::similarity::{contradicts, similarity};

/// Metadata key a candidate uses to explicitly replace an existing memory.
pub const SUPERSEDES_KEY: &str = "supersedes";

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Insert {
        /// Best similarity among existing memories, if any were compared
        best_match: Option<f32>,
    },
    Update {
        existing: Box<Memory>,
        similarity: f32,
    },
    Skip,
}

impl Decision {
    pub fn is_insert(&self) -> bool {
        matches!(self, Self::Insert { .. })
    }

    pub fn update_target(&self) -> Option<Uuid> {
        match self {
            Self::Update { existing, .. } => Some(existing.id),
            _ => None,
        }
    }
}

pub struct ConflictResolver {
    repository: Arc<dyn MemoryRepository>,
    index: Arc<dyn VectorIndex>,
    update_threshold: f32,
    contradiction_floor: f32,
    store_timeout: Duration,
    index_timeout: Duration,
}

impl ConflictResolver {
    pub fn new(
        repository: Arc<dyn MemoryRepository>,
        index: Arc<dyn VectorIndex>,
        config: &MemoryConfig,
    ) -> Self {
        Self {
            repository,
            index,
            update_threshold: config.update_threshold,
            contradiction_floor: config.contradiction_floor,
            store_timeout: config.store_timeout(),
            index_timeout: config.index_timeout(),
        }
    }

    /// Resolve a candidate against the patient's active memories of the same
    /// category. Callers serialize writes per patient.
    pub async fn resolve(
        &self,
        patient_id: &str,
        candidate: &CandidateFact,
        candidate_vec: Option<&[f32]>,
    ) -> Result<Decision> {
        if is_degenerate(&candidate.content) {
            debug!(patient_id, category = %candidate.category, "Skipping degenerate candidate");
            return Ok(Decision::Skip);
        }

        let existing = within(
            self.store_timeout,
            self.repository.list_active(patient_id, candidate.category),
            HomecareError::Storage,
        )
        .await?;

        if existing.is_empty() {
            return Ok(Decision::Insert { best_match: None });
        }

        let vectors = match candidate_vec {
            Some(_) => self.existing_vectors(patient_id, &existing).await,
            None => HashMap::new(),
        };

        let mut best: Option<(f32, Memory)> = None;
        for memory in existing {
            let score = similarity(
                &candidate.content,
                &memory.content,
                candidate_vec,
                vectors.get(&memory.id).map(Vec::as_slice),
            );
            let better = match &best {
                None => true,
                Some((best_score, best_memory)) => {
                    score > *best_score
                        || (score == *best_score && memory.updated_at > best_memory.updated_at)
                }
            };
            if better {
                best = Some((score, memory));
            }
        }

        let Some((score, best)) = best else {
            return Ok(Decision::Insert { best_match: None });
        };

        let guarded = candidate.resolved_priority().is_critical() || best.priority.is_critical();

        let needs_disambiguation = if score >= self.update_threshold {
            guarded && contradicts(&candidate.content, &best.content)
        } else {
            guarded && score >= self.contradiction_floor
        };

        if needs_disambiguation {
            if supersedes(candidate, best.id) {
                debug!(patient_id, memory_id = %best.id, score, "Candidate explicitly supersedes critical memory");
                return Ok(Decision::Update {
                    existing: Box::new(best),
                    similarity: score,
                });
            }
            debug!(
                patient_id,
                memory_id = %best.id,
                score,
                "Ambiguous critical match, keeping both records"
            );
            return Ok(Decision::Insert {
                best_match: Some(score),
            });
        }

        if score >= self.update_threshold {
            return Ok(Decision::Update {
                existing: Box::new(best),
                similarity: score,
            });
        }

        Ok(Decision::Insert {
            best_match: Some(score),
        })
    }

    /// Indexed vectors of the existing memories. An unavailable index
    /// degrades to lexical comparison rather than failing the candidate.
    async fn existing_vectors(
        &self,
        patient_id: &str,
        existing: &[Memory],
    ) -> HashMap<Uuid, Vec<f32>> {
        let ids: Vec<Uuid> = existing.iter().map(|m| m.id).collect();
        match within(
            self.index_timeout,
            self.index.vectors(patient_id, &ids),
            HomecareError::VectorIndex,
        )
        .await
        {
            Ok(pairs) => pairs.into_iter().collect(),
            Err(e) => {
                warn!(patient_id, error = %e, "Vector lookup failed, using lexical similarity");
                HashMap::new()
            }
        }
    }
}

/// `"supersedes": true`, or `"supersedes": "<id>"` naming the matched memory.
pub fn supersedes(candidate: &CandidateFact, target: Uuid) -> bool {
    match candidate.metadata.get(SUPERSEDES_KEY) {
        Some(serde_json::Value::Bool(flag)) => *flag,
        Some(serde_json::Value::String(id)) => {
            Uuid::parse_str(id.trim()).is_ok_and(|id| id == target)
        }
        _ => false,
    }
}
