//! Read-path ranking: vector similarity re-weighted by clinical priority.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use homecare_common::{
    HomecareError, MemoryCategory, MemoryRepository, MemorySearchResult, Result, ScoredId,
    VectorIndex,
};
use tracing::{debug, instrument, warn};

use crate::config::{MemoryConfig, PriorityWeights};
use crate::deadline::within;

pub struct RankingEngine {
    repository: Arc<dyn MemoryRepository>,
    index: Arc<dyn VectorIndex>,
    weights: PriorityWeights,
    candidate_multiplier: usize,
    store_timeout: Duration,
    index_timeout: Duration,
}

impl RankingEngine {
    pub fn new(
        repository: Arc<dyn MemoryRepository>,
        index: Arc<dyn VectorIndex>,
        config: &MemoryConfig,
    ) -> Self {
        Self {
            repository,
            index,
            weights: config.priority_weights,
            candidate_multiplier: config.candidate_multiplier.max(1),
            store_timeout: config.store_timeout(),
            index_timeout: config.index_timeout(),
        }
    }

    /// Top `limit` active memories of `patient_id` for an embedded query.
    ///
    /// Over-fetches `limit * candidate_multiplier` neighbours so that a
    /// critical memory slightly further from the query can still outrank
    /// closer normal ones. A category filter is applied to the joined
    /// records, so the window keeps doubling until it yields `limit`
    /// matches or covers the whole patient.
    #[instrument(skip(self, query_vec))]
    pub async fn rank(
        &self,
        patient_id: &str,
        query_vec: &[f32],
        limit: usize,
        category: Option<MemoryCategory>,
    ) -> Result<Vec<MemorySearchResult>> {
        if limit == 0 {
            return Err(HomecareError::Validation(
                "limit must be at least 1".to_string(),
            ));
        }

        // Widen the window while filtered or dropped hits leave fewer than
        // `limit` results and the index may still hold more.
        let mut k = limit.saturating_mul(self.candidate_multiplier);
        let mut results = loop {
            let hits = within(
                self.index_timeout,
                self.index.query(patient_id, query_vec, k),
                HomecareError::VectorIndex,
            )
            .await?;
            let exhausted = hits.len() < k;
            let results = self.resolve_hits(patient_id, hits, category).await?;
            if exhausted || results.len() >= limit || k == usize::MAX {
                break results;
            }
            k = k.saturating_mul(2);
        };

        order_results(&mut results, &self.weights);
        results.truncate(limit);

        debug!(
            returned = results.len(),
            candidates = k,
            "Ranked search results"
        );
        Ok(results)
    }

    /// Join index hits with their active records, dropping hits with no
    /// active record and hits outside `category`.
    async fn resolve_hits(
        &self,
        patient_id: &str,
        hits: Vec<ScoredId>,
        category: Option<MemoryCategory>,
    ) -> Result<Vec<MemorySearchResult>> {
        if hits.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<_> = hits.iter().map(|h| h.id).collect();
        let records = within(
            self.store_timeout,
            self.repository.get_active_many(patient_id, &ids),
            HomecareError::Storage,
        )
        .await?;
        let mut by_id: HashMap<_, _> = records.into_iter().map(|m| (m.id, m)).collect();

        let mut results = Vec::with_capacity(hits.len());
        for hit in hits {
            let Some(memory) = by_id.remove(&hit.id) else {
                let inconsistency = HomecareError::StoreInconsistency(format!(
                    "index entry {} has no active record",
                    hit.id
                ));
                warn!(patient_id, memory_id = %hit.id, error = %inconsistency, "Dropping search candidate");
                continue;
            };
            if memory.patient_id != patient_id {
                let inconsistency = HomecareError::StoreInconsistency(format!(
                    "index entry {} belongs to another patient",
                    hit.id
                ));
                warn!(patient_id, memory_id = %hit.id, error = %inconsistency, "Dropping search candidate");
                continue;
            }
            if category.is_some_and(|c| c != memory.category) {
                continue;
            }
            results.push(MemorySearchResult {
                memory,
                relevance_score: clamp_score(hit.score),
            });
        }
        Ok(results)
    }
}

fn clamp_score(score: f32) -> f32 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

/// Total order: boosted score desc, raw score desc, newest first, then id.
pub fn order_results(results: &mut [MemorySearchResult], weights: &PriorityWeights) {
    results.sort_by(|a, b| {
        let boosted_a = a.relevance_score + weights.weight(a.memory.priority);
        let boosted_b = b.relevance_score + weights.weight(b.memory.priority);
        boosted_b
            .total_cmp(&boosted_a)
            .then_with(|| b.relevance_score.total_cmp(&a.relevance_score))
            .then_with(|| b.memory.created_at.cmp(&a.memory.created_at))
            .then_with(|| a.memory.id.cmp(&b.memory.id))
    });
}
