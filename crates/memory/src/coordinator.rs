//! The memory store coordinator.
//!
//! Owns the write and read paths for patient memories and keeps the
//! relational store and the vector index consistent:
//!
//! - inserts go *pending row → index upsert → commit*, and a failed upsert
//!   discards the pending row;
//! - updates snapshot the row first and restore it if the index upsert fails;
//! - deletes hide the row before touching the index.
//!
//! Extraction and embedding run before the per-patient lock is taken; the
//! lock covers only the read-decide-write of each ingest.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use homecare_common::{
    is_degenerate, merge_metadata, validate_content, validate_patient_id, CandidateFact,
    DeleteOutcome, Embedder, FactExtractor, HomecareError, Memory, MemoryCategory, MemoryPatch,
    MemoryRepository, MemorySearchResult, PatientSummary, Result, VectorIndex,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::MemoryConfig;
use crate::deadline::within;
use crate::locks::PatientLocks;
use crate::ranking::RankingEngine;
use crate::reconcile::Reconciler;
use crate::resolver::{ConflictResolver, Decision, SUPERSEDES_KEY};

/// A candidate that could not be applied during ingest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateFailure {
    /// Position of the candidate in extractor output
    pub index: usize,
    pub code: String,
    pub error: String,
}

/// Outcome of one ingest call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    /// Created and updated memories, in application order, without repeats
    pub memory_ids: Vec<Uuid>,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failures: Vec<CandidateFailure>,
}

impl IngestReport {
    fn record(&mut self, id: Uuid) {
        if !self.memory_ids.contains(&id) {
            self.memory_ids.push(id);
        }
    }
}

enum Applied {
    Created(Uuid),
    Updated(Uuid),
    Skipped,
}

pub struct MemoryCoordinator {
    config: MemoryConfig,
    extractor: Arc<dyn FactExtractor>,
    embedder: Arc<dyn Embedder>,
    repository: Arc<dyn MemoryRepository>,
    index: Arc<dyn VectorIndex>,
    resolver: ConflictResolver,
    ranking: RankingEngine,
    locks: PatientLocks,
}

impl MemoryCoordinator {
    pub fn new(
        config: MemoryConfig,
        extractor: Arc<dyn FactExtractor>,
        embedder: Arc<dyn Embedder>,
        repository: Arc<dyn MemoryRepository>,
        index: Arc<dyn VectorIndex>,
    ) -> Result<Self> {
        config.validate()?;
        if embedder.dimension() != config.embedding_dimension {
            return Err(HomecareError::Config(format!(
                "Embedder produces {}-dim vectors but embedding_dimension is {}",
                embedder.dimension(),
                config.embedding_dimension
            )));
        }

        info!(
            extractor = extractor.name(),
            dimension = config.embedding_dimension,
            update_threshold = config.update_threshold,
            "Initializing memory coordinator"
        );

        Ok(Self {
            resolver: ConflictResolver::new(repository.clone(), index.clone(), &config),
            ranking: RankingEngine::new(repository.clone(), index.clone(), &config),
            locks: PatientLocks::new(),
            config,
            extractor,
            embedder,
            repository,
            index,
        })
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn locks(&self) -> &PatientLocks {
        &self.locks
    }

    /// Background repair sharing this coordinator's stores and locks.
    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            self.repository.clone(),
            self.index.clone(),
            self.embedder.clone(),
            self.locks.clone(),
            &self.config,
        )
    }

    /// Extract facts from a conversation and reconcile them into the
    /// patient's memories.
    ///
    /// Extraction or embedding failure aborts the call before anything is
    /// written. Once under the lock, each candidate succeeds or fails on its
    /// own and failures are listed in the report.
    #[instrument(skip(self, conversation), fields(utterances = conversation.len()))]
    pub async fn ingest(&self, patient_id: &str, conversation: &[String]) -> Result<IngestReport> {
        validate_patient_id(patient_id)?;
        if conversation.iter().all(|u| u.trim().is_empty()) {
            return Err(HomecareError::Validation(
                "conversation must contain at least one non-empty utterance".to_string(),
            ));
        }

        let candidates = within(
            self.config.extraction_timeout(),
            self.extractor.extract(patient_id, conversation),
            HomecareError::Extraction,
        )
        .await?;

        let mut report = IngestReport::default();
        if candidates.is_empty() {
            debug!(patient_id, "No candidate facts extracted");
            return Ok(report);
        }

        let vectors = self.embed_candidates(&candidates).await?;

        let _guard = self.locks.acquire(patient_id).await;
        for (index, (candidate, vector)) in candidates.iter().zip(vectors).enumerate() {
            match self.apply(patient_id, candidate, vector.as_deref()).await {
                Ok(Applied::Created(id)) => {
                    report.created += 1;
                    report.record(id);
                }
                Ok(Applied::Updated(id)) => {
                    report.updated += 1;
                    report.record(id);
                }
                Ok(Applied::Skipped) => report.skipped += 1,
                Err(e) => {
                    warn!(patient_id, candidate = index, error = %e, "Failed to apply candidate");
                    report.failures.push(CandidateFailure {
                        index,
                        code: e.code().to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            patient_id,
            created = report.created,
            updated = report.updated,
            skipped = report.skipped,
            failed = report.failures.len(),
            "Ingested conversation"
        );
        Ok(report)
    }

    /// Embed every non-degenerate candidate in one batch. Degenerate ones get
    /// `None` and are skipped by the resolver.
    async fn embed_candidates(&self, candidates: &[CandidateFact]) -> Result<Vec<Option<Vec<f32>>>> {
        let texts: Vec<String> = candidates
            .iter()
            .filter(|c| !is_degenerate(&c.content))
            .map(|c| c.content.trim().to_string())
            .collect();

        let mut embedded = if texts.is_empty() {
            Vec::new()
        } else {
            self.embed_texts(&texts).await?
        }
        .into_iter();

        Ok(candidates
            .iter()
            .map(|c| {
                if is_degenerate(&c.content) {
                    None
                } else {
                    embedded.next()
                }
            })
            .collect())
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let vectors = within(
            self.config.embedding_timeout(),
            self.embedder.embed_batch(texts),
            HomecareError::Embedding,
        )
        .await?;
        if vectors.len() != texts.len() {
            return Err(HomecareError::Embedding(format!(
                "Embedded {} of {} texts",
                vectors.len(),
                texts.len()
            )));
        }
        if let Some(bad) = vectors
            .iter()
            .find(|v| v.len() != self.config.embedding_dimension)
        {
            return Err(HomecareError::Embedding(format!(
                "Embedding has dimension {}, expected {}",
                bad.len(),
                self.config.embedding_dimension
            )));
        }
        Ok(vectors)
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_texts(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| HomecareError::Embedding("Empty embedding response".to_string()))
    }

    async fn apply(
        &self,
        patient_id: &str,
        candidate: &CandidateFact,
        vector: Option<&[f32]>,
    ) -> Result<Applied> {
        validate_content(&candidate.content)?;
        let decision = self.resolver.resolve(patient_id, candidate, vector).await?;
        match decision {
            Decision::Skip => Ok(Applied::Skipped),
            Decision::Insert { best_match } => {
                let vector = vector.ok_or_else(missing_vector)?;
                let mut memory = Memory::from_candidate(patient_id, candidate);
                memory.metadata.remove(SUPERSEDES_KEY);
                self.insert(&memory, vector).await?;
                debug!(patient_id, memory_id = %memory.id, ?best_match, "Inserted memory");
                Ok(Applied::Created(memory.id))
            }
            Decision::Update {
                existing,
                similarity,
            } => {
                let vector = vector.ok_or_else(missing_vector)?;
                let mut updated = (*existing).clone();
                updated.content = candidate.content.trim().to_string();
                merge_metadata(&mut updated.metadata, &candidate.metadata);
                updated.metadata.remove(SUPERSEDES_KEY);
                updated.priority = updated.priority.max(candidate.resolved_priority());
                updated.updated_at = Utc::now();

                self.replace(&existing, &updated, Some(vector)).await?;
                debug!(patient_id, memory_id = %updated.id, similarity, "Updated memory");
                Ok(Applied::Updated(updated.id))
            }
        }
    }

    /// Pending row, then index, then commit. Leaves nothing visible on
    /// failure.
    async fn insert(&self, memory: &Memory, vector: &[f32]) -> Result<()> {
        within(
            self.config.store_timeout(),
            self.repository.insert_pending(memory),
            HomecareError::Storage,
        )
        .await?;

        if let Err(e) = within(
            self.config.index_timeout(),
            self.index.upsert(memory.id, &memory.patient_id, vector),
            HomecareError::VectorIndex,
        )
        .await
        {
            self.discard(memory.id).await;
            return Err(e);
        }

        if let Err(e) = within(
            self.config.store_timeout(),
            self.repository.commit(memory.id),
            HomecareError::Storage,
        )
        .await
        {
            if let Err(remove_err) = within(
                self.config.index_timeout(),
                self.index.remove(memory.id),
                HomecareError::VectorIndex,
            )
            .await
            {
                warn!(memory_id = %memory.id, error = %remove_err, "Orphan index entry left for reconciliation");
            }
            self.discard(memory.id).await;
            return Err(e);
        }
        Ok(())
    }

    async fn discard(&self, id: Uuid) {
        if let Err(e) = within(
            self.config.store_timeout(),
            self.repository.discard_pending(id),
            HomecareError::Storage,
        )
        .await
        {
            warn!(memory_id = %id, error = %e, "Pending row left for reconciliation");
        }
    }

    /// Overwrite `snapshot` with `updated`, then refresh the index entry when
    /// a new vector is given. Restores the snapshot if the index write fails.
    async fn replace(&self, snapshot: &Memory, updated: &Memory, vector: Option<&[f32]>) -> Result<()> {
        let written = within(
            self.config.store_timeout(),
            self.repository.update(updated),
            HomecareError::Storage,
        )
        .await?;
        if !written {
            return Err(HomecareError::not_found(updated.id));
        }

        let Some(vector) = vector else {
            return Ok(());
        };

        if let Err(e) = within(
            self.config.index_timeout(),
            self.index.upsert(updated.id, &updated.patient_id, vector),
            HomecareError::VectorIndex,
        )
        .await
        {
            match within(
                self.config.store_timeout(),
                self.repository.update(snapshot),
                HomecareError::Storage,
            )
            .await
            {
                Ok(_) => debug!(memory_id = %snapshot.id, "Restored memory after index failure"),
                Err(restore_err) => warn!(
                    memory_id = %snapshot.id,
                    error = %restore_err,
                    "Failed to restore memory after index failure"
                ),
            }
            return Err(e);
        }
        Ok(())
    }

    /// Priority-ranked semantic search over one patient's active memories.
    #[instrument(skip(self, query))]
    pub async fn search(
        &self,
        patient_id: &str,
        query: &str,
        limit: usize,
        category: Option<MemoryCategory>,
    ) -> Result<Vec<MemorySearchResult>> {
        validate_patient_id(patient_id)?;
        if query.trim().is_empty() {
            return Err(HomecareError::Validation(
                "query must not be empty".to_string(),
            ));
        }
        if limit == 0 || limit > self.config.max_search_limit {
            return Err(HomecareError::Validation(format!(
                "limit must be between 1 and {}",
                self.config.max_search_limit
            )));
        }

        let query_vec = self.embed_one(query.trim()).await?;
        self.ranking
            .rank(patient_id, &query_vec, limit, category)
            .await
    }

    /// Active memory by id.
    pub async fn get(&self, memory_id: Uuid) -> Result<Memory> {
        within(
            self.config.store_timeout(),
            self.repository.get(memory_id),
            HomecareError::Storage,
        )
        .await?
        .filter(Memory::is_active)
        .ok_or_else(|| HomecareError::not_found(memory_id))
    }

    /// Direct edit of a memory, bypassing conflict resolution.
    ///
    /// Changed content is re-embedded; metadata is merged and a `null`
    /// value removes the key.
    #[instrument(skip(self, patch))]
    pub async fn update(&self, memory_id: Uuid, patch: MemoryPatch) -> Result<Memory> {
        if patch.is_empty() {
            return Err(HomecareError::Validation(
                "update must change content or metadata".to_string(),
            ));
        }
        let new_content = match patch.content.as_deref() {
            Some(content) => {
                validate_content(content)?;
                Some(content.trim().to_string())
            }
            None => None,
        };

        let current = self.get(memory_id).await?;
        let mut vector = match &new_content {
            Some(content) if *content != current.content => Some(self.embed_one(content).await?),
            _ => None,
        };

        let _guard = self.locks.acquire(&current.patient_id).await;
        let snapshot = self.get(memory_id).await?;

        let mut updated = snapshot.clone();
        if let Some(content) = new_content {
            if content != snapshot.content {
                if vector.is_none() {
                    // content changed under us since the first read
                    vector = Some(self.embed_one(&content).await?);
                }
                updated.content = content;
            } else {
                vector = None;
            }
        }
        if let Some(metadata) = &patch.metadata {
            merge_metadata(&mut updated.metadata, metadata);
        }
        updated.updated_at = Utc::now();

        self.replace(&snapshot, &updated, vector.as_deref()).await?;
        info!(patient_id = %updated.patient_id, memory_id = %memory_id, "Updated memory");
        Ok(updated)
    }

    /// Soft-delete a memory. Deleting an already deleted memory succeeds.
    #[instrument(skip(self))]
    pub async fn soft_delete(&self, memory_id: Uuid) -> Result<()> {
        let memory = within(
            self.config.store_timeout(),
            self.repository.get(memory_id),
            HomecareError::Storage,
        )
        .await?
        .ok_or_else(|| HomecareError::not_found(memory_id))?;

        let _guard = self.locks.acquire(&memory.patient_id).await;
        let outcome = within(
            self.config.store_timeout(),
            self.repository.soft_delete(memory_id, Utc::now()),
            HomecareError::Storage,
        )
        .await?;

        match outcome {
            DeleteOutcome::NotFound => return Err(HomecareError::not_found(memory_id)),
            DeleteOutcome::AlreadyDeleted => {
                debug!(memory_id = %memory_id, "Memory already deleted");
            }
            DeleteOutcome::Deleted => {
                info!(patient_id = %memory.patient_id, memory_id = %memory_id, "Soft-deleted memory");
            }
        }

        if let Err(e) = within(
            self.config.index_timeout(),
            self.index.remove(memory_id),
            HomecareError::VectorIndex,
        )
        .await
        {
            warn!(memory_id = %memory_id, error = %e, "Stale index entry left for reconciliation");
        }
        Ok(())
    }

    /// Counts and recent observations over the patient's active memories.
    #[instrument(skip(self))]
    pub async fn summary(&self, patient_id: &str) -> Result<PatientSummary> {
        validate_patient_id(patient_id)?;

        let counts = within(
            self.config.store_timeout(),
            self.repository.count_active(patient_id),
            HomecareError::Storage,
        )
        .await?;

        let mut memories_by_category: BTreeMap<MemoryCategory, u64> =
            MemoryCategory::ALL.iter().map(|c| (*c, 0)).collect();
        let mut total_memories = 0;
        let mut critical_memories = 0;
        for count in &counts {
            *memories_by_category.entry(count.category).or_default() += count.count;
            total_memories += count.count;
            if count.priority.is_critical() {
                critical_memories += count.count;
            }
        }

        let since = Utc::now() - chrono::Duration::days(self.config.recent_observation_days);
        let recent_observations = within(
            self.config.store_timeout(),
            self.repository.recent(
                patient_id,
                MemoryCategory::Observation,
                since,
                self.config.recent_observation_limit,
            ),
            HomecareError::Storage,
        )
        .await?;

        Ok(PatientSummary {
            patient_id: patient_id.to_string(),
            total_memories,
            critical_memories,
            memories_by_category,
            recent_observations,
        })
    }
}

fn missing_vector() -> HomecareError {
    HomecareError::Embedding("No embedding for candidate".to_string())
}
