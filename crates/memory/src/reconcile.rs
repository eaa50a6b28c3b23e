//! Background repair of store/index drift.
//!
//! Drift only appears after a failed rollback or a crash between the two
//! writes of an insert, update or delete. The reconciler brings a patient
//! back to "index entry exists iff the memory is active".

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use homecare_common::{Embedder, HomecareError, MemoryRepository, Result, VectorIndex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::MemoryConfig;
use crate::deadline::within;
use crate::locks::PatientLocks;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairReport {
    pub patient_id: String,
    /// Active memories that were missing from the index
    pub reindexed: usize,
    /// Index entries without an active memory
    pub orphans_removed: usize,
}

impl RepairReport {
    pub fn is_clean(&self) -> bool {
        self.reindexed == 0 && self.orphans_removed == 0
    }
}

pub struct Reconciler {
    repository: Arc<dyn MemoryRepository>,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    locks: PatientLocks,
    store_timeout: Duration,
    index_timeout: Duration,
    embedding_timeout: Duration,
}

impl Reconciler {
    pub fn new(
        repository: Arc<dyn MemoryRepository>,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        locks: PatientLocks,
        config: &MemoryConfig,
    ) -> Self {
        Self {
            repository,
            index,
            embedder,
            locks,
            store_timeout: config.store_timeout(),
            index_timeout: config.index_timeout(),
            embedding_timeout: config.embedding_timeout(),
        }
    }

    async fn drift(&self, patient_id: &str) -> Result<(Vec<Uuid>, Vec<Uuid>)> {
        let active: HashSet<Uuid> = within(
            self.store_timeout,
            self.repository.list_active_ids(patient_id),
            HomecareError::Storage,
        )
        .await?
        .into_iter()
        .collect();
        let indexed: HashSet<Uuid> = within(
            self.index_timeout,
            self.index.ids_for_patient(patient_id),
            HomecareError::VectorIndex,
        )
        .await?
        .into_iter()
        .collect();

        let missing = active.difference(&indexed).copied().collect();
        let orphans = indexed.difference(&active).copied().collect();
        Ok((missing, orphans))
    }

    /// Re-embed active memories missing from the index and drop index
    /// entries that no longer have an active memory.
    pub async fn reconcile_patient(&self, patient_id: &str) -> Result<RepairReport> {
        let mut report = RepairReport {
            patient_id: patient_id.to_string(),
            ..Default::default()
        };

        // Embed outside the lock, then re-check under it.
        let (missing, _) = self.drift(patient_id).await?;
        let mut prepared = Vec::new();
        if !missing.is_empty() {
            let memories = within(
                self.store_timeout,
                self.repository.get_active_many(patient_id, &missing),
                HomecareError::Storage,
            )
            .await?;
            let texts: Vec<String> = memories.iter().map(|m| m.content.clone()).collect();
            let vectors = within(
                self.embedding_timeout,
                self.embedder.embed_batch(&texts),
                HomecareError::Embedding,
            )
            .await?;
            prepared = memories.into_iter().zip(vectors).collect();
        }

        let _guard = self.locks.acquire(patient_id).await;
        let (missing, orphans) = self.drift(patient_id).await?;
        let missing: HashSet<Uuid> = missing.into_iter().collect();

        for (memory, vector) in prepared {
            if !missing.contains(&memory.id) {
                continue;
            }
            // content may have changed since it was embedded
            let current = within(
                self.store_timeout,
                self.repository.get(memory.id),
                HomecareError::Storage,
            )
            .await?;
            if !current.is_some_and(|c| c.is_active() && c.content == memory.content) {
                continue;
            }
            within(
                self.index_timeout,
                self.index.upsert(memory.id, patient_id, &vector),
                HomecareError::VectorIndex,
            )
            .await?;
            report.reindexed += 1;
        }

        for id in orphans {
            within(
                self.index_timeout,
                self.index.remove(id),
                HomecareError::VectorIndex,
            )
            .await?;
            report.orphans_removed += 1;
        }

        if report.is_clean() {
            debug!(patient_id, "Patient memories consistent");
        } else {
            info!(
                patient_id,
                reindexed = report.reindexed,
                orphans_removed = report.orphans_removed,
                "Repaired patient memories"
            );
        }
        Ok(report)
    }

    /// Drop pending rows created before `older_than`, with any index entry
    /// they left behind. Returns the number discarded.
    pub async fn discard_stale_pending(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let pending = within(
            self.store_timeout,
            self.repository.list_pending(older_than),
            HomecareError::Storage,
        )
        .await?;

        let mut discarded = 0;
        for memory in pending {
            let _guard = self.locks.acquire(&memory.patient_id).await;
            let committed = within(
                self.store_timeout,
                self.repository.get(memory.id),
                HomecareError::Storage,
            )
            .await?;
            if committed.is_some() {
                continue;
            }
            within(
                self.index_timeout,
                self.index.remove(memory.id),
                HomecareError::VectorIndex,
            )
            .await?;
            within(
                self.store_timeout,
                self.repository.discard_pending(memory.id),
                HomecareError::Storage,
            )
            .await?;
            discarded += 1;
        }
        if discarded > 0 {
            info!(discarded, "Discarded stale pending memories");
        }
        Ok(discarded)
    }

    /// Patients known to either side. A patient whose last memory was
    /// deleted can still hold an orphaned index entry.
    async fn patients(&self) -> Result<BTreeSet<String>> {
        let mut patients: BTreeSet<String> = within(
            self.store_timeout,
            self.repository.list_patients(),
            HomecareError::Storage,
        )
        .await?
        .into_iter()
        .collect();
        patients.extend(
            within(
                self.index_timeout,
                self.index.list_patients(),
                HomecareError::VectorIndex,
            )
            .await?,
        );
        Ok(patients)
    }

    /// One repair pass over every patient with active memories or index
    /// entries.
    pub async fn run_once(&self, pending_grace: Duration) -> Result<Vec<RepairReport>> {
        let grace = chrono::Duration::from_std(pending_grace)
            .map_err(|e| HomecareError::Config(format!("Invalid pending grace period: {e}")))?;
        self.discard_stale_pending(Utc::now() - grace).await?;

        let patients = self.patients().await?;

        let mut reports = Vec::with_capacity(patients.len());
        for patient_id in patients {
            match self.reconcile_patient(&patient_id).await {
                Ok(report) => reports.push(report),
                Err(e) => warn!(patient_id = %patient_id, error = %e, "Reconciliation failed"),
            }
        }
        Ok(reports)
    }
}
