//! In-process relational store.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use homecare_common::{
    CategoryCount, DeleteOutcome, HomecareError, Memory, MemoryCategory, MemoryRepository, Priority, Result,
};
use parking_lot::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Row {
    memory: Memory,
    committed: bool,
}

/// Memory repository held in a process-local map.
///
/// Used as the default backend when no database is configured and as the
/// test backend. Contents are lost on restart.
#[derive(Default)]
pub struct InMemoryRepository {
    rows: RwLock<HashMap<Uuid, Row>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows in any state, for tests and diagnostics.
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    fn active_for<'a>(
        rows: &'a HashMap<Uuid, Row>,
        patient_id: &'a str,
    ) -> impl Iterator<Item = &'a Memory> + 'a {
        rows.values()
            .filter(move |r| r.committed && r.memory.is_active() && r.memory.patient_id == patient_id)
            .map(|r| &r.memory)
    }
}

#[async_trait]
impl MemoryRepository for InMemoryRepository {
    async fn insert_pending(&self, memory: &Memory) -> Result<()> {
        self.rows.write().insert(
            memory.id,
            Row {
                memory: memory.clone(),
                committed: false,
            },
        );
        Ok(())
    }

    async fn commit(&self, id: Uuid) -> Result<()> {
        match self.rows.write().get_mut(&id) {
            Some(row) => {
                row.committed = true;
                Ok(())
            }
            None => Err(HomecareError::Storage(format!(
                "No pending row {id} to commit"
            ))),
        }
    }

    async fn discard_pending(&self, id: Uuid) -> Result<()> {
        let mut rows = self.rows.write();
        if rows.get(&id).is_some_and(|r| !r.committed) {
            rows.remove(&id);
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Memory>> {
        Ok(self
            .rows
            .read()
            .get(&id)
            .filter(|r| r.committed)
            .map(|r| r.memory.clone()))
    }

    async fn get_active_many(&self, patient_id: &str, ids: &[Uuid]) -> Result<Vec<Memory>> {
        let rows = self.rows.read();
        Ok(ids
            .iter()
            .filter_map(|id| rows.get(id))
            .filter(|r| r.committed && r.memory.is_active() && r.memory.patient_id == patient_id)
            .map(|r| r.memory.clone())
            .collect())
    }

    async fn list_active(&self, patient_id: &str, category: MemoryCategory) -> Result<Vec<Memory>> {
        let rows = self.rows.read();
        let mut memories: Vec<Memory> = Self::active_for(&rows, patient_id)
            .filter(|m| m.category == category)
            .cloned()
            .collect();
        memories.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(memories)
    }

    async fn list_active_ids(&self, patient_id: &str) -> Result<Vec<Uuid>> {
        let rows = self.rows.read();
        Ok(Self::active_for(&rows, patient_id).map(|m| m.id).collect())
    }

    async fn update(&self, memory: &Memory) -> Result<bool> {
        let mut rows = self.rows.write();
        match rows.get_mut(&memory.id) {
            Some(row) if row.committed && row.memory.is_active() => {
                let stored = &mut row.memory;
                stored.content = memory.content.clone();
                stored.category = memory.category;
                stored.priority = memory.priority;
                stored.metadata = memory.metadata.clone();
                stored.updated_at = memory.updated_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn soft_delete(&self, id: Uuid, at: DateTime<Utc>) -> Result<DeleteOutcome> {
        let mut rows = self.rows.write();
        match rows.get_mut(&id) {
            Some(row) if row.committed => {
                if row.memory.deleted_at.is_some() {
                    return Ok(DeleteOutcome::AlreadyDeleted);
                }
                row.memory.deleted_at = Some(at);
                row.memory.updated_at = at;
                Ok(DeleteOutcome::Deleted)
            }
            _ => Ok(DeleteOutcome::NotFound),
        }
    }

    async fn count_active(&self, patient_id: &str) -> Result<Vec<CategoryCount>> {
        let rows = self.rows.read();
        let mut counts: BTreeMap<(MemoryCategory, Priority), u64> = BTreeMap::new();
        for memory in Self::active_for(&rows, patient_id) {
            *counts.entry((memory.category, memory.priority)).or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .map(|((category, priority), count)| CategoryCount {
                category,
                priority,
                count,
            })
            .collect())
    }

    async fn recent(
        &self,
        patient_id: &str,
        category: MemoryCategory,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Memory>> {
        let rows = self.rows.read();
        let mut memories: Vec<Memory> = Self::active_for(&rows, patient_id)
            .filter(|m| m.category == category && m.created_at >= since)
            .cloned()
            .collect();
        memories.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        memories.truncate(limit);
        Ok(memories)
    }

    async fn list_pending(&self, older_than: DateTime<Utc>) -> Result<Vec<Memory>> {
        Ok(self
            .rows
            .read()
            .values()
            .filter(|r| !r.committed && r.memory.created_at < older_than)
            .map(|r| r.memory.clone())
            .collect())
    }

    async fn list_patients(&self) -> Result<Vec<String>> {
        let rows = self.rows.read();
        let patients: HashSet<&str> = rows
            .values()
            .filter(|r| r.committed && r.memory.is_active())
            .map(|r| r.memory.patient_id.as_str())
            .collect();
        let mut patients: Vec<String> = patients.into_iter().map(str::to_string).collect();
        patients.sort();
        Ok(patients)
    }
}
