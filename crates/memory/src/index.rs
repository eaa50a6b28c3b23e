//! In-process vector index with brute-force cosine search.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use homecare_common::{Result, ScoredId, VectorIndex};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::similarity::cosine;

#[derive(Debug, Clone)]
struct Entry {
    patient_id: String,
    vector: Vec<f32>,
}

#[derive(Default)]
pub struct InMemoryVectorIndex {
    entries: RwLock<HashMap<Uuid, Entry>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.entries.read().contains_key(&id)
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert(&self, id: Uuid, patient_id: &str, vector: &[f32]) -> Result<()> {
        self.entries.write().insert(
            id,
            Entry {
                patient_id: patient_id.to_string(),
                vector: vector.to_vec(),
            },
        );
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> Result<()> {
        self.entries.write().remove(&id);
        Ok(())
    }

    async fn vectors(&self, patient_id: &str, ids: &[Uuid]) -> Result<Vec<(Uuid, Vec<f32>)>> {
        let entries = self.entries.read();
        Ok(ids
            .iter()
            .filter_map(|id| entries.get(id).map(|e| (*id, e)))
            .filter(|(_, e)| e.patient_id == patient_id)
            .map(|(id, e)| (id, e.vector.clone()))
            .collect())
    }

    async fn query(&self, patient_id: &str, vector: &[f32], k: usize) -> Result<Vec<ScoredId>> {
        let entries = self.entries.read();
        let mut hits: Vec<ScoredId> = entries
            .iter()
            .filter(|(_, e)| e.patient_id == patient_id)
            .map(|(id, e)| ScoredId {
                id: *id,
                score: cosine(vector, &e.vector),
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.id.cmp(&b.id)));
        hits.truncate(k);
        Ok(hits)
    }

    async fn ids_for_patient(&self, patient_id: &str) -> Result<Vec<Uuid>> {
        Ok(self
            .entries
            .read()
            .iter()
            .filter(|(_, e)| e.patient_id == patient_id)
            .map(|(id, _)| *id)
            .collect())
    }

    async fn list_patients(&self) -> Result<Vec<String>> {
        let entries = self.entries.read();
        let patients: BTreeSet<&str> = entries.values().map(|e| e.patient_id.as_str()).collect();
        Ok(patients.into_iter().map(str::to_string).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_query_is_patient_scoped_and_ordered() {
        let index = InMemoryVectorIndex::new();
        let near = Uuid::new_v4();
        let far = Uuid::new_v4();
        let other = Uuid::new_v4();
        index.upsert(near, "P1", &[1.0, 0.1]).await.unwrap();
        index.upsert(far, "P1", &[0.1, 1.0]).await.unwrap();
        index.upsert(other, "P2", &[1.0, 0.0]).await.unwrap();

        let hits = index.query("P1", &[1.0, 0.0], 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, near);
        assert_eq!(hits[1].id, far);
        assert!(hits[0].score > hits[1].score);

        let top = index.query("P1", &[1.0, 0.0], 1).await.unwrap();
        assert_eq!(top.len(), 1);
    }

    #[tokio::test]
    async fn test_vectors_and_remove() {
        let index = InMemoryVectorIndex::new();
        let id = Uuid::new_v4();
        index.upsert(id, "P1", &[0.5, 0.5]).await.unwrap();

        assert_eq!(index.vectors("P1", &[id]).await.unwrap().len(), 1);
        assert!(index.vectors("P2", &[id]).await.unwrap().is_empty());

        index.remove(id).await.unwrap();
        index.remove(id).await.unwrap();
        assert!(index.is_empty());
        assert!(index.ids_for_patient("P1").await.unwrap().is_empty());
        assert!(index.list_patients().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_patients() {
        let index = InMemoryVectorIndex::new();
        index.upsert(Uuid::new_v4(), "P2", &[1.0]).await.unwrap();
        index.upsert(Uuid::new_v4(), "P1", &[1.0]).await.unwrap();
        index.upsert(Uuid::new_v4(), "P1", &[0.5]).await.unwrap();
        assert_eq!(index.list_patients().await.unwrap(), vec!["P1", "P2"]);
    }
}
