//! pgvector-backed similarity index.
//!
//! Vectors live in their own table so the relational rows and the index can
//! drift and be repaired independently, exactly like an external vector
//! database would behave.

use async_trait::async_trait;
use homecare_common::{HomecareError, Result, ScoredId, VectorIndex};
use pgvector::Vector;
use sqlx::postgres::PgPool;
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

fn index_error(e: sqlx::Error) -> HomecareError {
    HomecareError::VectorIndex(e.to_string())
}

pub struct PgVectorIndex {
    pool: PgPool,
    dimension: usize,
}

impl PgVectorIndex {
    pub fn new(pool: PgPool, dimension: usize) -> Self {
        Self { pool, dimension }
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        let statements = [
            "CREATE EXTENSION IF NOT EXISTS vector".to_string(),
            format!(
                "CREATE TABLE IF NOT EXISTS memory_vectors (\
                 memory_id UUID PRIMARY KEY, \
                 patient_id TEXT NOT NULL, \
                 embedding vector({}) NOT NULL)",
                self.dimension
            ),
            "CREATE INDEX IF NOT EXISTS idx_memory_vectors_patient ON memory_vectors (patient_id)"
                .to_string(),
            "CREATE INDEX IF NOT EXISTS idx_memory_vectors_embedding \
             ON memory_vectors USING hnsw (embedding vector_cosine_ops)"
                .to_string(),
        ];
        for statement in &statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(index_error)?;
        }
        info!(dimension = self.dimension, "Vector index schema ready");
        Ok(())
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(HomecareError::VectorIndex(format!(
                "Expected {}-dim vector, got {}",
                self.dimension,
                vector.len()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for PgVectorIndex {
    async fn upsert(&self, id: Uuid, patient_id: &str, vector: &[f32]) -> Result<()> {
        self.check_dimension(vector)?;
        sqlx::query(
            "INSERT INTO memory_vectors (memory_id, patient_id, embedding) VALUES ($1, $2, $3) \
             ON CONFLICT (memory_id) DO UPDATE \
             SET patient_id = EXCLUDED.patient_id, embedding = EXCLUDED.embedding",
        )
        .bind(id)
        .bind(patient_id)
        .bind(Vector::from(vector.to_vec()))
        .execute(&self.pool)
        .await
        .map_err(index_error)?;
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM memory_vectors WHERE memory_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(index_error)?;
        Ok(())
    }

    async fn vectors(&self, patient_id: &str, ids: &[Uuid]) -> Result<Vec<(Uuid, Vec<f32>)>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "SELECT memory_id, embedding FROM memory_vectors \
             WHERE patient_id = $1 AND memory_id = ANY($2)",
        )
        .bind(patient_id)
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(index_error)?;

        rows.iter()
            .map(|row| {
                let id: Uuid = row.try_get("memory_id").map_err(index_error)?;
                let embedding: Vector = row.try_get("embedding").map_err(index_error)?;
                Ok((id, embedding.to_vec()))
            })
            .collect()
    }

    async fn query(&self, patient_id: &str, vector: &[f32], k: usize) -> Result<Vec<ScoredId>> {
        self.check_dimension(vector)?;
        if k == 0 {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "SELECT memory_id, 1 - (embedding <=> $2) AS score FROM memory_vectors \
             WHERE patient_id = $1 \
             ORDER BY embedding <=> $2, memory_id \
             LIMIT $3",
        )
        .bind(patient_id)
        .bind(Vector::from(vector.to_vec()))
        .bind(i64::try_from(k).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(index_error)?;

        rows.iter()
            .map(|row| {
                let id: Uuid = row.try_get("memory_id").map_err(index_error)?;
                // NULL when either side is a zero vector
                let score: Option<f64> = row.try_get("score").map_err(index_error)?;
                Ok(ScoredId {
                    id,
                    score: score.unwrap_or(0.0) as f32,
                })
            })
            .collect()
    }

    async fn ids_for_patient(&self, patient_id: &str) -> Result<Vec<Uuid>> {
        let rows = sqlx::query("SELECT memory_id FROM memory_vectors WHERE patient_id = $1")
            .bind(patient_id)
            .fetch_all(&self.pool)
            .await
            .map_err(index_error)?;
        rows.iter()
            .map(|row| row.try_get("memory_id").map_err(index_error))
            .collect()
    }

    async fn list_patients(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT patient_id FROM memory_vectors ORDER BY patient_id")
            .fetch_all(&self.pool)
            .await
            .map_err(index_error)?;
        rows.iter()
            .map(|row| row.try_get("patient_id").map_err(index_error))
            .collect()
    }
}
