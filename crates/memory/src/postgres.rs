//! PostgreSQL-backed memory repository.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use homecare_common::{
    CategoryCount, DeleteOutcome, HomecareError, Memory, MemoryCategory, MemoryRepository,
    Metadata, Result,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS memories (
        id UUID PRIMARY KEY,
        patient_id TEXT NOT NULL CHECK (length(btrim(patient_id)) > 0),
        category TEXT NOT NULL,
        priority TEXT NOT NULL,
        content TEXT NOT NULL CHECK (char_length(content) BETWEEN 1 AND 2000),
        metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
        committed BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        deleted_at TIMESTAMPTZ
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_memories_active_category
        ON memories (patient_id, category)
        WHERE deleted_at IS NULL AND committed"#,
    r#"CREATE INDEX IF NOT EXISTS idx_memories_pending
        ON memories (created_at)
        WHERE NOT committed"#,
];

const COLUMNS: &str =
    "id, patient_id, category, priority, content, metadata, created_at, updated_at, deleted_at";

/// Connection pool shared by the repository and the pgvector index.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(300))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
        .map_err(|e| HomecareError::Storage(format!("Failed to connect to database: {e}")))
}

fn storage(e: sqlx::Error) -> HomecareError {
    HomecareError::Storage(e.to_string())
}

fn row_to_memory(row: &PgRow) -> Result<Memory> {
    let category: String = row.try_get("category").map_err(storage)?;
    let priority: String = row.try_get("priority").map_err(storage)?;
    let metadata: serde_json::Value = row.try_get("metadata").map_err(storage)?;

    Ok(Memory {
        id: row.try_get("id").map_err(storage)?,
        patient_id: row.try_get("patient_id").map_err(storage)?,
        category: category
            .parse()
            .map_err(|_| HomecareError::Storage(format!("Unknown stored category '{category}'")))?,
        priority: priority
            .parse()
            .map_err(|_| HomecareError::Storage(format!("Unknown stored priority '{priority}'")))?,
        content: row.try_get("content").map_err(storage)?,
        metadata: match metadata {
            serde_json::Value::Object(map) => map,
            _ => Metadata::new(),
        },
        created_at: row.try_get("created_at").map_err(storage)?,
        updated_at: row.try_get("updated_at").map_err(storage)?,
        deleted_at: row.try_get("deleted_at").map_err(storage)?,
    })
}

pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(storage)?;
        }
        info!("Memory schema ready");
        Ok(())
    }

    async fn fetch_memories(&self, query: SqlQuery<'_>) -> Result<Vec<Memory>> {
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        rows.iter().map(row_to_memory).collect()
    }
}

type SqlQuery<'q> = sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>;

#[async_trait]
impl MemoryRepository for PostgresRepository {
    async fn insert_pending(&self, memory: &Memory) -> Result<()> {
        sqlx::query(
            "INSERT INTO memories (id, patient_id, category, priority, content, metadata, committed, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, FALSE, $7, $8)",
        )
        .bind(memory.id)
        .bind(&memory.patient_id)
        .bind(memory.category.as_str())
        .bind(memory.priority.as_str())
        .bind(&memory.content)
        .bind(serde_json::Value::Object(memory.metadata.clone()))
        .bind(memory.created_at)
        .bind(memory.updated_at)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn commit(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("UPDATE memories SET committed = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        if result.rows_affected() == 0 {
            return Err(HomecareError::Storage(format!("No pending row {id} to commit")));
        }
        Ok(())
    }

    async fn discard_pending(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM memories WHERE id = $1 AND NOT committed")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Memory>> {
        let sql = format!("SELECT {COLUMNS} FROM memories WHERE id = $1 AND committed");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        row.as_ref().map(row_to_memory).transpose()
    }

    async fn get_active_many(&self, patient_id: &str, ids: &[Uuid]) -> Result<Vec<Memory>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {COLUMNS} FROM memories \
             WHERE id = ANY($1) AND patient_id = $2 AND committed AND deleted_at IS NULL"
        );
        self.fetch_memories(sqlx::query(&sql).bind(ids).bind(patient_id))
            .await
    }

    async fn list_active(&self, patient_id: &str, category: MemoryCategory) -> Result<Vec<Memory>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM memories \
             WHERE patient_id = $1 AND category = $2 AND committed AND deleted_at IS NULL \
             ORDER BY created_at ASC, id ASC"
        );
        self.fetch_memories(sqlx::query(&sql).bind(patient_id).bind(category.as_str()))
            .await
    }

    async fn list_active_ids(&self, patient_id: &str) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            "SELECT id FROM memories WHERE patient_id = $1 AND committed AND deleted_at IS NULL",
        )
        .bind(patient_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.iter()
            .map(|r| r.try_get("id").map_err(storage))
            .collect()
    }

    async fn update(&self, memory: &Memory) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE memories SET content = $1, category = $2, priority = $3, metadata = $4, updated_at = $5 \
             WHERE id = $6 AND committed AND deleted_at IS NULL",
        )
        .bind(&memory.content)
        .bind(memory.category.as_str())
        .bind(memory.priority.as_str())
        .bind(serde_json::Value::Object(memory.metadata.clone()))
        .bind(memory.updated_at)
        .bind(memory.id)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(result.rows_affected() == 1)
    }

    async fn soft_delete(&self, id: Uuid, at: DateTime<Utc>) -> Result<DeleteOutcome> {
        let row = sqlx::query(
            "UPDATE memories SET deleted_at = COALESCE(deleted_at, $1), \
             updated_at = CASE WHEN deleted_at IS NULL THEN $1 ELSE updated_at END \
             WHERE id = $2 AND committed \
             RETURNING (deleted_at = $1) AS newly_deleted",
        )
        .bind(at)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        match row {
            None => Ok(DeleteOutcome::NotFound),
            Some(row) => {
                let newly: bool = row.try_get("newly_deleted").map_err(storage)?;
                Ok(if newly {
                    DeleteOutcome::Deleted
                } else {
                    DeleteOutcome::AlreadyDeleted
                })
            }
        }
    }

    async fn count_active(&self, patient_id: &str) -> Result<Vec<CategoryCount>> {
        let rows = sqlx::query(
            "SELECT category, priority, COUNT(*) AS count FROM memories \
             WHERE patient_id = $1 AND committed AND deleted_at IS NULL \
             GROUP BY category, priority",
        )
        .bind(patient_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.iter()
            .map(|row| {
                let category: String = row.try_get("category").map_err(storage)?;
                let priority: String = row.try_get("priority").map_err(storage)?;
                let count: i64 = row.try_get("count").map_err(storage)?;
                Ok(CategoryCount {
                    category: category.parse().map_err(|_| {
                        HomecareError::Storage(format!("Unknown stored category '{category}'"))
                    })?,
                    priority: priority.parse().map_err(|_| {
                        HomecareError::Storage(format!("Unknown stored priority '{priority}'"))
                    })?,
                    count: count.max(0) as u64,
                })
            })
            .collect()
    }

    async fn recent(
        &self,
        patient_id: &str,
        category: MemoryCategory,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Memory>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM memories \
             WHERE patient_id = $1 AND category = $2 AND created_at >= $3 \
               AND committed AND deleted_at IS NULL \
             ORDER BY created_at DESC, id ASC \
             LIMIT $4"
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.fetch_memories(
            sqlx::query(&sql)
                .bind(patient_id)
                .bind(category.as_str())
                .bind(since)
                .bind(limit),
        )
        .await
    }

    async fn list_pending(&self, older_than: DateTime<Utc>) -> Result<Vec<Memory>> {
        let sql = format!("SELECT {COLUMNS} FROM memories WHERE NOT committed AND created_at < $1");
        self.fetch_memories(sqlx::query(&sql).bind(older_than))
            .await
    }

    async fn list_patients(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT patient_id FROM memories \
             WHERE committed AND deleted_at IS NULL ORDER BY patient_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.iter()
            .map(|r| r.try_get("patient_id").map_err(storage))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use homecare_common::Priority;

    async fn repository() -> PostgresRepository {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = connect(&url, 2).await.unwrap();
        let repository = PostgresRepository::new(pool);
        repository.ensure_schema().await.unwrap();
        repository
    }

    #[tokio::test]
    #[ignore = "Requires a PostgreSQL database at DATABASE_URL"]
    async fn test_pending_commit_and_soft_delete() {
        let repo = repository().await;
        let patient = format!("pg-test-{}", Uuid::new_v4());
        let memory = Memory::new(&patient, MemoryCategory::Allergy, Priority::Critical, "Allergic to latex");

        repo.insert_pending(&memory).await.unwrap();
        assert!(repo.get(memory.id).await.unwrap().is_none());

        repo.commit(memory.id).await.unwrap();
        let stored = repo.get(memory.id).await.unwrap().unwrap();
        assert_eq!(stored.content, "Allergic to latex");
        assert_eq!(stored.priority, Priority::Critical);

        let counts = repo.count_active(&patient).await.unwrap();
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[0].count, 1);

        let now = Utc::now();
        assert_eq!(repo.soft_delete(memory.id, now).await.unwrap(), DeleteOutcome::Deleted);
        assert_eq!(
            repo.soft_delete(memory.id, Utc::now()).await.unwrap(),
            DeleteOutcome::AlreadyDeleted
        );
        assert!(repo.list_active_ids(&patient).await.unwrap().is_empty());
    }
}
