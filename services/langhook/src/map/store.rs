//! Persistence for ingest mappings (fingerprint → transform expression).

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;

/// One cached transform, keyed by payload fingerprint.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct IngestMapping {
    pub fingerprint: String,
    pub publisher: String,
    /// Human-readable `"<type> <action>"` label.
    pub event_name: String,
    pub mapping_expr: String,
    pub event_field_expr: Option<String>,
    /// Type skeleton the fingerprint was derived from, for diagnostics.
    pub structure: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct MappingStore {
    pool: PgPool,
}

impl MappingStore {
    pub fn new(pool: PgPool) -> Self {
        MappingStore { pool }
    }

    pub async fn get(&self, fingerprint: &str) -> Result<Option<IngestMapping>, sqlx::Error> {
        sqlx::query_as::<_, IngestMapping>(
            "SELECT fingerprint, publisher, event_name, mapping_expr, event_field_expr,
                    structure, created_at, updated_at
             FROM ingest_mappings WHERE fingerprint = $1",
        )
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn list(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<IngestMapping>, i64), sqlx::Error> {
        let rows = sqlx::query_as::<_, IngestMapping>(
            "SELECT fingerprint, publisher, event_name, mapping_expr, event_field_expr,
                    structure, created_at, updated_at
             FROM ingest_mappings ORDER BY created_at DESC LIMIT $1 OFFSET $2",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ingest_mappings")
            .fetch_one(&self.pool)
            .await?;
        Ok((rows, total))
    }

    /// Drop a cached mapping so the next matching payload re-synthesises.
    pub async fn delete(&self, fingerprint: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM ingest_mappings WHERE fingerprint = $1")
            .bind(fingerprint)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Store a mapping. Rows are never mutated in place: a refresh for the
    /// same fingerprint is delete-then-insert, made race-safe by the primary
    /// key.
    pub async fn put(
        &self,
        fingerprint: &str,
        publisher: &str,
        event_name: &str,
        mapping_expr: &str,
        structure: &serde_json::Value,
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM ingest_mappings WHERE fingerprint = $1")
            .bind(fingerprint)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO ingest_mappings (fingerprint, publisher, event_name, mapping_expr, structure)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (fingerprint) DO NOTHING",
        )
        .bind(fingerprint)
        .bind(publisher)
        .bind(event_name)
        .bind(mapping_expr)
        .bind(structure)
        .execute(&mut *tx)
        .await?;
        tx.commit().await
    }
}
