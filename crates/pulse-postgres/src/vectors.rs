//! Vector references.
//!
//! One row per `(tenant, source table, source row)` pointing at a point in
//! the configured vector collection. Upsert-keyed so re-embedding overwrites
//! rather than duplicates.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::StoreError;

pub struct VectorRefRepository {
    pool: PgPool,
}

impl VectorRefRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn upsert(
        &self,
        tenant_id: i64,
        source_table: &str,
        source_row_id: &str,
        collection: &str,
        point_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO vector_refs
                (tenant_id, source_table, source_row_id, collection, point_id,
                 active, created_at, last_updated_at)
            VALUES ($1, $2, $3, $4, $5, TRUE, $6, $6)
            ON CONFLICT (tenant_id, source_table, source_row_id)
            DO UPDATE SET collection = EXCLUDED.collection,
                          point_id = EXCLUDED.point_id,
                          active = TRUE,
                          last_updated_at = EXCLUDED.last_updated_at
            "#,
        )
        .bind(tenant_id)
        .bind(source_table)
        .bind(source_row_id)
        .bind(collection)
        .bind(point_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn count_active(&self, tenant_id: i64, source_table: &str) -> Result<i64, StoreError> {
        let row: (i64,) = sqlx::query_as(
            r#"
            SELECT count(*) FROM vector_refs
            WHERE tenant_id = $1 AND source_table = $2 AND active = TRUE
            "#,
        )
        .bind(tenant_id)
        .bind(source_table)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }
}
