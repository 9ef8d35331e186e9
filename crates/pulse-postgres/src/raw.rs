//! Raw-extraction records.
//!
//! Opaque payloads written by the extract stage and consumed exactly once by
//! the transform stage. Inserts are keyed by a payload fingerprint, so a
//! replayed extraction message lands on the existing record instead of
//! minting a duplicate; the `completed` status is the consumer-side guard.
//! The raw insert commits before the transform message is published.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use pulse_core::ids::fingerprint;
use pulse_core::RawKind;

use crate::error::StoreError;

/// Stable dedup key for one raw payload. serde_json serializes object keys
/// in sorted order, so equal payloads fingerprint equally.
fn payload_fingerprint(payload: &serde_json::Value) -> Result<String, StoreError> {
    Ok(fingerprint(&serde_json::to_vec(payload)?))
}

pub struct RawDataRepository {
    pool: PgPool,
}

/// A raw record as loaded by the transform stage.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub id: i64,
    pub kind: String,
    pub payload: serde_json::Value,
    pub external_id: Option<String>,
    pub status: String,
}

impl RawDataRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert one raw payload, returning its id. Replaying the same payload
    /// hits the `(tenant_id, fingerprint)` key and returns the existing
    /// record's id, so the producer side of a redelivered extraction message
    /// creates no duplicates.
    pub async fn insert(
        &self,
        tenant_id: i64,
        integration_id: i64,
        kind: RawKind,
        payload: &serde_json::Value,
        external_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let digest = payload_fingerprint(payload)?;
        let row = sqlx::query(
            r#"
            INSERT INTO raw_extraction_data
                (tenant_id, integration_id, type, raw_data, external_id, fingerprint,
                 status, active, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', TRUE, $7)
            ON CONFLICT (tenant_id, fingerprint)
            DO UPDATE SET last_updated_at = EXCLUDED.created_at
            RETURNING id
            "#,
        )
        .bind(tenant_id)
        .bind(integration_id)
        .bind(kind.as_str())
        .bind(payload)
        .bind(external_id)
        .bind(&digest)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("id"))
    }

    /// Bulk insert one batch page, single round trip, ids in input order.
    /// Same fingerprint dedup as `insert`: replayed payloads map onto their
    /// existing records.
    pub async fn insert_batch(
        &self,
        tenant_id: i64,
        integration_id: i64,
        kind: RawKind,
        payloads: &[serde_json::Value],
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>, StoreError> {
        if payloads.is_empty() {
            return Ok(Vec::new());
        }
        let digests = payloads
            .iter()
            .map(payload_fingerprint)
            .collect::<Result<Vec<String>, StoreError>>()?;
        let rows = sqlx::query(
            r#"
            INSERT INTO raw_extraction_data
                (tenant_id, integration_id, type, raw_data, fingerprint,
                 status, active, created_at)
            SELECT $1, $2, $3, t.payload, t.digest, 'pending', TRUE, $6
            FROM unnest($4::jsonb[], $5::text[]) AS t(payload, digest)
            ON CONFLICT (tenant_id, fingerprint)
            DO UPDATE SET last_updated_at = EXCLUDED.created_at
            RETURNING id
            "#,
        )
        .bind(tenant_id)
        .bind(integration_id)
        .bind(kind.as_str())
        .bind(payloads)
        .bind(&digests)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|row| row.get("id")).collect())
    }

    pub async fn load(&self, tenant_id: i64, raw_data_id: i64) -> Result<RawRecord, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, type, raw_data, external_id, status
            FROM raw_extraction_data
            WHERE id = $1 AND tenant_id = $2
            "#,
        )
        .bind(raw_data_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("raw record {raw_data_id}")))?;

        Ok(RawRecord {
            id: row.get("id"),
            kind: row.get("type"),
            payload: row.get("raw_data"),
            external_id: row.get("external_id"),
            status: row.get("status"),
        })
    }

    /// `mark_completed` within the transform message's transaction, so the
    /// upserts and the status flip commit together.
    pub async fn mark_completed_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        tenant_id: i64,
        raw_data_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE raw_extraction_data
            SET status = 'completed',
                last_updated_at = $3,
                error_details = NULL
            WHERE id = $1 AND tenant_id = $2 AND status <> 'completed'
            "#,
        )
        .bind(raw_data_id)
        .bind(tenant_id)
        .bind(now)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Transition to `completed`. Returns false when the record was already
    /// completed, which is how a redelivered transform message detects it has
    /// nothing to do.
    pub async fn mark_completed(
        &self,
        tenant_id: i64,
        raw_data_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE raw_extraction_data
            SET status = 'completed',
                last_updated_at = $3,
                error_details = NULL
            WHERE id = $1 AND tenant_id = $2 AND status <> 'completed'
            "#,
        )
        .bind(raw_data_id)
        .bind(tenant_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_failed(
        &self,
        tenant_id: i64,
        raw_data_id: i64,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE raw_extraction_data
            SET status = 'failed',
                last_updated_at = $3,
                error_details = $4
            WHERE id = $1 AND tenant_id = $2
            "#,
        )
        .bind(raw_data_id)
        .bind(tenant_id)
        .bind(now)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn equal_payloads_fingerprint_equally() {
        let a = payload_fingerprint(&json!({"id": "10042", "key": "CORE-7"})).unwrap();
        let b = payload_fingerprint(&json!({"key": "CORE-7", "id": "10042"})).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn distinct_payloads_fingerprint_differently() {
        let a = payload_fingerprint(&json!({"id": "10042"})).unwrap();
        let b = payload_fingerprint(&json!({"id": "10043"})).unwrap();
        assert_ne!(a, b);
    }
}
