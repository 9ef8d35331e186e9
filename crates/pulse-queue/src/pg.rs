//! Postgres-backed broker.
//!
//! One `queue_messages` table holds every queue; the pop is an atomic CTE
//! with `FOR UPDATE SKIP LOCKED` that stamps a lease expiry, so concurrent
//! consumers never double-deliver a live lease and crashed consumers are
//! reclaimed when the lease lapses.
//!
//! NOTE: All queries use runtime-checked sqlx::query() instead of
//! compile-time sqlx::query!() macros because the tables are created by
//! migrations that may not exist at compile time.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::{error, warn};

use pulse_core::Envelope;

use crate::{Broker, BrokerError, Delivery, QueueName, LEASE_SECONDS, MAX_DELIVERIES};

pub struct PgBroker {
    pool: PgPool,
    lease_seconds: i64,
}

impl PgBroker {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lease_seconds: LEASE_SECONDS,
        }
    }

    pub fn with_lease_seconds(mut self, lease_seconds: i64) -> Self {
        self.lease_seconds = lease_seconds;
        self
    }

    async fn move_to_dlq(
        &self,
        queue: &QueueName,
        delivery: &Delivery,
        reason: &str,
    ) -> Result<(), BrokerError> {
        let envelope = serde_json::to_value(&delivery.envelope)?;
        sqlx::query(
            r#"
            INSERT INTO queue_messages_dlq
                (original_id, queue_name, tenant_id, envelope, retry_count, failure_reason)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(delivery.delivery_id)
        .bind(queue.as_str())
        .bind(delivery.envelope.tenant_id)
        .bind(&envelope)
        .bind(delivery.attempt)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        sqlx::query(r#"DELETE FROM queue_messages WHERE id = $1"#)
            .bind(delivery.delivery_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Broker for PgBroker {
    async fn publish(&self, queue: &QueueName, envelope: &Envelope) -> Result<(), BrokerError> {
        let body = serde_json::to_value(envelope)?;
        sqlx::query(
            r#"
            INSERT INTO queue_messages (queue_name, tenant_id, envelope, retry_count, queued_at)
            VALUES ($1, $2, $3, 0, now())
            "#,
        )
        .bind(queue.as_str())
        .bind(envelope.tenant_id)
        .bind(&body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn poll(&self, queue: &QueueName) -> Result<Option<Delivery>, BrokerError> {
        // Atomic pop with CTE form (planner-independent); expired leases are
        // visible again and reclaimed here.
        let row = sqlx::query(
            r#"
            WITH next AS (
                SELECT id
                FROM queue_messages
                WHERE queue_name = $1
                  AND (leased_until IS NULL OR leased_until < now())
                ORDER BY id
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            UPDATE queue_messages q
            SET leased_until = now() + ($2 * interval '1 second'),
                retry_count = q.retry_count + 1
            FROM next
            WHERE q.id = next.id
            RETURNING q.id, q.envelope, q.retry_count
            "#,
        )
        .bind(queue.as_str())
        .bind(self.lease_seconds)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let delivery_id: i64 = row.get("id");
        let body: serde_json::Value = row.get("envelope");
        let attempt: i32 = row.get("retry_count");
        let envelope: Envelope = serde_json::from_value(body)?;

        Ok(Some(Delivery {
            delivery_id,
            envelope,
            attempt,
        }))
    }

    async fn ack(&self, _queue: &QueueName, delivery: &Delivery) -> Result<(), BrokerError> {
        let result = sqlx::query(r#"DELETE FROM queue_messages WHERE id = $1"#)
            .bind(delivery.delivery_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            // Lease expired and another consumer finished it; already gone.
            warn!(delivery_id = delivery.delivery_id, "Acked a reclaimed delivery");
        }
        Ok(())
    }

    async fn nack(
        &self,
        queue: &QueueName,
        delivery: &Delivery,
        reason: &str,
    ) -> Result<(), BrokerError> {
        if delivery.attempt >= MAX_DELIVERIES {
            error!(
                delivery_id = delivery.delivery_id,
                queue = %queue,
                attempt = delivery.attempt,
                reason,
                "Moving message to DLQ"
            );
            return self.move_to_dlq(queue, delivery, reason).await;
        }

        sqlx::query(
            r#"
            UPDATE queue_messages
            SET leased_until = NULL,
                last_error = $2
            WHERE id = $1
            "#,
        )
        .bind(delivery.delivery_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
