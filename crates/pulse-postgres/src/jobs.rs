//! Job ladder repository.
//!
//! Owns every status transition on `etl_jobs`. The PENDING|READY → RUNNING
//! compare-and-set is the linearization point for job locking; chaining and
//! the FINISHED guard run inside one transaction so a duplicated terminal
//! message can never chain twice.

use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Row};
use tracing::{info, warn};

use pulse_core::{Checkpoint, Job, JobStatus, StageStatus};

use crate::error::StoreError;
use crate::rows::PgJobRow;

const JOB_COLUMNS: &str = r#"
    id, tenant_id, integration_id, job_name, execution_order,
    schedule_interval_minutes, retry_interval_minutes,
    status, resume_status,
    last_run_started_at, last_run_finished_at, last_success_at, last_sync_date,
    retry_count, error_message, checkpoint, steps, active
"#;

pub struct JobRepository {
    pool: PgPool,
}

impl JobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, tenant_id: i64, job_id: i64) -> Result<Job, StoreError> {
        let row = sqlx::query_as::<_, PgJobRow>(&format!(
            r#"SELECT {JOB_COLUMNS} FROM etl_jobs WHERE id = $1 AND tenant_id = $2"#
        ))
        .bind(job_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;
        row.try_into().map_err(StoreError::Integrity)
    }

    pub async fn find_by_name(
        &self,
        tenant_id: i64,
        job_name: &str,
    ) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query_as::<_, PgJobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM etl_jobs
            WHERE tenant_id = $1 AND lower(job_name) = lower($2)
            "#
        ))
        .bind(tenant_id)
        .bind(job_name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.try_into().map_err(StoreError::Integrity))
            .transpose()
    }

    /// The job the orchestrator should start next: at most one PENDING, else
    /// at most one READY (first-ever run), lowest `execution_order` first.
    pub async fn find_startable(&self, tenant_id: i64) -> Result<Option<Job>, StoreError> {
        for status in [JobStatus::Pending, JobStatus::Ready] {
            let row = sqlx::query_as::<_, PgJobRow>(&format!(
                r#"
                SELECT {JOB_COLUMNS} FROM etl_jobs
                WHERE tenant_id = $1 AND active = TRUE AND status = $2
                ORDER BY execution_order ASC
                LIMIT 1
                "#
            ))
            .bind(tenant_id)
            .bind(status.as_str())
            .fetch_optional(&self.pool)
            .await?;
            if let Some(row) = row {
                return Ok(Some(row.try_into().map_err(StoreError::Integrity)?));
            }
        }
        Ok(None)
    }

    /// Atomic PENDING|READY → RUNNING lock with tenant guard. Returns false
    /// when another orchestrator instance won the race.
    pub async fn try_lock(
        &self,
        tenant_id: i64,
        job_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE etl_jobs
            SET status = 'RUNNING',
                last_run_started_at = $3,
                error_message = NULL
            WHERE id = $1
              AND tenant_id = $2
              AND status IN ('PENDING', 'READY')
            "#,
        )
        .bind(job_id)
        .bind(tenant_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Terminal embed message arrived: finish the job and promote the next
    /// rung, all in one transaction. Returns the promoted job's name, `None`
    /// when the run was already chained (duplicate terminal) or the ladder
    /// has no other rung.
    pub async fn finish_and_chain(
        &self,
        tenant_id: i64,
        job_id: i64,
        now: DateTime<Utc>,
        sync_date: Option<DateTime<Utc>>,
    ) -> Result<Option<String>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query(
            r#"SELECT execution_order FROM etl_jobs WHERE id = $1 AND tenant_id = $2"#,
        )
        .bind(job_id)
        .bind(tenant_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;
        let current_order: i32 = current.get("execution_order");

        // Guarded by RUNNING so a duplicated terminal message is a no-op.
        let finished = sqlx::query(
            r#"
            UPDATE etl_jobs
            SET status = 'FINISHED',
                last_run_finished_at = $3,
                last_success_at = $3,
                last_sync_date = COALESCE($4, last_sync_date),
                error_message = NULL,
                retry_count = 0,
                checkpoint = NULL
            WHERE id = $1 AND tenant_id = $2 AND status = 'RUNNING'
            "#,
        )
        .bind(job_id)
        .bind(tenant_id)
        .bind(now)
        .bind(sync_date)
        .execute(&mut *tx)
        .await?;

        if finished.rows_affected() == 0 {
            warn!(job_id, tenant_id, "Job already chained; ignoring duplicate terminal");
            tx.rollback().await?;
            return Ok(None);
        }

        let next = Self::next_in_ladder(&mut tx, tenant_id, current_order, job_id).await?;
        let promoted = match next {
            Some((next_id, next_name)) => {
                sqlx::query(
                    r#"
                    UPDATE etl_jobs
                    SET status = 'PENDING', error_message = NULL
                    WHERE id = $1 AND tenant_id = $2
                    "#,
                )
                .bind(next_id)
                .bind(tenant_id)
                .execute(&mut *tx)
                .await?;
                Some(next_name)
            }
            None => None,
        };

        tx.commit().await?;
        info!(job_id, tenant_id, next = ?promoted, "Job finished and chained");
        Ok(promoted)
    }

    /// Rate-limit path: the run "completed" early, so the job goes back to
    /// PENDING keeping its checkpoint, and the ladder does not advance.
    pub async fn requeue_after_rate_limit(
        &self,
        tenant_id: i64,
        job_id: i64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE etl_jobs
            SET status = 'PENDING',
                last_run_finished_at = $3
            WHERE id = $1 AND tenant_id = $2 AND status = 'RUNNING'
            "#,
        )
        .bind(job_id)
        .bind(tenant_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            warn!(job_id, tenant_id, "Rate-limit requeue found no RUNNING job");
        }
        Ok(())
    }

    /// Fatal error: back to PENDING with the error and checkpoint recorded.
    pub async fn fail(
        &self,
        tenant_id: i64,
        job_id: i64,
        error_message: &str,
        checkpoint: Option<&Checkpoint>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let checkpoint_json = checkpoint.map(serde_json::to_value).transpose()?;
        let truncated: String = error_message.chars().take(500).collect();
        sqlx::query(
            r#"
            UPDATE etl_jobs
            SET status = 'PENDING',
                retry_count = retry_count + 1,
                error_message = $3,
                checkpoint = COALESCE($4, checkpoint),
                last_run_finished_at = $5
            WHERE id = $1 AND tenant_id = $2
            "#,
        )
        .bind(job_id)
        .bind(tenant_id)
        .bind(truncated)
        .bind(checkpoint_json)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Integration inactive or missing: mark FINISHED with the reason, do not
    /// touch `last_success_at`, and promote the next rung.
    pub async fn skip_with_error(
        &self,
        tenant_id: i64,
        job_id: i64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query(
            r#"SELECT execution_order FROM etl_jobs WHERE id = $1 AND tenant_id = $2"#,
        )
        .bind(job_id)
        .bind(tenant_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;
        let current_order: i32 = current.get("execution_order");

        sqlx::query(
            r#"
            UPDATE etl_jobs
            SET status = 'FINISHED',
                error_message = $3,
                last_run_finished_at = $4
            WHERE id = $1 AND tenant_id = $2
            "#,
        )
        .bind(job_id)
        .bind(tenant_id)
        .bind(reason)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let next = Self::next_in_ladder(&mut tx, tenant_id, current_order, job_id).await?;
        let promoted = match next {
            Some((next_id, next_name)) => {
                sqlx::query(
                    r#"
                    UPDATE etl_jobs
                    SET status = 'PENDING', error_message = NULL
                    WHERE id = $1 AND tenant_id = $2
                    "#,
                )
                .bind(next_id)
                .bind(tenant_id)
                .execute(&mut *tx)
                .await?;
                Some(next_name)
            }
            None => None,
        };

        tx.commit().await?;
        Ok(promoted)
    }

    /// Pause only flips the status; a currently running pipeline drains on
    /// its own. Resume restores the pre-pause status.
    pub async fn pause(&self, tenant_id: i64, job_id: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE etl_jobs
            SET resume_status = status,
                status = 'PAUSED'
            WHERE id = $1 AND tenant_id = $2 AND status <> 'PAUSED'
            "#,
        )
        .bind(job_id)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!("job {job_id} already paused")));
        }
        Ok(())
    }

    /// A job paused mid-run resumes as PENDING so the next tick re-enters
    /// from its checkpoint; otherwise the pre-pause status is restored.
    pub async fn resume(&self, tenant_id: i64, job_id: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE etl_jobs
            SET status = CASE
                    WHEN resume_status = 'RUNNING' THEN 'PENDING'
                    ELSE COALESCE(resume_status, 'READY')
                END,
                resume_status = NULL
            WHERE id = $1 AND tenant_id = $2 AND status = 'PAUSED'
            "#,
        )
        .bind(job_id)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!("job {job_id} is not paused")));
        }
        Ok(())
    }

    /// Manual trigger: set the job to PENDING regardless of interval.
    pub async fn trigger(&self, tenant_id: i64, job_id: i64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE etl_jobs
            SET status = 'PENDING',
                error_message = NULL,
                retry_count = 0
            WHERE id = $1 AND tenant_id = $2 AND status NOT IN ('RUNNING', 'PAUSED')
            "#,
        )
        .bind(job_id)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The full ladder, execution order ascending, with per-step stage
    /// statuses.
    pub async fn ladder(&self, tenant_id: i64) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query_as::<_, PgJobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM etl_jobs
            WHERE tenant_id = $1
            ORDER BY execution_order ASC
            "#
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| r.try_into().map_err(StoreError::Integrity))
            .collect()
    }

    pub async fn save_checkpoint(
        &self,
        tenant_id: i64,
        job_id: i64,
        checkpoint: &Checkpoint,
    ) -> Result<(), StoreError> {
        let body = serde_json::to_value(checkpoint)?;
        sqlx::query(
            r#"UPDATE etl_jobs SET checkpoint = $3 WHERE id = $1 AND tenant_id = $2"#,
        )
        .bind(job_id)
        .bind(tenant_id)
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Update one stage of one step inside the `steps` JSON column.
    pub async fn set_step_stage(
        &self,
        tenant_id: i64,
        job_id: i64,
        step: &str,
        stage: &str,
        status: StageStatus,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE etl_jobs
            SET steps = (
                SELECT jsonb_agg(
                    CASE WHEN elem->>'name' = $3
                         THEN jsonb_set(elem, ARRAY[$4], to_jsonb($5::text))
                         ELSE elem
                    END
                )
                FROM jsonb_array_elements(steps) AS elem
            )
            WHERE id = $1 AND tenant_id = $2
            "#,
        )
        .bind(job_id)
        .bind(tenant_id)
        .bind(step)
        .bind(stage)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Cheap status probe, used by the worker loops to park messages of a
    /// paused job.
    pub async fn status(
        &self,
        tenant_id: i64,
        job_id: i64,
    ) -> Result<Option<JobStatus>, StoreError> {
        let row = sqlx::query(
            r#"SELECT status FROM etl_jobs WHERE id = $1 AND tenant_id = $2"#,
        )
        .bind(job_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| JobStatus::try_from(r.get::<String, _>("status")).map_err(StoreError::Integrity))
            .transpose()
    }

    /// Most recent run start across the tenant's jobs; drives the per-tenant
    /// orchestrator interval gate.
    pub async fn latest_run_started_at(
        &self,
        tenant_id: i64,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT max(last_run_started_at) AS latest
            FROM etl_jobs
            WHERE tenant_id = $1 AND last_run_started_at IS NOT NULL
            "#,
        )
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("latest"))
    }

    /// Whether the job has spent its fast-retry budget; the scheduler then
    /// falls back to the normal interval.
    pub fn retry_window(job: &Job, max_retry_attempts: i32) -> Duration {
        if job.retry_count > 0 && job.retry_count <= max_retry_attempts {
            Duration::minutes(job.retry_interval_minutes)
        } else {
            Duration::minutes(job.schedule_interval_minutes)
        }
    }

    async fn next_in_ladder(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        tenant_id: i64,
        current_order: i32,
        current_id: i64,
    ) -> Result<Option<(i64, String)>, StoreError> {
        // Next rung strictly after the current one, skipping paused jobs.
        let next = sqlx::query(
            r#"
            SELECT id, job_name FROM etl_jobs
            WHERE tenant_id = $1
              AND active = TRUE
              AND status <> 'PAUSED'
              AND execution_order > $2
            ORDER BY execution_order ASC
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .bind(current_order)
        .fetch_optional(&mut **tx)
        .await?;

        if let Some(row) = next {
            return Ok(Some((row.get("id"), row.get("job_name"))));
        }

        // Wrap to the lowest-ordered rung that is not the current job.
        let wrapped = sqlx::query(
            r#"
            SELECT id, job_name FROM etl_jobs
            WHERE tenant_id = $1
              AND active = TRUE
              AND status <> 'PAUSED'
              AND id <> $2
            ORDER BY execution_order ASC
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .bind(current_id)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(wrapped.map(|row| (row.get("id"), row.get("job_name"))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::Job;

    fn job(retry_count: i32) -> Job {
        Job {
            id: 1,
            tenant_id: 1,
            integration_id: None,
            job_name: "issues".into(),
            execution_order: 1,
            schedule_interval_minutes: 60,
            retry_interval_minutes: 5,
            status: pulse_core::JobStatus::Pending,
            resume_status: None,
            last_run_started_at: None,
            last_run_finished_at: None,
            last_success_at: None,
            last_sync_date: None,
            retry_count,
            error_message: None,
            checkpoint: None,
            steps: vec![],
            active: true,
        }
    }

    #[test]
    fn retry_window_accelerates_then_caps() {
        assert_eq!(JobRepository::retry_window(&job(0), 5), Duration::minutes(60));
        assert_eq!(JobRepository::retry_window(&job(1), 5), Duration::minutes(5));
        assert_eq!(JobRepository::retry_window(&job(5), 5), Duration::minutes(5));
        // Past the cap the scheduler stops fast-retrying.
        assert_eq!(JobRepository::retry_window(&job(6), 5), Duration::minutes(60));
    }
}
