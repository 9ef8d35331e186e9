//! sqlx row types and their conversions into domain types.
//!
//! Status/enum columns come back as text and are parsed through the domain
//! `TryFrom<String>` impls; JSON columns are decoded with serde.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use pulse_core::{Checkpoint, Integration, IntegrationSettings, Job, JobStatus, JobStep, ProviderKind, Tenant, TenantTier};

#[derive(Debug, Clone, FromRow)]
pub struct PgJobRow {
    pub id: i64,
    pub tenant_id: i64,
    pub integration_id: Option<i64>,
    pub job_name: String,
    pub execution_order: i32,
    pub schedule_interval_minutes: i64,
    pub retry_interval_minutes: i64,
    pub status: String,
    pub resume_status: Option<String>,
    pub last_run_started_at: Option<DateTime<Utc>>,
    pub last_run_finished_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_sync_date: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub checkpoint: Option<serde_json::Value>,
    pub steps: serde_json::Value,
    pub active: bool,
}

impl TryFrom<PgJobRow> for Job {
    type Error = String;

    fn try_from(row: PgJobRow) -> Result<Self, Self::Error> {
        let status = JobStatus::try_from(row.status)?;
        let resume_status = row.resume_status.map(JobStatus::try_from).transpose()?;
        let checkpoint: Option<Checkpoint> = row
            .checkpoint
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| format!("Bad checkpoint JSON: {}", e))?;
        let steps: Vec<JobStep> = serde_json::from_value(row.steps)
            .map_err(|e| format!("Bad steps JSON: {}", e))?;
        Ok(Job {
            id: row.id,
            tenant_id: row.tenant_id,
            integration_id: row.integration_id,
            job_name: row.job_name,
            execution_order: row.execution_order,
            schedule_interval_minutes: row.schedule_interval_minutes,
            retry_interval_minutes: row.retry_interval_minutes,
            status,
            resume_status,
            last_run_started_at: row.last_run_started_at,
            last_run_finished_at: row.last_run_finished_at,
            last_success_at: row.last_success_at,
            last_sync_date: row.last_sync_date,
            retry_count: row.retry_count,
            error_message: row.error_message,
            checkpoint,
            steps,
            active: row.active,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct PgTenantRow {
    pub id: i64,
    pub name: String,
    pub tier: String,
    pub active: bool,
}

impl TryFrom<PgTenantRow> for Tenant {
    type Error = String;

    fn try_from(row: PgTenantRow) -> Result<Self, Self::Error> {
        Ok(Tenant {
            id: row.id,
            name: row.name,
            tier: TenantTier::try_from(row.tier)?,
            active: row.active,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct PgIntegrationRow {
    pub id: i64,
    pub tenant_id: i64,
    pub provider: String,
    pub base_url: String,
    pub credentials: Option<String>,
    pub settings: Option<serde_json::Value>,
    pub active: bool,
}

impl TryFrom<PgIntegrationRow> for Integration {
    type Error = String;

    fn try_from(row: PgIntegrationRow) -> Result<Self, Self::Error> {
        let settings: IntegrationSettings = match row.settings {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| format!("Bad integration settings JSON: {}", e))?,
            None => IntegrationSettings::default(),
        };
        Ok(Integration {
            id: row.id,
            tenant_id: row.tenant_id,
            provider: ProviderKind::try_from(row.provider)?,
            base_url: row.base_url,
            credentials: row.credentials,
            settings,
            active: row.active,
        })
    }
}
