//! Per-tenant settings.

use sqlx::{PgPool, Row};

use crate::error::StoreError;

/// Orchestrator knobs a tenant can override.
#[derive(Debug, Clone)]
pub struct TenantSettings {
    pub orchestrator_enabled: bool,
    pub orchestrator_interval_minutes: i64,
    pub max_retry_attempts: i32,
}

impl TenantSettings {
    pub fn defaults(interval_minutes: i64, max_retry_attempts: i32) -> Self {
        Self {
            orchestrator_enabled: true,
            orchestrator_interval_minutes: interval_minutes,
            max_retry_attempts,
        }
    }
}

pub struct SettingsRepository {
    pool: PgPool,
}

impl SettingsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Tenant settings, falling back to the process defaults when the tenant
    /// has no row.
    pub async fn for_tenant(
        &self,
        tenant_id: i64,
        defaults: &TenantSettings,
    ) -> Result<TenantSettings, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT orchestrator_enabled, orchestrator_interval_minutes, max_retry_attempts
            FROM tenant_settings
            WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(row) => TenantSettings {
                orchestrator_enabled: row.get("orchestrator_enabled"),
                orchestrator_interval_minutes: row.get("orchestrator_interval_minutes"),
                max_retry_attempts: row.get("max_retry_attempts"),
            },
            None => defaults.clone(),
        })
    }
}
