//! Tenant and integration reads.

use sqlx::PgPool;

use pulse_core::{Integration, ProviderKind, Tenant};

use crate::error::StoreError;
use crate::rows::{PgIntegrationRow, PgTenantRow};

pub struct TenantRepository {
    pool: PgPool,
}

impl TenantRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn list_active(&self) -> Result<Vec<Tenant>, StoreError> {
        let rows = sqlx::query_as::<_, PgTenantRow>(
            r#"SELECT id, name, tier, active FROM tenants WHERE active = TRUE ORDER BY id"#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| r.try_into().map_err(StoreError::Integrity))
            .collect()
    }

    pub async fn get(&self, tenant_id: i64) -> Result<Tenant, StoreError> {
        let row = sqlx::query_as::<_, PgTenantRow>(
            r#"SELECT id, name, tier, active FROM tenants WHERE id = $1"#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("tenant {tenant_id}")))?;
        row.try_into().map_err(StoreError::Integrity)
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Option<Tenant>, StoreError> {
        let row = sqlx::query_as::<_, PgTenantRow>(
            r#"SELECT id, name, tier, active FROM tenants WHERE lower(name) = lower($1)"#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.try_into().map_err(StoreError::Integrity))
            .transpose()
    }

    pub async fn integration(
        &self,
        tenant_id: i64,
        integration_id: i64,
    ) -> Result<Option<Integration>, StoreError> {
        let row = sqlx::query_as::<_, PgIntegrationRow>(
            r#"
            SELECT id, tenant_id, provider, base_url, credentials, settings, active
            FROM integrations
            WHERE id = $1 AND tenant_id = $2
            "#,
        )
        .bind(integration_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.try_into().map_err(StoreError::Integrity))
            .transpose()
    }

    pub async fn integration_by_provider(
        &self,
        tenant_id: i64,
        provider: ProviderKind,
    ) -> Result<Option<Integration>, StoreError> {
        let row = sqlx::query_as::<_, PgIntegrationRow>(
            r#"
            SELECT id, tenant_id, provider, base_url, credentials, settings, active
            FROM integrations
            WHERE tenant_id = $1 AND provider = $2 AND active = TRUE
            ORDER BY id
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .bind(provider.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.try_into().map_err(StoreError::Integrity))
            .transpose()
    }
}
