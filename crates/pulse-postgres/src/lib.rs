//! Postgres store gateway.
//!
//! Each adapter is a newtype wrapping PgPool. All SQL is runtime-checked
//! (sqlx::query, not sqlx::query!) because the tables are created by
//! migrations that may not exist at compile time. Every query is
//! tenant-scoped.

pub mod entities;
pub mod error;
pub mod jobs;
pub mod raw;
pub mod rows;
pub mod settings;
pub mod tenants;
pub mod vectors;

pub use entities::{EntityRepository, SourceRow};
pub use error::StoreError;
pub use jobs::JobRepository;
pub use raw::RawDataRepository;
pub use settings::{SettingsRepository, TenantSettings};
pub use tenants::TenantRepository;
pub use vectors::VectorRefRepository;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Open the shared connection pool.
pub async fn connect(database_url: &str) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(16)
        .connect(database_url)
        .await?;
    Ok(pool)
}
