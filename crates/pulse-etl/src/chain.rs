//! Job chaining capability.
//!
//! The embed stage must not depend on the orchestrator module; it depends on
//! this narrow sink instead. Completing a job either chains the ladder
//! forward (normal terminal) or returns the job to PENDING with its
//! checkpoint kept (rate-limited terminal).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use pulse_core::{Clock, EtlResult};
use pulse_postgres::JobRepository;

use crate::progress::ProgressBroadcaster;

#[async_trait]
pub trait JobChainingSink: Send + Sync {
    /// `sync_date` is the run's frozen extraction end date; it becomes the
    /// job's incremental boundary on a successful (non-rate-limited) finish.
    async fn complete_job(
        &self,
        tenant_id: i64,
        job_id: i64,
        with_rate_limit: bool,
        sync_date: Option<DateTime<Utc>>,
    ) -> EtlResult<()>;
}

pub struct PgChainingSink {
    jobs: Arc<JobRepository>,
    clock: Arc<dyn Clock>,
    progress: ProgressBroadcaster,
}

impl PgChainingSink {
    pub fn new(
        jobs: Arc<JobRepository>,
        clock: Arc<dyn Clock>,
        progress: ProgressBroadcaster,
    ) -> Self {
        Self {
            jobs,
            clock,
            progress,
        }
    }
}

#[async_trait]
impl JobChainingSink for PgChainingSink {
    async fn complete_job(
        &self,
        tenant_id: i64,
        job_id: i64,
        with_rate_limit: bool,
        sync_date: Option<DateTime<Utc>>,
    ) -> EtlResult<()> {
        let now = self.clock.now();
        if with_rate_limit {
            self.jobs
                .requeue_after_rate_limit(tenant_id, job_id, now)
                .await?;
            info!(tenant_id, job_id, "Job requeued after rate limit; checkpoint kept");
            self.progress.job_status(tenant_id, job_id, "PENDING");
        } else {
            let next = self
                .jobs
                .finish_and_chain(tenant_id, job_id, now, sync_date)
                .await?;
            self.progress.job_status(tenant_id, job_id, "FINISHED");
            if let Some(next_name) = next {
                info!(tenant_id, job_id, next = %next_name, "Next job promoted to PENDING");
            }
        }
        Ok(())
    }
}
