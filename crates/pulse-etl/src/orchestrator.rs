//! Job orchestrator and scheduler.
//!
//! Active/passive model: the orchestrator only finds a startable job, wins
//! the atomic lock, and publishes one seed extraction message. The passive
//! pipeline owns its own completion through the terminal-flag protocol; the
//! orchestrator never needs to know how much work remains.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{error, info, warn};

use pulse_core::{
    Clock, Checkpoint, ControlFlags, Envelope, EtlError, EtlResult, ExtractSpec, Job, NestedKind,
    Payload, ProviderKind, RelayFlags, Tenant, ids,
};
use pulse_postgres::{JobRepository, TenantSettings};
use pulse_queue::{Broker, QueueName};

use crate::context::EtlContext;

pub struct Orchestrator {
    pub(crate) ctx: Arc<EtlContext>,
}

impl Orchestrator {
    pub fn new(ctx: Arc<EtlContext>) -> Self {
        Self { ctx }
    }

    /// One pass over all active tenants, processed sequentially. The
    /// scheduler wraps this with a bounded spawn per tenant; `tick_once` is
    /// also the CLI entry point.
    pub async fn tick_once(&self) -> EtlResult<usize> {
        let tenants = self.ctx.tenants.list_active().await?;
        if tenants.is_empty() {
            warn!("No active tenants");
            return Ok(0);
        }

        let mut started = 0;
        for tenant in tenants {
            match self.process_if_due(&tenant).await {
                Ok(Some(job_name)) => {
                    info!(tenant_id = tenant.id, job = %job_name, "Seeded pipeline");
                    started += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    error!(tenant_id = tenant.id, error = %e, "Orchestrator pass failed for tenant");
                }
            }
        }
        Ok(started)
    }

    async fn process_if_due(&self, tenant: &Tenant) -> EtlResult<Option<String>> {
        if !self.should_run(tenant.id).await? {
            return Ok(None);
        }
        self.process_one_tenant(tenant.id).await
    }

    /// Whether this tenant's orchestrator is enabled and its interval has
    /// elapsed. A job inside its fast-retry budget shortens the wait to the
    /// retry interval.
    pub async fn should_run(&self, tenant_id: i64) -> EtlResult<bool> {
        let defaults = TenantSettings::defaults(
            self.ctx.config.orchestrator_interval_minutes,
            self.ctx.config.max_retry_attempts,
        );
        let settings = self.ctx.settings.for_tenant(tenant_id, &defaults).await?;
        if !settings.orchestrator_enabled {
            return Ok(false);
        }

        let Some(last_started) = self.ctx.jobs.latest_run_started_at(tenant_id).await? else {
            return Ok(true); // never ran
        };

        let mut window = Duration::minutes(settings.orchestrator_interval_minutes);
        if let Some(job) = self.ctx.jobs.find_startable(tenant_id).await? {
            if job.retry_count > 0 {
                window = window.min(JobRepository::retry_window(&job, settings.max_retry_attempts));
            }
        }

        Ok(self.ctx.clock.now() - last_started >= window)
    }

    /// Find at most one startable job, win the lock, verify the integration,
    /// and seed the pipeline. Returns the started job's name.
    pub async fn process_one_tenant(&self, tenant_id: i64) -> EtlResult<Option<String>> {
        let Some(job) = self.ctx.jobs.find_startable(tenant_id).await? else {
            return Ok(None);
        };

        let now = self.ctx.clock.now();
        if !self.ctx.jobs.try_lock(tenant_id, job.id, now).await? {
            // Another orchestrator instance got it.
            return Ok(None);
        }
        self.ctx.progress.job_status(tenant_id, job.id, "RUNNING");

        let integration = match job.integration_id {
            Some(integration_id) => {
                match self.ctx.tenants.integration(tenant_id, integration_id).await? {
                    Some(integration) if integration.active => integration,
                    Some(integration) => {
                        return self
                            .skip_job(
                                &job,
                                &format!(
                                    "integration {} ({}) is inactive",
                                    integration.id,
                                    integration.provider.as_str()
                                ),
                            )
                            .await;
                    }
                    None => {
                        return self
                            .skip_job(&job, &format!("integration {integration_id} not found"))
                            .await;
                    }
                }
            }
            None => {
                return self
                    .skip_job(&job, "job has no associated integration")
                    .await;
            }
        };

        let envelope = seed_envelope(&job, integration.provider, self.ctx.clock.now());
        self.ctx
            .broker
            .publish(&QueueName::extraction(tenant_id), &envelope)
            .await?;
        Ok(Some(job.job_name))
    }

    /// Inactive or missing integration: finish the job with the reason (no
    /// success stamp) and let the ladder move on.
    async fn skip_job(&self, job: &Job, reason: &str) -> EtlResult<Option<String>> {
        warn!(job_id = job.id, tenant_id = job.tenant_id, reason, "Skipping job");
        let next = self
            .ctx
            .jobs
            .skip_with_error(job.tenant_id, job.id, reason, self.ctx.clock.now())
            .await?;
        self.ctx
            .progress
            .job_status(job.tenant_id, job.id, "FINISHED");
        if let Some(next_name) = &next {
            info!(next = %next_name, "Next job promoted after skip");
        }
        Ok(None)
    }

    /// Fatal stage error: return the job to PENDING for retry.
    pub async fn fail_job(
        &self,
        tenant_id: i64,
        job_id: i64,
        error: &EtlError,
        checkpoint: Option<&Checkpoint>,
    ) -> EtlResult<()> {
        let now = self.ctx.clock.now();
        self.ctx
            .jobs
            .fail(tenant_id, job_id, &error.to_string(), checkpoint, now)
            .await?;
        self.ctx.progress.job_status(tenant_id, job_id, "PENDING");
        Ok(())
    }

    pub async fn read_ladder(&self, tenant_id: i64) -> EtlResult<Vec<Job>> {
        Ok(self.ctx.jobs.ladder(tenant_id).await?)
    }
}

/// Build the seed extraction message for a run, resuming from the job's
/// checkpoint when a rate limit interrupted the previous attempt.
///
/// The sync boundary is frozen here: `old_last_sync_date` from the job row,
/// `new_last_sync_date` stamped now. Every downstream message relays both.
pub fn seed_envelope(
    job: &Job,
    provider: ProviderKind,
    now: chrono::DateTime<chrono::Utc>,
) -> Envelope {
    let (step, spec, relay) = seed_spec(job, provider);
    Envelope {
        message_id: ids::new_message_id(),
        tenant_id: job.tenant_id,
        integration_id: job.integration_id,
        job_id: Some(job.id),
        provider,
        step,
        payload: Payload::Extract(spec),
        flags: ControlFlags::seed(),
        relay,
        old_last_sync_date: job.last_sync_date,
        new_last_sync_date: Some(now),
    }
}

fn seed_spec(job: &Job, provider: ProviderKind) -> (String, ExtractSpec, RelayFlags) {
    if let Some(checkpoint) = job.checkpoint.as_ref().filter(|c| c.rate_limit_hit) {
        if let Some(resumed) = resume_spec(checkpoint) {
            return resumed;
        }
        warn!(job_id = job.id, "Rate-limit checkpoint not resumable; starting step over");
    }

    match provider {
        ProviderKind::Repos => (
            "repositories".to_string(),
            ExtractSpec::Repositories,
            RelayFlags::default(),
        ),
        _ => (
            "projects".to_string(),
            ExtractSpec::Projects,
            RelayFlags::default(),
        ),
    }
}

/// Re-enter extraction at the checkpointed cursor. The resumed branch is the
/// only one in flight, so it carries the terminal relay bits.
fn resume_spec(checkpoint: &Checkpoint) -> Option<(String, ExtractSpec, RelayFlags)> {
    let node_type = checkpoint.rate_limit_node_type.as_deref()?;
    match node_type {
        "work_items" => Some((
            "work_items".to_string(),
            ExtractSpec::WorkItems {
                page_token: checkpoint.last_cursor.clone(),
            },
            RelayFlags::default(),
        )),
        "dev_status" => Some((
            "dev_status".to_string(),
            ExtractSpec::DevStatus,
            RelayFlags::default(),
        )),
        "repositories" => Some((
            "repositories".to_string(),
            ExtractSpec::Repositories,
            RelayFlags::default(),
        )),
        "pull_requests" => {
            let parent = checkpoint.parent_context.as_ref()?;
            Some((
                "pull_requests".to_string(),
                ExtractSpec::PullRequests {
                    owner: parent.owner.clone(),
                    repo_name: parent.repo_name.clone(),
                    full_name: parent.full_name.clone(),
                    pr_cursor: checkpoint.last_cursor.clone(),
                },
                RelayFlags {
                    last_parent: true,
                    last_parent_last_nested: false,
                },
            ))
        }
        nested => {
            let kind = match nested {
                "commits" => NestedKind::Commits,
                "reviews" => NestedKind::Reviews,
                "comments" => NestedKind::Comments,
                "review_threads" => NestedKind::ReviewThreads,
                _ => return None,
            };
            let parent = checkpoint.parent_context.as_ref()?;
            let parent_external_id = checkpoint.current_parent_external_id.clone()?;
            let cursor = checkpoint
                .nested_cursors
                .get(kind.as_str())
                .and_then(|state| state.cursor.clone())
                .or_else(|| checkpoint.last_cursor.clone());
            Some((
                "pull_requests".to_string(),
                ExtractSpec::NestedPage {
                    owner: parent.owner.clone(),
                    repo_name: parent.repo_name.clone(),
                    full_name: parent.full_name.clone(),
                    parent_external_id,
                    nested: kind,
                    cursor,
                },
                RelayFlags {
                    last_parent: true,
                    last_parent_last_nested: true,
                },
            ))
        }
    }
}

/// Scheduler loop: wakes on a timer and launches per-tenant processing
/// through a bounded pool.
pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    wake_interval: StdDuration,
    pool: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<Orchestrator>, wake_interval: StdDuration, pool_size: usize) -> Self {
        Self {
            orchestrator,
            wake_interval,
            pool: Arc::new(Semaphore::new(pool_size)),
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Scheduler started");
        let mut interval = tokio::time::interval(self.wake_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.pass().await {
                        error!(error = %e, "Scheduler pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn pass(&self) -> EtlResult<()> {
        let tenants = self.orchestrator.ctx.tenants.list_active().await?;
        for tenant in tenants {
            if !self.orchestrator.should_run(tenant.id).await.unwrap_or(false) {
                continue;
            }
            let permit = match self.pool.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(tenant_id = tenant.id, "Worker pool saturated; tenant deferred to next tick");
                    continue;
                }
            };
            let orchestrator = self.orchestrator.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = orchestrator.process_one_tenant(tenant.id).await {
                    error!(tenant_id = tenant.id, error = %e, "process_one_tenant failed");
                }
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pulse_core::{JobStatus, ParentContext};

    fn job_with_checkpoint(checkpoint: Option<Checkpoint>) -> Job {
        Job {
            id: 4,
            tenant_id: 2,
            integration_id: Some(9),
            job_name: "repos".into(),
            execution_order: 2,
            schedule_interval_minutes: 60,
            retry_interval_minutes: 10,
            status: JobStatus::Pending,
            resume_status: None,
            last_run_started_at: None,
            last_run_finished_at: None,
            last_success_at: None,
            last_sync_date: None,
            retry_count: 0,
            error_message: None,
            checkpoint,
            steps: vec![],
            active: true,
        }
    }

    #[test]
    fn fresh_repo_job_seeds_repository_search() {
        let envelope = seed_envelope(&job_with_checkpoint(None), ProviderKind::Repos, Utc::now());
        assert_eq!(envelope.step, "repositories");
        assert!(matches!(
            envelope.payload,
            Payload::Extract(ExtractSpec::Repositories)
        ));
        assert!(envelope.flags.first_item && envelope.flags.last_job_item);
        assert!(!envelope.relay.last_parent);
    }

    #[test]
    fn fresh_issues_job_seeds_project_extraction() {
        let envelope = seed_envelope(&job_with_checkpoint(None), ProviderKind::Issues, Utc::now());
        assert_eq!(envelope.step, "projects");
        assert!(matches!(
            envelope.payload,
            Payload::Extract(ExtractSpec::Projects)
        ));
    }

    #[test]
    fn rate_limited_pr_checkpoint_resumes_at_cursor() {
        let mut checkpoint =
            Checkpoint::rate_limited("pull_requests", Some("pr-cursor-7".into()), None);
        checkpoint.parent_context = Some(ParentContext {
            owner: "acme".into(),
            repo_name: "edge-proxy".into(),
            full_name: "acme/edge-proxy".into(),
        });
        let envelope = seed_envelope(
            &job_with_checkpoint(Some(checkpoint)),
            ProviderKind::Repos,
            Utc::now(),
        );
        match envelope.payload {
            Payload::Extract(ExtractSpec::PullRequests {
                ref owner,
                ref pr_cursor,
                ..
            }) => {
                assert_eq!(owner, "acme");
                assert_eq!(pr_cursor.as_deref(), Some("pr-cursor-7"));
            }
            ref other => panic!("unexpected payload: {other:?}"),
        }
        assert!(envelope.relay.last_parent);
    }

    #[test]
    fn rate_limited_nested_checkpoint_resumes_the_nested_chain() {
        let mut checkpoint = Checkpoint::rate_limited("commits", None, None);
        checkpoint.parent_context = Some(ParentContext {
            owner: "acme".into(),
            repo_name: "edge-proxy".into(),
            full_name: "acme/edge-proxy".into(),
        });
        checkpoint.current_parent_external_id = Some("PR_node_9".into());
        checkpoint.nested_cursors.insert(
            "commits".into(),
            pulse_core::NestedCursorState {
                fetched: true,
                has_next_page: true,
                cursor: Some("c-200".into()),
            },
        );
        let envelope = seed_envelope(
            &job_with_checkpoint(Some(checkpoint)),
            ProviderKind::Repos,
            Utc::now(),
        );
        match envelope.payload {
            Payload::Extract(ExtractSpec::NestedPage {
                ref parent_external_id,
                nested,
                ref cursor,
                ..
            }) => {
                assert_eq!(parent_external_id, "PR_node_9");
                assert_eq!(nested, NestedKind::Commits);
                assert_eq!(cursor.as_deref(), Some("c-200"));
            }
            ref other => panic!("unexpected payload: {other:?}"),
        }
        assert!(envelope.relay.last_parent_last_nested);
    }

    #[test]
    fn unresumable_checkpoint_falls_back_to_a_fresh_step() {
        let checkpoint = Checkpoint::rate_limited("pull_requests", Some("cursor".into()), None);
        // No parent context saved: cannot resume mid-repository.
        let envelope = seed_envelope(
            &job_with_checkpoint(Some(checkpoint)),
            ProviderKind::Repos,
            Utc::now(),
        );
        assert!(matches!(
            envelope.payload,
            Payload::Extract(ExtractSpec::Repositories)
        ));
    }
}
