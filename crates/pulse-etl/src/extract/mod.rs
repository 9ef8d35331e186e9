//! Extract stage.
//!
//! Turns a seed extraction message into raw records, transform messages, and
//! follow-up extraction messages, while respecting provider rate limits and
//! keeping a checkpoint sufficient for a full resume. All flag placement
//! goes through `pulse_core::flags::FanOut`; a branch that hits a rate limit
//! checkpoints and emits one completion message so the job still chains.

pub mod repohost;
mod tracker;

use std::sync::Arc;

use tracing::{info, warn};

use pulse_core::{
    Checkpoint, ControlFlags, Envelope, EtlError, EtlResult, ExtractSpec, Payload, RawKind,
    RelayFlags, StageStatus, TransformSpec,
};
use pulse_queue::{Broker, QueueName};

use crate::context::EtlContext;

pub async fn handle(ctx: &Arc<EtlContext>, envelope: &Envelope, spec: &ExtractSpec) -> EtlResult<()> {
    match spec {
        ExtractSpec::Projects => tracker::extract_projects(ctx, envelope).await,
        ExtractSpec::ProjectStatuses => tracker::extract_project_statuses(ctx, envelope).await,
        ExtractSpec::WorkItems { page_token } => {
            tracker::extract_work_items(ctx, envelope, page_token.as_deref()).await
        }
        ExtractSpec::DevStatus => tracker::extract_dev_status(ctx, envelope).await,
        ExtractSpec::Repositories => repohost::extract_repositories(ctx, envelope).await,
        ExtractSpec::PullRequests {
            owner,
            repo_name,
            full_name,
            pr_cursor,
        } => {
            repohost::extract_pull_requests(
                ctx,
                envelope,
                owner,
                repo_name,
                full_name,
                pr_cursor.as_deref(),
            )
            .await
        }
        ExtractSpec::NestedPage {
            owner,
            repo_name,
            full_name,
            parent_external_id,
            nested,
            cursor,
        } => {
            repohost::extract_nested_page(
                ctx,
                envelope,
                owner,
                repo_name,
                full_name,
                parent_external_id,
                *nested,
                cursor.as_deref(),
            )
            .await
        }
    }
}

/// Step-scoped flags: the job-terminal bit never rides a non-final step's
/// fan-out; it travels on the next step's seed instead.
pub(crate) fn step_scoped(flags: ControlFlags) -> ControlFlags {
    ControlFlags {
        last_job_item: false,
        rate_limited: false,
        ..flags
    }
}

/// Seed flags for the next step of the same run, inheriting the job-terminal
/// potential from the current seed.
pub(crate) fn next_step_seed(flags: ControlFlags) -> ControlFlags {
    ControlFlags {
        first_item: true,
        last_item: true,
        last_job_item: flags.last_job_item,
        rate_limited: false,
    }
}

pub(crate) fn require_job(envelope: &Envelope) -> EtlResult<i64> {
    envelope
        .job_id
        .ok_or_else(|| EtlError::Permanent("extraction message carries no job".into()))
}

pub(crate) async fn publish_transform(
    ctx: &EtlContext,
    envelope: &Envelope,
    data_type: RawKind,
    raw_data_id: i64,
    flags: ControlFlags,
    relay: RelayFlags,
) -> EtlResult<()> {
    let message = envelope.derive(
        Payload::Transform(TransformSpec {
            raw_data_id: Some(raw_data_id),
            data_type,
        }),
        flags,
        relay,
    );
    ctx.broker
        .publish(&QueueName::transform(envelope.tenant_id), &message)
        .await?;
    Ok(())
}

/// Zero-data terminal marker on the transform queue; the transform and embed
/// stages forward it so the job still chains.
pub(crate) async fn publish_completion(
    ctx: &EtlContext,
    envelope: &Envelope,
    data_type: RawKind,
    rate_limited: bool,
) -> EtlResult<()> {
    info!(
        tenant_id = envelope.tenant_id,
        step = %envelope.step,
        rate_limited,
        "Publishing completion message"
    );
    let message = envelope.derive(
        Payload::Transform(TransformSpec::completion(data_type)),
        ControlFlags::completion(rate_limited),
        RelayFlags::default(),
    );
    ctx.broker
        .publish(&QueueName::transform(envelope.tenant_id), &message)
        .await?;
    Ok(())
}

pub(crate) async fn publish_extraction(
    ctx: &EtlContext,
    envelope: &Envelope,
    step: &str,
    spec: ExtractSpec,
    flags: ControlFlags,
    relay: RelayFlags,
) -> EtlResult<()> {
    let message = envelope.derive_step(step, Payload::Extract(spec), flags, relay);
    ctx.broker
        .publish(&QueueName::extraction(envelope.tenant_id), &message)
        .await?;
    Ok(())
}

/// Persist a rate-limit checkpoint and emit the completion message; the job
/// chains "complete" and re-enters from the cursor on its next tick.
pub(crate) async fn rate_limit_exit(
    ctx: &EtlContext,
    envelope: &Envelope,
    data_type: RawKind,
    checkpoint: Checkpoint,
) -> EtlResult<()> {
    let job_id = require_job(envelope)?;
    warn!(
        tenant_id = envelope.tenant_id,
        job_id,
        node_type = checkpoint.rate_limit_node_type.as_deref().unwrap_or("?"),
        "Rate limit hit; checkpointing and completing gracefully"
    );
    ctx.jobs
        .save_checkpoint(envelope.tenant_id, job_id, &checkpoint)
        .await?;
    publish_completion(ctx, envelope, data_type, true).await
}

pub(crate) async fn mark_step(
    ctx: &EtlContext,
    envelope: &Envelope,
    status: StageStatus,
    fraction: Option<f32>,
) {
    if let Some(job_id) = envelope.job_id {
        if let Err(e) = ctx
            .jobs
            .set_step_stage(envelope.tenant_id, job_id, &envelope.step, "extraction", status)
            .await
        {
            warn!(error = %e, "Could not update step status");
        }
        ctx.progress.stage(
            envelope.tenant_id,
            envelope.job_id,
            &envelope.step,
            "extraction",
            status,
            fraction,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_scoping_strips_the_job_terminal_bit() {
        let scoped = step_scoped(ControlFlags::seed());
        assert!(scoped.first_item && scoped.last_item);
        assert!(!scoped.last_job_item);
    }

    #[test]
    fn next_step_seed_carries_the_job_terminal_potential() {
        let seed = next_step_seed(ControlFlags::seed());
        assert!(seed.first_item && seed.last_item && seed.last_job_item);

        let mid_run = next_step_seed(ControlFlags::default());
        assert!(mid_run.first_item && mid_run.last_item);
        assert!(!mid_run.last_job_item);
    }
}
