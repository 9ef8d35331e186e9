//! Issue-tracker extraction: projects, statuses, work items, dev status.
//!
//! Work items stream in provider pages; each page is stored as individual
//! raw records and fanned out to transform, then the next page is
//! re-enqueued. The dev-status step is the run's final step, so its fan-out
//! carries the job-terminal flags.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use pulse_connect::{ConnectError, IssueTrackerClient};
use pulse_core::{
    Clock, Checkpoint, ControlFlags, Envelope, EtlResult, ExtractSpec, FanOut, RawKind, RelayFlags,
    StageStatus,
};

use super::{
    mark_step, next_step_seed, publish_completion, publish_extraction, publish_transform,
    rate_limit_exit, require_job, step_scoped,
};
use crate::context::EtlContext;

const WORK_ITEM_PAGE_SIZE: i64 = 100;

/// Step 1: projects and their work-item types.
pub(crate) async fn extract_projects(ctx: &Arc<EtlContext>, envelope: &Envelope) -> EtlResult<()> {
    require_job(envelope)?;
    let integration = ctx.integration_for(envelope).await?;
    let client = ctx.issue_tracker_for(&integration)?;
    mark_step(ctx, envelope, StageStatus::Running, Some(0.0)).await;

    let projects = match client.search_projects().await {
        Ok(projects) => projects,
        Err(ConnectError::RateLimited { reset_at, .. }) => {
            let checkpoint = Checkpoint::rate_limited("projects", None, reset_at);
            rate_limit_exit(ctx, envelope, RawKind::Project, checkpoint).await?;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    // Honor the configured project filter when one is set.
    let wanted = &integration.settings.projects;
    let projects: Vec<_> = projects
        .into_iter()
        .filter(|p| {
            wanted.is_empty()
                || p["key"]
                    .as_str()
                    .map(|key| wanted.iter().any(|w| w == key))
                    .unwrap_or(true)
        })
        .collect();
    info!(tenant_id = envelope.tenant_id, count = projects.len(), "Extracted projects");

    let mut raw_ids = Vec::with_capacity(projects.len());
    for project in &projects {
        let work_item_types = match client
            .project_work_item_types(&project["id"].as_str().unwrap_or_default().to_string())
            .await
        {
            Ok(types) => types,
            Err(ConnectError::RateLimited { reset_at, .. }) => {
                let checkpoint = Checkpoint::rate_limited("projects", None, reset_at);
                rate_limit_exit(ctx, envelope, RawKind::Project, checkpoint).await?;
                return Ok(());
            }
            Err(e) => {
                warn!(error = %e, "Could not fetch work-item types; storing project without them");
                Vec::new()
            }
        };
        let payload = json!({
            "project": project,
            "work_item_types": work_item_types,
        });
        let raw_id = ctx
            .raw
            .insert(
                envelope.tenant_id,
                integration.id,
                RawKind::Project,
                &payload,
                project["id"].as_str(),
                ctx.clock.now(),
            )
            .await?;
        raw_ids.push(raw_id);
    }

    let fan_out = FanOut::new(step_scoped(envelope.flags), raw_ids.len());
    for (index, raw_id) in raw_ids.iter().enumerate() {
        publish_transform(
            ctx,
            envelope,
            RawKind::Project,
            *raw_id,
            fan_out.child(index),
            RelayFlags::default(),
        )
        .await?;
    }

    // The run continues regardless of how many projects there were.
    publish_extraction(
        ctx,
        envelope,
        "project_statuses",
        ExtractSpec::ProjectStatuses,
        next_step_seed(envelope.flags),
        RelayFlags::default(),
    )
    .await?;
    mark_step(ctx, envelope, StageStatus::Finished, Some(1.0)).await;
    Ok(())
}

/// Step 2: per-project statuses.
pub(crate) async fn extract_project_statuses(
    ctx: &Arc<EtlContext>,
    envelope: &Envelope,
) -> EtlResult<()> {
    require_job(envelope)?;
    let integration = ctx.integration_for(envelope).await?;
    let client = ctx.issue_tracker_for(&integration)?;
    mark_step(ctx, envelope, StageStatus::Running, Some(0.0)).await;

    let project_keys = project_keys(ctx, envelope, &integration).await?;
    let mut raw_ids = Vec::with_capacity(project_keys.len());
    for key in &project_keys {
        let statuses = match client.project_statuses(key).await {
            Ok(statuses) => statuses,
            Err(ConnectError::RateLimited { reset_at, .. }) => {
                let checkpoint = Checkpoint::rate_limited("projects", None, reset_at);
                rate_limit_exit(ctx, envelope, RawKind::ProjectStatuses, checkpoint).await?;
                return Ok(());
            }
            Err(e) => {
                warn!(project = %key, error = %e, "Could not fetch statuses; skipping project");
                continue;
            }
        };
        let payload = json!({ "project_key": key, "statuses": statuses });
        let raw_id = ctx
            .raw
            .insert(
                envelope.tenant_id,
                integration.id,
                RawKind::ProjectStatuses,
                &payload,
                Some(key.as_str()),
                ctx.clock.now(),
            )
            .await?;
        raw_ids.push(raw_id);
    }

    let fan_out = FanOut::new(step_scoped(envelope.flags), raw_ids.len());
    for (index, raw_id) in raw_ids.iter().enumerate() {
        publish_transform(
            ctx,
            envelope,
            RawKind::ProjectStatuses,
            *raw_id,
            fan_out.child(index),
            RelayFlags::default(),
        )
        .await?;
    }

    publish_extraction(
        ctx,
        envelope,
        "work_items",
        ExtractSpec::WorkItems { page_token: None },
        next_step_seed(envelope.flags),
        RelayFlags::default(),
    )
    .await?;
    mark_step(ctx, envelope, StageStatus::Finished, Some(1.0)).await;
    Ok(())
}

/// Step 3: work items with changelogs, one provider page per message.
pub(crate) async fn extract_work_items(
    ctx: &Arc<EtlContext>,
    envelope: &Envelope,
    page_token: Option<&str>,
) -> EtlResult<()> {
    let job_id = require_job(envelope)?;
    let integration = ctx.integration_for(envelope).await?;
    let client = ctx.issue_tracker_for(&integration)?;
    let first_page = page_token.is_none();
    if first_page {
        mark_step(ctx, envelope, StageStatus::Running, Some(0.0)).await;
    }

    let project_keys = project_keys(ctx, envelope, &integration).await?;
    let until = envelope.new_last_sync_date.unwrap_or_else(|| ctx.clock.now());
    let query =
        IssueTrackerClient::bounded_query(&project_keys, envelope.old_last_sync_date, until);

    let page = match client
        .search_work_items(&query, page_token, WORK_ITEM_PAGE_SIZE)
        .await
    {
        Ok(page) => page,
        Err(ConnectError::RateLimited { reset_at, .. }) => {
            let checkpoint = Checkpoint::rate_limited(
                "work_items",
                page_token.map(str::to_string),
                reset_at,
            );
            rate_limit_exit(ctx, envelope, RawKind::WorkItem, checkpoint).await?;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let raw_ids = ctx
        .raw
        .insert_batch(
            envelope.tenant_id,
            integration.id,
            RawKind::WorkItem,
            &page.items,
            ctx.clock.now(),
        )
        .await?;
    info!(
        tenant_id = envelope.tenant_id,
        batch = raw_ids.len(),
        is_last = page.is_last,
        "Stored work-item batch"
    );

    let is_last_page = page.is_last || page.next_page_token.is_none();
    let incoming = ControlFlags {
        first_item: envelope.flags.first_item && first_page,
        last_item: envelope.flags.last_item,
        last_job_item: false,
        rate_limited: false,
    };
    let fan_out = FanOut::new(incoming, raw_ids.len()).terminal_eligible(is_last_page);
    for (index, raw_id) in raw_ids.iter().enumerate() {
        publish_transform(
            ctx,
            envelope,
            RawKind::WorkItem,
            *raw_id,
            fan_out.child(index),
            RelayFlags::default(),
        )
        .await?;
    }

    if is_last_page {
        publish_extraction(
            ctx,
            envelope,
            "dev_status",
            ExtractSpec::DevStatus,
            next_step_seed(envelope.flags),
            RelayFlags::default(),
        )
        .await?;
        mark_step(ctx, envelope, StageStatus::Finished, Some(1.0)).await;
    } else {
        // Continuation keeps the step-last potential; first is spent.
        publish_extraction(
            ctx,
            envelope,
            "work_items",
            ExtractSpec::WorkItems {
                page_token: page.next_page_token.clone(),
            },
            ControlFlags {
                first_item: false,
                last_item: envelope.flags.last_item,
                last_job_item: envelope.flags.last_job_item,
                rate_limited: false,
            },
            RelayFlags::default(),
        )
        .await?;
    }

    let checkpoint = Checkpoint {
        last_cursor: page.next_page_token,
        items_processed: raw_ids.len() as i64,
        ..Checkpoint::default()
    };
    ctx.jobs
        .save_checkpoint(envelope.tenant_id, job_id, &checkpoint)
        .await?;
    Ok(())
}

/// Step 4 (final): development status for changed work items. Terminal step,
/// so the fan-out here carries `last_job_item`.
pub(crate) async fn extract_dev_status(ctx: &Arc<EtlContext>, envelope: &Envelope) -> EtlResult<()> {
    require_job(envelope)?;
    let integration = ctx.integration_for(envelope).await?;
    let client = ctx.issue_tracker_for(&integration)?;
    mark_step(ctx, envelope, StageStatus::Running, Some(0.0)).await;

    let until = envelope.new_last_sync_date.unwrap_or_else(|| ctx.clock.now());
    let changed = ctx
        .entities
        .changed_work_item_keys(
            envelope.tenant_id,
            integration.id,
            envelope.old_last_sync_date,
            until,
        )
        .await?;

    if changed.is_empty() {
        publish_completion(ctx, envelope, RawKind::DevStatus, false).await?;
        mark_step(ctx, envelope, StageStatus::Finished, Some(1.0)).await;
        return Ok(());
    }

    let mut raw_ids = Vec::with_capacity(changed.len());
    let mut rate_limited = None;
    for (key, external_id) in &changed {
        let detail = match client.dev_status(external_id).await {
            Ok(detail) => detail,
            Err(ConnectError::RateLimited { reset_at, .. }) => {
                rate_limited = Some(reset_at);
                break;
            }
            Err(e) => {
                warn!(work_item = %key, error = %e, "Dev-status fetch failed; item skipped");
                continue;
            }
        };
        let payload = json!({
            "work_item_external_id": external_id,
            "work_item_key": key,
            "detail": detail,
        });
        let raw_id = ctx
            .raw
            .insert(
                envelope.tenant_id,
                integration.id,
                RawKind::DevStatus,
                &payload,
                Some(external_id.as_str()),
                ctx.clock.now(),
            )
            .await?;
        raw_ids.push(raw_id);
    }

    let interrupted = rate_limited.is_some();
    let fan_out = FanOut::new(envelope.flags, raw_ids.len()).terminal_eligible(!interrupted);
    for (index, raw_id) in raw_ids.iter().enumerate() {
        publish_transform(
            ctx,
            envelope,
            RawKind::DevStatus,
            *raw_id,
            fan_out.child(index),
            RelayFlags::default(),
        )
        .await?;
    }

    if let Some(reset_at) = rate_limited {
        let checkpoint = Checkpoint::rate_limited("dev_status", None, reset_at);
        rate_limit_exit(ctx, envelope, RawKind::DevStatus, checkpoint).await?;
        return Ok(());
    }
    if fan_out.completion_needed() {
        // Every fetch was skipped; the step still owes its terminal marker.
        publish_completion(ctx, envelope, RawKind::DevStatus, false).await?;
    }

    mark_step(ctx, envelope, StageStatus::Finished, Some(1.0)).await;
    Ok(())
}

async fn project_keys(
    ctx: &EtlContext,
    envelope: &Envelope,
    integration: &pulse_core::Integration,
) -> EtlResult<Vec<String>> {
    if !integration.settings.projects.is_empty() {
        return Ok(integration.settings.projects.clone());
    }
    let keys = ctx
        .entities
        .project_keys(envelope.tenant_id, integration.id)
        .await?;
    if keys.is_empty() {
        return Err(pulse_core::EtlError::Permanent(
            "no projects configured or extracted yet".into(),
        ));
    }
    Ok(keys)
}
