//! Repo-host extraction: repository search, pull-request pages, nested
//! continuations.
//!
//! The repository step fans out twice from one search: every repository goes
//! to transform (LOOP 1) and every repository seeds its own pull-request
//! extraction (LOOP 2). The `last_parent` relay bit rides the last
//! repository of LOOP 2 and, combined with page exhaustion and the absence
//! of nested sub-fan-out, decides where the job-terminal flags land.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use tracing::{info, warn};

use pulse_connect::repohost::{nested_info, node_updated_at};
use pulse_connect::ConnectError;
use pulse_core::flags::nested_page_terminates;
use pulse_core::{
    Clock, Checkpoint, ControlFlags, Envelope, EtlError, EtlResult, ExtractSpec, FanOut, NestedCursorState,
    NestedKind, ParentContext, RawKind, RelayFlags, StageStatus,
};

use super::{
    mark_step, publish_completion, publish_extraction, publish_transform, rate_limit_exit,
    require_job, step_scoped,
};
use crate::context::EtlContext;

/// First-run lookback when the job has never synced.
const DEFAULT_LOOKBACK_DAYS: i64 = 730;

/// Keep only nodes updated after the boundary. Nodes arrive `updated DESC`,
/// so the first older-than-boundary node terminates pagination early.
pub fn filter_recent(
    nodes: Vec<Value>,
    boundary: Option<DateTime<Utc>>,
) -> (Vec<Value>, bool) {
    let Some(boundary) = boundary else {
        return (nodes, false);
    };
    let mut kept = Vec::with_capacity(nodes.len());
    for node in nodes {
        match node_updated_at(&node) {
            Some(updated) if updated <= boundary => return (kept, true),
            _ => kept.push(node),
        }
    }
    (kept, false)
}

/// One nested continuation to enqueue for a PR page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NestedContinuation {
    pub parent_external_id: String,
    pub kind: NestedKind,
    pub cursor: Option<String>,
    /// True for exactly the last nested kind of the last PR of the last
    /// parent; the terminal flags relay down this branch.
    pub last_parent_last_nested: bool,
}

/// Plan the nested continuations of one PR page and decide which branch (if
/// any) inherits the terminal relay.
pub fn plan_nested_continuations(
    nodes: &[Value],
    last_parent: bool,
    has_next_page: bool,
) -> Vec<NestedContinuation> {
    let mut plan = Vec::new();
    for (pr_index, node) in nodes.iter().enumerate() {
        let parent_external_id = node["id"].as_str().unwrap_or_default().to_string();
        let pending: Vec<(NestedKind, Option<String>)> = NestedKind::ALL
            .into_iter()
            .filter_map(|kind| {
                let info = nested_info(node, kind);
                info.has_next_page.then_some((kind, info.end_cursor))
            })
            .collect();

        let is_last_pr = pr_index + 1 == nodes.len();
        let pending_count = pending.len();
        for (nested_index, (kind, cursor)) in pending.into_iter().enumerate() {
            let is_last_kind = nested_index + 1 == pending_count;
            plan.push(NestedContinuation {
                parent_external_id: parent_external_id.clone(),
                kind,
                cursor,
                last_parent_last_nested: last_parent
                    && !has_next_page
                    && is_last_pr
                    && is_last_kind,
            });
        }
    }
    plan
}

/// Whether any node of the page needs nested sub-fan-out.
pub fn has_nested_pagination(nodes: &[Value]) -> bool {
    nodes.iter().any(|node| {
        NestedKind::ALL
            .into_iter()
            .any(|kind| nested_info(node, kind).has_next_page)
    })
}

/// Strip filter-matching entries from the linked-repository supplement: the
/// filters already cover them.
pub fn supplemental_names(linked_full_names: &[String], filters: &[String]) -> Vec<String> {
    linked_full_names
        .iter()
        .filter_map(|full_name| full_name.split_once('/').map(|(_, name)| name.to_string()))
        .filter(|name| {
            !filters.iter().any(|filter| {
                let needle = filter.trim_end_matches('-');
                !needle.is_empty() && name.contains(needle)
            })
        })
        .collect()
}

/// Repository search seed: LOOP 1 to transform, LOOP 2 to PR extraction.
pub(crate) async fn extract_repositories(
    ctx: &Arc<EtlContext>,
    envelope: &Envelope,
) -> EtlResult<()> {
    require_job(envelope)?;
    let integration = ctx.integration_for(envelope).await?;
    let client = ctx.repo_host_for(&integration)?;
    mark_step(ctx, envelope, StageStatus::Running, Some(0.0)).await;

    let org = integration
        .settings
        .organization
        .clone()
        .ok_or_else(|| EtlError::Permanent("integration settings carry no organization".into()))?;
    let filters = integration.settings.repository_filters.clone();

    let linked = ctx
        .entities
        .linked_repository_names(envelope.tenant_id, integration.id)
        .await
        .unwrap_or_else(|e| {
            warn!(error = %e, "Could not query linked repository names");
            Vec::new()
        });
    let extra_names = supplemental_names(&linked, &filters);

    let until = envelope.new_last_sync_date.unwrap_or_else(|| ctx.clock.now());
    let since = envelope
        .old_last_sync_date
        .unwrap_or_else(|| until - Duration::days(DEFAULT_LOOKBACK_DAYS));

    let repositories = match client
        .search_repositories(
            &org,
            since.date_naive(),
            until.date_naive(),
            &filters,
            &extra_names,
        )
        .await
    {
        Ok(repositories) => repositories,
        Err(ConnectError::RateLimited { reset_at, .. }) => {
            let checkpoint = Checkpoint::rate_limited("repositories", None, reset_at);
            rate_limit_exit(ctx, envelope, RawKind::Repository, checkpoint).await?;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    info!(
        tenant_id = envelope.tenant_id,
        count = repositories.len(),
        "Repository search complete"
    );

    if repositories.is_empty() {
        publish_completion(ctx, envelope, RawKind::Repository, false).await?;
        mark_step(ctx, envelope, StageStatus::Finished, Some(1.0)).await;
        return Ok(());
    }

    // LOOP 1: every repository to transform. The job continues into PR
    // extraction, so the step fan-out never carries the job-terminal bit.
    let total = repositories.len();
    let fan_out = FanOut::new(step_scoped(envelope.flags), total);
    for (index, repo) in repositories.iter().enumerate() {
        let external_id = repo_external_id(repo);
        let payload = json!({ "repository": repo });
        let raw_id = ctx
            .raw
            .insert(
                envelope.tenant_id,
                integration.id,
                RawKind::Repository,
                &payload,
                Some(external_id.as_str()),
                ctx.clock.now(),
            )
            .await?;
        publish_transform(
            ctx,
            envelope,
            RawKind::Repository,
            raw_id,
            fan_out.child(index),
            RelayFlags {
                last_parent: index + 1 == total,
                last_parent_last_nested: false,
            },
        )
        .await?;
    }

    // LOOP 2: every repository seeds its own PR extraction; the last one
    // carries the relay bit the terminal flags will descend through.
    for (index, repo) in repositories.iter().enumerate() {
        let owner = repo["owner"]["login"]
            .as_str()
            .or_else(|| repo["owner"].as_str())
            .unwrap_or_default()
            .to_string();
        let name = repo["name"].as_str().unwrap_or_default().to_string();
        let full_name = repo["full_name"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{owner}/{name}"));
        publish_extraction(
            ctx,
            envelope,
            "pull_requests",
            ExtractSpec::PullRequests {
                owner,
                repo_name: name,
                full_name,
                pr_cursor: None,
            },
            ControlFlags {
                first_item: envelope.flags.first_item && index == 0,
                last_item: false,
                last_job_item: false,
                rate_limited: false,
            },
            RelayFlags {
                last_parent: index + 1 == total,
                last_parent_last_nested: false,
            },
        )
        .await?;
    }

    mark_step(ctx, envelope, StageStatus::Finished, Some(1.0)).await;
    Ok(())
}

/// One pull-request page: store each PR as its own raw record, fan out to
/// transform, enqueue nested continuations and the next page.
pub(crate) async fn extract_pull_requests(
    ctx: &Arc<EtlContext>,
    envelope: &Envelope,
    owner: &str,
    repo_name: &str,
    full_name: &str,
    pr_cursor: Option<&str>,
) -> EtlResult<()> {
    let job_id = require_job(envelope)?;
    let integration = ctx.integration_for(envelope).await?;
    let client = ctx.repo_host_for(&integration)?;

    let parent_context = ParentContext {
        owner: owner.to_string(),
        repo_name: repo_name.to_string(),
        full_name: full_name.to_string(),
    };

    let page = match client.pull_requests_page(owner, repo_name, pr_cursor).await {
        Ok(page) => page,
        Err(ConnectError::RateLimited { reset_at, .. }) => {
            let mut checkpoint = Checkpoint::rate_limited(
                "pull_requests",
                pr_cursor.map(str::to_string),
                reset_at,
            );
            checkpoint.parent_context = Some(parent_context);
            rate_limit_exit(ctx, envelope, RawKind::PullRequest, checkpoint).await?;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let (kept, early_termination) = filter_recent(page.nodes, envelope.old_last_sync_date);
    if kept.is_empty() {
        if envelope.relay.last_parent {
            // Nothing to extract and no later branch will run: close the job.
            publish_completion(ctx, envelope, RawKind::PullRequest, false).await?;
        }
        return Ok(());
    }

    let effective_has_next = page.has_next_page && !early_termination;
    let nested_pending = has_nested_pagination(&kept);
    let terminal_eligible = envelope.relay.last_parent && !effective_has_next && !nested_pending;
    info!(
        tenant_id = envelope.tenant_id,
        repo = %full_name,
        prs = kept.len(),
        has_next = effective_has_next,
        nested_pending,
        "Processing pull-request page"
    );

    let fan_out = FanOut::new(
        ControlFlags {
            first_item: envelope.flags.first_item,
            last_item: true,
            last_job_item: true,
            rate_limited: false,
        },
        kept.len(),
    )
    .terminal_eligible(terminal_eligible);

    for (index, node) in kept.iter().enumerate() {
        let payload = json!({
            "owner": owner,
            "repo_name": repo_name,
            "full_name": full_name,
            "pull_request": node,
        });
        let raw_id = ctx
            .raw
            .insert(
                envelope.tenant_id,
                integration.id,
                RawKind::PullRequest,
                &payload,
                node["id"].as_str(),
                ctx.clock.now(),
            )
            .await?;
        publish_transform(
            ctx,
            envelope,
            RawKind::PullRequest,
            raw_id,
            fan_out.child(index),
            RelayFlags {
                last_parent: envelope.relay.last_parent,
                last_parent_last_nested: false,
            },
        )
        .await?;
    }

    for continuation in
        plan_nested_continuations(&kept, envelope.relay.last_parent, effective_has_next)
    {
        publish_extraction(
            ctx,
            envelope,
            "pull_requests",
            ExtractSpec::NestedPage {
                owner: owner.to_string(),
                repo_name: repo_name.to_string(),
                full_name: full_name.to_string(),
                parent_external_id: continuation.parent_external_id,
                nested: continuation.kind,
                cursor: continuation.cursor,
            },
            ControlFlags::default(),
            RelayFlags {
                last_parent: envelope.relay.last_parent,
                last_parent_last_nested: continuation.last_parent_last_nested,
            },
        )
        .await?;
    }

    if effective_has_next {
        publish_extraction(
            ctx,
            envelope,
            "pull_requests",
            ExtractSpec::PullRequests {
                owner: owner.to_string(),
                repo_name: repo_name.to_string(),
                full_name: full_name.to_string(),
                pr_cursor: page.end_cursor.clone(),
            },
            ControlFlags::default(),
            envelope.relay,
        )
        .await?;
    }

    let mut checkpoint = Checkpoint {
        last_cursor: effective_has_next.then(|| page.end_cursor.clone()).flatten(),
        items_processed: kept.len() as i64,
        ..Checkpoint::default()
    };
    checkpoint.parent_context = Some(parent_context);
    ctx.jobs
        .save_checkpoint(envelope.tenant_id, job_id, &checkpoint)
        .await?;
    Ok(())
}

/// One continuation page of one nested edge collection.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn extract_nested_page(
    ctx: &Arc<EtlContext>,
    envelope: &Envelope,
    owner: &str,
    repo_name: &str,
    full_name: &str,
    parent_external_id: &str,
    kind: NestedKind,
    cursor: Option<&str>,
) -> EtlResult<()> {
    require_job(envelope)?;
    let integration = ctx.integration_for(envelope).await?;
    let client = ctx.repo_host_for(&integration)?;

    let page = match client.nested_page(parent_external_id, kind, cursor).await {
        Ok(page) => page,
        Err(ConnectError::RateLimited { reset_at, .. }) => {
            let mut checkpoint = Checkpoint::rate_limited(
                kind.as_str(),
                cursor.map(str::to_string),
                reset_at,
            );
            checkpoint.current_parent_external_id = Some(parent_external_id.to_string());
            checkpoint.parent_context = Some(ParentContext {
                owner: owner.to_string(),
                repo_name: repo_name.to_string(),
                full_name: full_name.to_string(),
            });
            checkpoint.nested_cursors.insert(
                kind.as_str().to_string(),
                NestedCursorState {
                    fetched: true,
                    has_next_page: true,
                    cursor: cursor.map(str::to_string),
                },
            );
            rate_limit_exit(ctx, envelope, RawKind::NestedPage, checkpoint).await?;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let payload = json!({
        "parent_external_id": parent_external_id,
        "owner": owner,
        "repo_name": repo_name,
        "full_name": full_name,
        "nested_kind": kind.as_str(),
        "nodes": page.nodes,
        "has_more": page.has_next_page,
    });
    let raw_id = ctx
        .raw
        .insert(
            envelope.tenant_id,
            integration.id,
            RawKind::NestedPage,
            &payload,
            Some(parent_external_id),
            ctx.clock.now(),
        )
        .await?;

    let terminal = nested_page_terminates(envelope.relay, page.has_next_page);
    publish_transform(
        ctx,
        envelope,
        RawKind::NestedPage,
        raw_id,
        ControlFlags {
            first_item: false,
            last_item: terminal,
            last_job_item: terminal,
            rate_limited: false,
        },
        envelope.relay,
    )
    .await?;

    if page.has_next_page {
        publish_extraction(
            ctx,
            envelope,
            "pull_requests",
            ExtractSpec::NestedPage {
                owner: owner.to_string(),
                repo_name: repo_name.to_string(),
                full_name: full_name.to_string(),
                parent_external_id: parent_external_id.to_string(),
                nested: kind,
                cursor: page.end_cursor,
            },
            ControlFlags::default(),
            envelope.relay,
        )
        .await?;
    }
    Ok(())
}

fn repo_external_id(repo: &Value) -> String {
    repo["node_id"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| repo["id"].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn pr(id: &str, updated: &str, nested_next: &[NestedKind]) -> Value {
        let mut node = json!({
            "id": id,
            "updatedAt": updated,
            "commits": { "pageInfo": { "hasNextPage": false, "endCursor": null } },
            "reviews": { "pageInfo": { "hasNextPage": false, "endCursor": null } },
            "comments": { "pageInfo": { "hasNextPage": false, "endCursor": null } },
            "reviewThreads": { "pageInfo": { "hasNextPage": false, "endCursor": null } },
        });
        for kind in nested_next {
            let field = match kind {
                NestedKind::Commits => "commits",
                NestedKind::Reviews => "reviews",
                NestedKind::Comments => "comments",
                NestedKind::ReviewThreads => "reviewThreads",
            };
            node[field]["pageInfo"]["hasNextPage"] = json!(true);
            node[field]["pageInfo"]["endCursor"] = json!(format!("{field}-cursor"));
        }
        node
    }

    #[test]
    fn filter_keeps_everything_without_a_boundary() {
        let nodes = vec![pr("a", "2025-06-01T00:00:00Z", &[])];
        let (kept, early) = filter_recent(nodes, None);
        assert_eq!(kept.len(), 1);
        assert!(!early);
    }

    #[test]
    fn filter_terminates_early_at_the_boundary() {
        let boundary = Utc.with_ymd_and_hms(2025, 5, 1, 0, 0, 0).unwrap();
        let nodes = vec![
            pr("new", "2025-06-01T00:00:00Z", &[]),
            pr("old", "2025-04-01T00:00:00Z", &[]),
            pr("older", "2025-03-01T00:00:00Z", &[]),
        ];
        let (kept, early) = filter_recent(nodes, Some(boundary));
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0]["id"], "new");
        assert!(early);
    }

    #[test]
    fn nested_plan_marks_exactly_one_terminal_branch() {
        let nodes = vec![
            pr("pr-1", "2025-06-02T00:00:00Z", &[NestedKind::Commits]),
            pr(
                "pr-2",
                "2025-06-01T00:00:00Z",
                &[NestedKind::Commits, NestedKind::Reviews],
            ),
        ];
        let plan = plan_nested_continuations(&nodes, true, false);
        assert_eq!(plan.len(), 3);
        let terminal: Vec<_> = plan.iter().filter(|c| c.last_parent_last_nested).collect();
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0].parent_external_id, "pr-2");
        assert_eq!(terminal[0].kind, NestedKind::Reviews);
    }

    #[test]
    fn nested_plan_defers_when_more_pr_pages_exist() {
        let nodes = vec![pr("pr-1", "2025-06-02T00:00:00Z", &[NestedKind::Commits])];
        let with_next = plan_nested_continuations(&nodes, true, true);
        assert!(with_next.iter().all(|c| !c.last_parent_last_nested));

        let not_last_parent = plan_nested_continuations(&nodes, false, false);
        assert!(not_last_parent.iter().all(|c| !c.last_parent_last_nested));
    }

    #[test]
    fn supplemental_names_drop_filter_matches_and_owners() {
        let linked = vec![
            "acme/billing-service".to_string(),
            "acme/health-api".to_string(),
            "acme/edge-proxy".to_string(),
        ];
        let filters = vec!["health-".to_string()];
        let names = supplemental_names(&linked, &filters);
        assert_eq!(names, vec!["billing-service".to_string(), "edge-proxy".to_string()]);
    }
}
