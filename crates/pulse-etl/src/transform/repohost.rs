//! Repo-host transforms: repositories, pull requests with nested edges,
//! nested continuation pages.
//!
//! A pull-request message upserts the parent row before any of its nested
//! children. Nested pages arriving as their own raw records key off the
//! parent's external id; an absent parent is skipped with a warning and the
//! payload kept for replay.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use pulse_core::{Clock, Envelope, EtlError, EtlResult, NestedKind};
use pulse_postgres::entities::{
    CommitRow, PrMetrics, PullRequestRow, RepositoryRow, ReviewCommentRow, ReviewRow,
};
use pulse_postgres::raw::RawRecord;

use super::{parse_provider_datetime, payload_object, publish_embed_rows, require_integration};
use crate::context::EtlContext;

/// Metrics computed from the arrays visible in the current message. Later
/// nested pages re-upsert the row, so the values are eventually consistent.
pub(crate) fn pr_metrics(commits: &[CommitRow], reviews: &[ReviewRow]) -> PrMetrics {
    let first_review_at = reviews.iter().filter_map(|r| r.submitted_at).min();
    let rework_commit_count = match first_review_at {
        Some(first_review) => commits
            .iter()
            .filter(|c| c.authored_at.map(|t| t > first_review).unwrap_or(false))
            .count() as i32,
        None => 0,
    };
    let mut authors: Vec<&str> = commits
        .iter()
        .filter_map(|c| c.author.as_deref())
        .collect();
    authors.sort_unstable();
    authors.dedup();

    PrMetrics {
        commit_count: commits.len() as i32,
        author_count: authors.len() as i32,
        first_review_at,
        rework_commit_count,
        review_cycles: reviews
            .iter()
            .filter(|r| r.state.as_deref() == Some("CHANGES_REQUESTED"))
            .count() as i32,
    }
}

#[derive(Debug)]
pub(crate) struct ParsedPullRequest {
    pub external_id: String,
    pub number: i32,
    pub title: String,
    pub body: Option<String>,
    pub state: Option<String>,
    pub author: Option<String>,
    pub pr_created_at: Option<chrono::DateTime<chrono::Utc>>,
    pub pr_updated_at: Option<chrono::DateTime<chrono::Utc>>,
    pub merged_at: Option<chrono::DateTime<chrono::Utc>>,
    pub commits: Vec<CommitRow>,
    pub reviews: Vec<ReviewRow>,
    pub comments: Vec<ReviewCommentRow>,
}

pub(crate) fn parse_pull_request(node: &Value) -> EtlResult<ParsedPullRequest> {
    let external_id = node["id"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| EtlError::Permanent("pull request payload missing id".into()))?;
    let number = node["number"]
        .as_i64()
        .ok_or_else(|| EtlError::Permanent("pull request payload missing number".into()))?
        as i32;

    let commits = parse_commits(&external_id, nodes_of(node, "commits"));
    let reviews = parse_reviews(&external_id, nodes_of(node, "reviews"));
    let mut comments = parse_comments(&external_id, nodes_of(node, "comments"));
    comments.extend(parse_thread_comments(&external_id, nodes_of(node, "reviewThreads")));

    Ok(ParsedPullRequest {
        number,
        title: node["title"].as_str().unwrap_or_default().to_string(),
        body: node["body"].as_str().map(str::to_string),
        state: node["state"].as_str().map(str::to_string),
        author: node.pointer("/author/login").and_then(Value::as_str).map(str::to_string),
        pr_created_at: node["createdAt"].as_str().and_then(parse_provider_datetime),
        pr_updated_at: node["updatedAt"].as_str().and_then(parse_provider_datetime),
        merged_at: node["mergedAt"].as_str().and_then(parse_provider_datetime),
        commits,
        reviews,
        comments,
        external_id,
    })
}

fn nodes_of<'a>(node: &'a Value, field: &str) -> &'a [Value] {
    node.pointer(&format!("/{field}/nodes"))
        .and_then(Value::as_array)
        .map(|v| v.as_slice())
        .unwrap_or(&[])
}

pub(crate) fn parse_commits(pr_external_id: &str, nodes: &[Value]) -> Vec<CommitRow> {
    nodes
        .iter()
        .filter_map(|node| {
            let commit = &node["commit"];
            let oid = commit["oid"].as_str()?;
            Some(CommitRow {
                external_id: oid.to_string(),
                pr_external_id: pr_external_id.to_string(),
                message: commit["message"].as_str().unwrap_or_default().to_string(),
                author: commit
                    .pointer("/author/name")
                    .or_else(|| commit.pointer("/author/email"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                authored_at: commit["authoredDate"].as_str().and_then(parse_provider_datetime),
            })
        })
        .collect()
}

pub(crate) fn parse_reviews(pr_external_id: &str, nodes: &[Value]) -> Vec<ReviewRow> {
    nodes
        .iter()
        .filter_map(|node| {
            let id = node["id"].as_str()?;
            Some(ReviewRow {
                external_id: id.to_string(),
                pr_external_id: pr_external_id.to_string(),
                state: node["state"].as_str().map(str::to_string),
                body: node["body"].as_str().map(str::to_string),
                author: node.pointer("/author/login").and_then(Value::as_str).map(str::to_string),
                submitted_at: node["submittedAt"].as_str().and_then(parse_provider_datetime),
            })
        })
        .collect()
}

pub(crate) fn parse_comments(pr_external_id: &str, nodes: &[Value]) -> Vec<ReviewCommentRow> {
    nodes
        .iter()
        .filter_map(|node| {
            let id = node["id"].as_str()?;
            Some(ReviewCommentRow {
                external_id: id.to_string(),
                pr_external_id: pr_external_id.to_string(),
                body: node["body"].as_str().unwrap_or_default().to_string(),
                author: node.pointer("/author/login").and_then(Value::as_str).map(str::to_string),
                comment_created_at: node["createdAt"].as_str().and_then(parse_provider_datetime),
            })
        })
        .collect()
}

/// Review-thread comments are stored alongside plain comments.
pub(crate) fn parse_thread_comments(pr_external_id: &str, threads: &[Value]) -> Vec<ReviewCommentRow> {
    threads
        .iter()
        .flat_map(|thread| parse_comments(pr_external_id, nodes_of(thread, "comments")))
        .collect()
}

pub(crate) async fn transform_repository(
    ctx: &Arc<EtlContext>,
    envelope: &Envelope,
    record: &RawRecord,
) -> EtlResult<()> {
    let integration_id = require_integration(envelope)?;
    let repo = &payload_object(record)?["repository"];
    let external_id = repo["node_id"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| repo["id"].to_string());
    let name = repo["name"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| EtlError::Permanent("repository payload missing name".into()))?;
    let row = RepositoryRow {
        external_id: external_id.clone(),
        full_name: repo["full_name"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| name.clone()),
        name,
        description: repo["description"].as_str().map(str::to_string),
        default_branch: repo["default_branch"].as_str().map(str::to_string),
        pushed_at: repo["pushed_at"].as_str().and_then(parse_provider_datetime),
    };

    let now = ctx.clock.now();
    let mut tx = ctx.entities.begin().await?;
    ctx.entities
        .upsert_repository(&mut tx, envelope.tenant_id, integration_id, &row, now)
        .await?;
    ctx.raw
        .mark_completed_tx(&mut tx, envelope.tenant_id, record.id, now)
        .await?;
    tx.commit().await.map_err(pulse_postgres::StoreError::from)?;

    publish_embed_rows(ctx, envelope, &[("repositories", external_id)]).await
}

pub(crate) async fn transform_pull_request(
    ctx: &Arc<EtlContext>,
    envelope: &Envelope,
    record: &RawRecord,
) -> EtlResult<()> {
    let integration_id = require_integration(envelope)?;
    let payload = payload_object(record)?;
    let full_name = payload["full_name"]
        .as_str()
        .ok_or_else(|| EtlError::Permanent("pull request payload missing full_name".into()))?;
    let parsed = parse_pull_request(&payload["pull_request"])?;

    let Some((_, repo_external_id)) = ctx
        .entities
        .repository_by_full_name(envelope.tenant_id, full_name)
        .await?
    else {
        return Err(EtlError::Permanent(format!(
            "repository {full_name} not found for pull request {}",
            parsed.external_id
        )));
    };

    let metrics = pr_metrics(&parsed.commits, &parsed.reviews);
    let row = PullRequestRow {
        external_id: parsed.external_id.clone(),
        repo_external_id,
        number: parsed.number,
        title: parsed.title.clone(),
        body: parsed.body.clone(),
        state: parsed.state.clone(),
        author: parsed.author.clone(),
        pr_created_at: parsed.pr_created_at,
        pr_updated_at: parsed.pr_updated_at,
        merged_at: parsed.merged_at,
        metrics,
    };
    debug!(
        pr = %row.external_id,
        commits = parsed.commits.len(),
        reviews = parsed.reviews.len(),
        comments = parsed.comments.len(),
        "Transforming pull request"
    );

    let now = ctx.clock.now();
    let mut tx = ctx.entities.begin().await?;
    // Parent before children.
    ctx.entities
        .upsert_pull_request(&mut tx, envelope.tenant_id, integration_id, &row, now)
        .await?;
    for commit in &parsed.commits {
        ctx.entities
            .upsert_commit(&mut tx, envelope.tenant_id, integration_id, commit, now)
            .await?;
    }
    for review in &parsed.reviews {
        ctx.entities
            .upsert_review(&mut tx, envelope.tenant_id, integration_id, review, now)
            .await?;
    }
    for comment in &parsed.comments {
        ctx.entities
            .upsert_review_comment(&mut tx, envelope.tenant_id, integration_id, comment, now)
            .await?;
    }
    ctx.raw
        .mark_completed_tx(&mut tx, envelope.tenant_id, record.id, now)
        .await?;
    tx.commit().await.map_err(pulse_postgres::StoreError::from)?;

    let mut embeds: Vec<(&str, String)> =
        vec![("pull_requests", parsed.external_id.clone())];
    embeds.extend(parsed.commits.iter().map(|c| ("pr_commits", c.external_id.clone())));
    embeds.extend(parsed.reviews.iter().map(|r| ("pr_reviews", r.external_id.clone())));
    embeds.extend(
        parsed
            .comments
            .iter()
            .map(|c| ("pr_review_comments", c.external_id.clone())),
    );
    publish_embed_rows(ctx, envelope, &embeds).await
}

pub(crate) async fn transform_nested_page(
    ctx: &Arc<EtlContext>,
    envelope: &Envelope,
    record: &RawRecord,
) -> EtlResult<()> {
    let integration_id = require_integration(envelope)?;
    let payload = payload_object(record)?;
    let parent_external_id = payload["parent_external_id"]
        .as_str()
        .ok_or_else(|| EtlError::Permanent("nested payload missing parent id".into()))?;
    let kind_str = payload["nested_kind"].as_str().unwrap_or_default();
    let nodes = payload["nodes"].as_array().cloned().unwrap_or_default();

    if !ctx
        .entities
        .pull_request_exists(envelope.tenant_id, parent_external_id)
        .await?
    {
        warn!(
            parent = parent_external_id,
            "Parent pull request not transformed yet; skipping nested page"
        );
        return Err(EtlError::Permanent(format!(
            "pull request {parent_external_id} not found for nested {kind_str} page"
        )));
    }

    let now = ctx.clock.now();
    let mut tx = ctx.entities.begin().await?;
    let embeds: Vec<(&str, String)> = match kind_str {
        k if k == NestedKind::Commits.as_str() => {
            let rows = parse_commits(parent_external_id, &nodes);
            for row in &rows {
                ctx.entities
                    .upsert_commit(&mut tx, envelope.tenant_id, integration_id, row, now)
                    .await?;
            }
            rows.iter().map(|r| ("pr_commits", r.external_id.clone())).collect()
        }
        k if k == NestedKind::Reviews.as_str() => {
            let rows = parse_reviews(parent_external_id, &nodes);
            for row in &rows {
                ctx.entities
                    .upsert_review(&mut tx, envelope.tenant_id, integration_id, row, now)
                    .await?;
            }
            rows.iter().map(|r| ("pr_reviews", r.external_id.clone())).collect()
        }
        k if k == NestedKind::Comments.as_str() => {
            let rows = parse_comments(parent_external_id, &nodes);
            for row in &rows {
                ctx.entities
                    .upsert_review_comment(&mut tx, envelope.tenant_id, integration_id, row, now)
                    .await?;
            }
            rows.iter()
                .map(|r| ("pr_review_comments", r.external_id.clone()))
                .collect()
        }
        k if k == NestedKind::ReviewThreads.as_str() => {
            let rows = parse_thread_comments(parent_external_id, &nodes);
            for row in &rows {
                ctx.entities
                    .upsert_review_comment(&mut tx, envelope.tenant_id, integration_id, row, now)
                    .await?;
            }
            rows.iter()
                .map(|r| ("pr_review_comments", r.external_id.clone()))
                .collect()
        }
        other => {
            return Err(EtlError::Permanent(format!(
                "unknown nested kind {other:?}"
            )))
        }
    };
    ctx.raw
        .mark_completed_tx(&mut tx, envelope.tenant_id, record.id, now)
        .await?;
    tx.commit().await.map_err(pulse_postgres::StoreError::from)?;

    publish_embed_rows(ctx, envelope, &embeds).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn commit(oid: &str, author: &str, authored: &str) -> Value {
        json!({
            "commit": {
                "oid": oid,
                "message": format!("commit {oid}"),
                "authoredDate": authored,
                "author": { "name": author }
            }
        })
    }

    fn review(id: &str, state: &str, submitted: &str) -> Value {
        json!({
            "id": id,
            "state": state,
            "body": "looks close",
            "submittedAt": submitted,
            "author": { "login": "reviewer" }
        })
    }

    #[test]
    fn metrics_count_rework_after_the_first_review() {
        let pr_id = "PR_1";
        let commits = parse_commits(
            pr_id,
            &[
                commit("a1", "ana", "2025-06-01T08:00:00Z"),
                commit("b2", "ben", "2025-06-01T12:00:00Z"),
                commit("c3", "ana", "2025-06-02T09:00:00Z"),
            ],
        );
        let reviews = parse_reviews(
            pr_id,
            &[
                review("r1", "CHANGES_REQUESTED", "2025-06-01T10:00:00Z"),
                review("r2", "APPROVED", "2025-06-02T10:00:00Z"),
            ],
        );
        let metrics = pr_metrics(&commits, &reviews);
        assert_eq!(metrics.commit_count, 3);
        assert_eq!(metrics.author_count, 2);
        assert_eq!(metrics.rework_commit_count, 2);
        assert_eq!(metrics.review_cycles, 1);
        assert_eq!(
            metrics.first_review_at.unwrap(),
            Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap()
        );
    }

    #[test]
    fn metrics_without_reviews_have_no_rework() {
        let commits = parse_commits("PR_1", &[commit("a1", "ana", "2025-06-01T08:00:00Z")]);
        let metrics = pr_metrics(&commits, &[]);
        assert_eq!(metrics.rework_commit_count, 0);
        assert!(metrics.first_review_at.is_none());
    }

    #[test]
    fn pull_request_parse_collects_all_nested_arrays() {
        let node = json!({
            "id": "PR_9",
            "number": 42,
            "title": "Stream large uploads",
            "body": "Switches to chunked transfer.",
            "state": "MERGED",
            "createdAt": "2025-05-30T09:00:00Z",
            "updatedAt": "2025-06-01T10:00:00Z",
            "mergedAt": "2025-06-01T10:00:00Z",
            "author": { "login": "ana" },
            "commits": { "nodes": [commit("a1", "ana", "2025-05-30T10:00:00Z")] },
            "reviews": { "nodes": [review("r1", "APPROVED", "2025-05-31T10:00:00Z")] },
            "comments": { "nodes": [ { "id": "c1", "body": "nice", "createdAt": "2025-05-31T11:00:00Z" } ] },
            "reviewThreads": { "nodes": [
                { "comments": { "nodes": [ { "id": "tc1", "body": "nit", "createdAt": "2025-05-31T12:00:00Z" } ] } }
            ] }
        });
        let parsed = parse_pull_request(&node).unwrap();
        assert_eq!(parsed.external_id, "PR_9");
        assert_eq!(parsed.number, 42);
        assert_eq!(parsed.commits.len(), 1);
        assert_eq!(parsed.reviews.len(), 1);
        // Thread comments land with the plain comments.
        assert_eq!(parsed.comments.len(), 2);
        assert_eq!(parsed.comments[1].external_id, "tc1");
    }

    #[test]
    fn pull_request_without_id_is_permanent() {
        assert!(parse_pull_request(&json!({ "number": 3 })).unwrap_err().is_permanent());
    }
}
