//! Issue-tracker transforms: projects, statuses, work items with
//! changelogs, dev-status links.
//!
//! Parsing is separated from I/O so the payload contracts are unit-testable;
//! the handlers run the upserts and the raw `completed` flip in one
//! transaction and fan out to embed after commit.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use pulse_core::{Clock, Envelope, EtlError, EtlResult};
use pulse_postgres::entities::{ChangelogRow, LinkRow, ProjectRow, ProjectStatusRow, WorkItemRow};
use pulse_postgres::raw::RawRecord;

use super::{parse_provider_datetime, payload_object, publish_embed_rows, require_integration};
use crate::context::EtlContext;

fn string_at(value: &Value, pointer: &str) -> Option<String> {
    value.pointer(pointer).and_then(Value::as_str).map(str::to_string)
}

pub(crate) fn parse_project(payload: &Value) -> EtlResult<ProjectRow> {
    let project = &payload["project"];
    let external_id = project["id"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| EtlError::Permanent("project payload missing id".into()))?;
    let key = project["key"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| EtlError::Permanent("project payload missing key".into()))?;
    Ok(ProjectRow {
        external_id,
        name: project["name"].as_str().unwrap_or(&key).to_string(),
        key,
        description: project["description"].as_str().map(str::to_string),
    })
}

pub(crate) fn parse_project_statuses(payload: &Value) -> EtlResult<Vec<ProjectStatusRow>> {
    let project_key = payload["project_key"].as_str().map(str::to_string);
    let statuses = payload["statuses"]
        .as_array()
        .ok_or_else(|| EtlError::Permanent("statuses payload missing array".into()))?;

    let mut rows = Vec::new();
    for status_group in statuses {
        // The provider nests statuses under each work-item type.
        let nested = status_group["statuses"].as_array();
        let flat = [status_group.clone()];
        let items: &[Value] = nested.map(|v| v.as_slice()).unwrap_or(&flat);
        for status in items {
            let Some(external_id) = status["id"].as_str() else {
                continue;
            };
            rows.push(ProjectStatusRow {
                external_id: external_id.to_string(),
                project_external_id: project_key.clone(),
                name: status["name"].as_str().unwrap_or_default().to_string(),
                category: string_at(status, "/statusCategory/name"),
            });
        }
    }
    // Distinct statuses can repeat across work-item types.
    rows.sort_by(|a, b| a.external_id.cmp(&b.external_id));
    rows.dedup_by(|a, b| a.external_id == b.external_id);
    Ok(rows)
}

pub(crate) fn parse_work_item(payload: &Value) -> EtlResult<(WorkItemRow, Vec<ChangelogRow>)> {
    let external_id = payload["id"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| EtlError::Permanent("work item payload missing id".into()))?;
    let key = payload["key"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| EtlError::Permanent("work item payload missing key".into()))?;
    let fields = &payload["fields"];

    let mut changelogs = Vec::new();
    let mut code_changed = false;
    if let Some(histories) = payload.pointer("/changelog/histories").and_then(Value::as_array) {
        for history in histories {
            let history_id = history["id"].as_str().unwrap_or_default();
            let author = string_at(history, "/author/displayName");
            let changed_at = history["created"]
                .as_str()
                .and_then(parse_provider_datetime);
            let items = history["items"].as_array().cloned().unwrap_or_default();
            for (index, item) in items.iter().enumerate() {
                let field = item["field"].as_str().unwrap_or_default().to_string();
                if field == "development" {
                    code_changed = true;
                }
                changelogs.push(ChangelogRow {
                    external_id: format!("{history_id}:{index}"),
                    work_item_external_id: external_id.clone(),
                    field,
                    from_value: item["fromString"].as_str().map(str::to_string),
                    to_value: item["toString"].as_str().map(str::to_string),
                    author: author.clone(),
                    changed_at,
                });
            }
        }
    }

    let row = WorkItemRow {
        external_id,
        project_external_id: string_at(fields, "/project/id"),
        key,
        title: fields["summary"].as_str().unwrap_or_default().to_string(),
        body: fields["description"].as_str().map(str::to_string),
        item_type: string_at(fields, "/issuetype/name"),
        status: string_at(fields, "/status/name"),
        assignee: string_at(fields, "/assignee/displayName"),
        code_changed,
        item_created_at: fields["created"].as_str().and_then(parse_provider_datetime),
        item_updated_at: fields["updated"].as_str().and_then(parse_provider_datetime),
    };
    Ok((row, changelogs))
}

pub(crate) fn parse_dev_status(payload: &Value) -> EtlResult<Vec<LinkRow>> {
    let work_item_external_id = payload["work_item_external_id"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| EtlError::Permanent("dev-status payload missing work item id".into()))?;

    let mut links = Vec::new();
    if let Some(details) = payload.pointer("/detail/detail").and_then(Value::as_array) {
        collect_links(&work_item_external_id, details, &mut links);
    } else if let Some(details) = payload["detail"].as_array() {
        collect_links(&work_item_external_id, details, &mut links);
    }
    links.sort_by(|a, b| {
        (&a.repo_external_id, a.pr_number).cmp(&(&b.repo_external_id, b.pr_number))
    });
    links.dedup_by(|a, b| a.repo_external_id == b.repo_external_id && a.pr_number == b.pr_number);
    Ok(links)
}

fn collect_links(work_item_external_id: &str, details: &[Value], out: &mut Vec<LinkRow>) {
    for detail in details {
        let Some(pull_requests) = detail["pullRequests"].as_array() else {
            continue;
        };
        for pr in pull_requests {
            // PR ids arrive as "#<number>".
            let Some(number) = pr["id"]
                .as_str()
                .map(|id| id.trim_start_matches('#'))
                .and_then(|id| id.parse::<i32>().ok())
            else {
                continue;
            };
            let Some(repo_external_id) = pr["repositoryId"]
                .as_str()
                .or_else(|| pr["repositoryName"].as_str())
            else {
                continue;
            };
            out.push(LinkRow {
                work_item_external_id: work_item_external_id.to_string(),
                repo_external_id: repo_external_id.to_string(),
                pr_number: number,
            });
        }
    }
}

pub(crate) async fn transform_project(
    ctx: &Arc<EtlContext>,
    envelope: &Envelope,
    record: &RawRecord,
) -> EtlResult<()> {
    let integration_id = require_integration(envelope)?;
    let row = parse_project(payload_object(record)?)?;
    let now = ctx.clock.now();

    let mut tx = ctx.entities.begin().await?;
    ctx.entities
        .upsert_project(&mut tx, envelope.tenant_id, integration_id, &row, now)
        .await?;
    ctx.raw
        .mark_completed_tx(&mut tx, envelope.tenant_id, record.id, now)
        .await?;
    tx.commit().await.map_err(pulse_postgres::StoreError::from)?;

    publish_embed_rows(ctx, envelope, &[("projects", row.external_id)]).await
}

pub(crate) async fn transform_project_statuses(
    ctx: &Arc<EtlContext>,
    envelope: &Envelope,
    record: &RawRecord,
) -> EtlResult<()> {
    let integration_id = require_integration(envelope)?;
    let rows = parse_project_statuses(payload_object(record)?)?;
    let now = ctx.clock.now();

    let mut tx = ctx.entities.begin().await?;
    for row in &rows {
        ctx.entities
            .upsert_project_status(&mut tx, envelope.tenant_id, integration_id, row, now)
            .await?;
    }
    ctx.raw
        .mark_completed_tx(&mut tx, envelope.tenant_id, record.id, now)
        .await?;
    tx.commit().await.map_err(pulse_postgres::StoreError::from)?;

    let embeds: Vec<(&str, String)> = rows
        .iter()
        .map(|row| ("project_statuses", row.external_id.clone()))
        .collect();
    publish_embed_rows(ctx, envelope, &embeds).await
}

pub(crate) async fn transform_work_item(
    ctx: &Arc<EtlContext>,
    envelope: &Envelope,
    record: &RawRecord,
) -> EtlResult<()> {
    let integration_id = require_integration(envelope)?;
    let (row, changelogs) = parse_work_item(payload_object(record)?)?;
    let now = ctx.clock.now();
    debug!(
        work_item = %row.key,
        changelogs = changelogs.len(),
        "Transforming work item"
    );

    let mut tx = ctx.entities.begin().await?;
    // Parent before children.
    ctx.entities
        .upsert_work_item(&mut tx, envelope.tenant_id, integration_id, &row, now)
        .await?;
    for changelog in &changelogs {
        ctx.entities
            .upsert_changelog(&mut tx, envelope.tenant_id, integration_id, changelog, now)
            .await?;
    }
    ctx.raw
        .mark_completed_tx(&mut tx, envelope.tenant_id, record.id, now)
        .await?;
    tx.commit().await.map_err(pulse_postgres::StoreError::from)?;

    // Changelog entries fold into the work item's canonical text; one embed
    // message per work item.
    publish_embed_rows(ctx, envelope, &[("work_items", row.external_id)]).await
}

pub(crate) async fn transform_dev_status(
    ctx: &Arc<EtlContext>,
    envelope: &Envelope,
    record: &RawRecord,
) -> EtlResult<()> {
    let integration_id = require_integration(envelope)?;
    let links = parse_dev_status(payload_object(record)?)?;
    let now = ctx.clock.now();

    let mut tx = ctx.entities.begin().await?;
    for link in &links {
        ctx.entities
            .upsert_link(&mut tx, envelope.tenant_id, integration_id, link, now)
            .await?;
    }
    ctx.raw
        .mark_completed_tx(&mut tx, envelope.tenant_id, record.id, now)
        .await?;
    tx.commit().await.map_err(pulse_postgres::StoreError::from)?;

    let embeds: Vec<(&str, String)> = links
        .iter()
        .map(|link| {
            (
                "work_item_pr_links",
                format!(
                    "{}:{}:{}",
                    link.work_item_external_id, link.repo_external_id, link.pr_number
                ),
            )
        })
        .collect();
    publish_embed_rows(ctx, envelope, &embeds).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn work_item_parse_pulls_fields_and_changelogs() {
        let payload = json!({
            "id": "10042",
            "key": "CORE-7",
            "fields": {
                "summary": "Importer drops trailing comments",
                "description": "Steps to reproduce...",
                "issuetype": { "name": "Bug" },
                "status": { "name": "In Progress" },
                "assignee": { "displayName": "R. Alvarez" },
                "project": { "id": "900" },
                "created": "2025-05-20T09:00:00.000+0000",
                "updated": "2025-06-01T10:30:00.000+0000"
            },
            "changelog": {
                "histories": [
                    {
                        "id": "h1",
                        "author": { "displayName": "R. Alvarez" },
                        "created": "2025-05-21T08:00:00.000+0000",
                        "items": [
                            { "field": "status", "fromString": "To Do", "toString": "In Progress" },
                            { "field": "development", "fromString": null, "toString": "1 commit" }
                        ]
                    }
                ]
            }
        });

        let (row, changelogs) = parse_work_item(&payload).unwrap();
        assert_eq!(row.key, "CORE-7");
        assert_eq!(row.title, "Importer drops trailing comments");
        assert_eq!(row.item_type.as_deref(), Some("Bug"));
        assert!(row.code_changed);
        assert_eq!(changelogs.len(), 2);
        assert_eq!(changelogs[0].external_id, "h1:0");
        assert_eq!(changelogs[0].to_value.as_deref(), Some("In Progress"));
        assert_eq!(changelogs[1].field, "development");
    }

    #[test]
    fn work_item_without_changelog_is_not_code_changed() {
        let payload = json!({
            "id": "10043",
            "key": "CORE-8",
            "fields": { "summary": "Docs" }
        });
        let (row, changelogs) = parse_work_item(&payload).unwrap();
        assert!(!row.code_changed);
        assert!(changelogs.is_empty());
    }

    #[test]
    fn malformed_work_item_is_a_permanent_error() {
        let err = parse_work_item(&json!({ "fields": {} })).unwrap_err();
        assert!(err.is_permanent());
    }

    #[test]
    fn dev_status_links_parse_and_dedup() {
        let payload = json!({
            "work_item_external_id": "10042",
            "detail": {
                "detail": [
                    {
                        "pullRequests": [
                            { "id": "#41", "repositoryId": "R_1", "repositoryName": "acme/edge-proxy" },
                            { "id": "#41", "repositoryId": "R_1" },
                            { "id": "#7", "repositoryName": "acme/billing" }
                        ]
                    }
                ]
            }
        });
        let links = parse_dev_status(&payload).unwrap();
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].repo_external_id, "R_1");
        assert_eq!(links[0].pr_number, 41);
        assert_eq!(links[1].repo_external_id, "acme/billing");
        assert_eq!(links[1].pr_number, 7);
    }

    #[test]
    fn statuses_parse_flattens_and_dedups_across_types() {
        let payload = json!({
            "project_key": "CORE",
            "statuses": [
                {
                    "name": "Bug",
                    "statuses": [
                        { "id": "1", "name": "To Do", "statusCategory": { "name": "To Do" } },
                        { "id": "3", "name": "Done", "statusCategory": { "name": "Done" } }
                    ]
                },
                {
                    "name": "Task",
                    "statuses": [
                        { "id": "1", "name": "To Do", "statusCategory": { "name": "To Do" } }
                    ]
                }
            ]
        });
        let rows = parse_project_statuses(&payload).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].external_id, "1");
        assert_eq!(rows[0].project_external_id.as_deref(), Some("CORE"));
    }
}
