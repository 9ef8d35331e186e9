//! Normalized-entity upserts and lookups.
//!
//! Conflict key is `(tenant_id, external_id)` on every table (plus the link
//! table's composite key); resolution is last-writer-wins on the non-key
//! columns. Out-of-order arrivals are tolerated through
//! look-up-by-external-id.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use crate::error::StoreError;

/// Tables whose rows can be located for embedding.
pub const EMBEDDABLE_TABLES: &[&str] = &[
    "projects",
    "project_statuses",
    "work_items",
    "repositories",
    "pull_requests",
    "pr_commits",
    "pr_reviews",
    "pr_review_comments",
    "work_item_pr_links",
];

/// Mapping tables eligible for bulk re-embedding.
pub const MAPPING_TABLES: &[&str] = &[
    "wit_hierarchies",
    "wit_mappings",
    "status_mappings",
    "workflows",
];

#[derive(Debug, Clone)]
pub struct ProjectRow {
    pub external_id: String,
    pub key: String,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProjectStatusRow {
    pub external_id: String,
    pub project_external_id: Option<String>,
    pub name: String,
    pub category: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WorkItemRow {
    pub external_id: String,
    pub project_external_id: Option<String>,
    pub key: String,
    pub title: String,
    pub body: Option<String>,
    pub item_type: Option<String>,
    pub status: Option<String>,
    pub assignee: Option<String>,
    pub code_changed: bool,
    pub item_created_at: Option<DateTime<Utc>>,
    pub item_updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ChangelogRow {
    pub external_id: String,
    pub work_item_external_id: String,
    pub field: String,
    pub from_value: Option<String>,
    pub to_value: Option<String>,
    pub author: Option<String>,
    pub changed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct RepositoryRow {
    pub external_id: String,
    pub name: String,
    pub full_name: String,
    pub description: Option<String>,
    pub default_branch: Option<String>,
    pub pushed_at: Option<DateTime<Utc>>,
}

/// Metrics derived from the arrays visible in the current message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrMetrics {
    pub commit_count: i32,
    pub author_count: i32,
    pub first_review_at: Option<DateTime<Utc>>,
    pub rework_commit_count: i32,
    pub review_cycles: i32,
}

#[derive(Debug, Clone)]
pub struct PullRequestRow {
    pub external_id: String,
    pub repo_external_id: String,
    pub number: i32,
    pub title: String,
    pub body: Option<String>,
    pub state: Option<String>,
    pub author: Option<String>,
    pub pr_created_at: Option<DateTime<Utc>>,
    pub pr_updated_at: Option<DateTime<Utc>>,
    pub merged_at: Option<DateTime<Utc>>,
    pub metrics: PrMetrics,
}

#[derive(Debug, Clone)]
pub struct CommitRow {
    pub external_id: String,
    pub pr_external_id: String,
    pub message: String,
    pub author: Option<String>,
    pub authored_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ReviewRow {
    pub external_id: String,
    pub pr_external_id: String,
    pub state: Option<String>,
    pub body: Option<String>,
    pub author: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ReviewCommentRow {
    pub external_id: String,
    pub pr_external_id: String,
    pub body: String,
    pub author: Option<String>,
    pub comment_created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct LinkRow {
    pub work_item_external_id: String,
    pub repo_external_id: String,
    pub pr_number: i32,
}

/// The pieces of a normalized row the embed stage projects into canonical
/// text.
#[derive(Debug, Clone)]
pub enum SourceRow {
    Project {
        key: String,
        name: String,
        description: Option<String>,
    },
    ProjectStatus {
        name: String,
        category: Option<String>,
    },
    WorkItem {
        key: String,
        title: String,
        body: Option<String>,
        item_type: Option<String>,
        status: Option<String>,
    },
    Repository {
        name: String,
        full_name: String,
        description: Option<String>,
    },
    PullRequest {
        number: i32,
        title: String,
        body: Option<String>,
    },
    Commit {
        message: String,
        author: Option<String>,
    },
    Review {
        state: Option<String>,
        body: Option<String>,
    },
    ReviewComment {
        body: String,
    },
    Link {
        work_item_external_id: String,
        repo_external_id: String,
        pr_number: i32,
    },
    Mapping {
        label: String,
    },
}

pub struct EntityRepository {
    pool: PgPool,
}

impl EntityRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open the transaction one transform message's upserts run in.
    pub async fn begin(&self) -> Result<sqlx::Transaction<'_, sqlx::Postgres>, StoreError> {
        Ok(self.pool.begin().await?)
    }

    pub async fn upsert_project(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        tenant_id: i64,
        integration_id: i64,
        row: &ProjectRow,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO projects
                (tenant_id, integration_id, external_id, key, name, description,
                 active, created_at, last_updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, TRUE, $7, $7)
            ON CONFLICT (tenant_id, external_id)
            DO UPDATE SET key = EXCLUDED.key,
                          name = EXCLUDED.name,
                          description = EXCLUDED.description,
                          active = TRUE,
                          last_updated_at = EXCLUDED.last_updated_at
            "#,
        )
        .bind(tenant_id)
        .bind(integration_id)
        .bind(&row.external_id)
        .bind(&row.key)
        .bind(&row.name)
        .bind(&row.description)
        .bind(now)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn upsert_project_status(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        tenant_id: i64,
        integration_id: i64,
        row: &ProjectStatusRow,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO project_statuses
                (tenant_id, integration_id, external_id, project_external_id, name,
                 category, active, created_at, last_updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, TRUE, $7, $7)
            ON CONFLICT (tenant_id, external_id)
            DO UPDATE SET project_external_id = EXCLUDED.project_external_id,
                          name = EXCLUDED.name,
                          category = EXCLUDED.category,
                          active = TRUE,
                          last_updated_at = EXCLUDED.last_updated_at
            "#,
        )
        .bind(tenant_id)
        .bind(integration_id)
        .bind(&row.external_id)
        .bind(&row.project_external_id)
        .bind(&row.name)
        .bind(&row.category)
        .bind(now)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn upsert_work_item(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        tenant_id: i64,
        integration_id: i64,
        row: &WorkItemRow,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO work_items
                (tenant_id, integration_id, external_id, project_external_id, key,
                 title, body, item_type, status, assignee, code_changed,
                 item_created_at, item_updated_at, active, created_at, last_updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, TRUE, $14, $14)
            ON CONFLICT (tenant_id, external_id)
            DO UPDATE SET project_external_id = EXCLUDED.project_external_id,
                          key = EXCLUDED.key,
                          title = EXCLUDED.title,
                          body = EXCLUDED.body,
                          item_type = EXCLUDED.item_type,
                          status = EXCLUDED.status,
                          assignee = EXCLUDED.assignee,
                          code_changed = EXCLUDED.code_changed,
                          item_created_at = EXCLUDED.item_created_at,
                          item_updated_at = EXCLUDED.item_updated_at,
                          active = TRUE,
                          last_updated_at = EXCLUDED.last_updated_at
            "#,
        )
        .bind(tenant_id)
        .bind(integration_id)
        .bind(&row.external_id)
        .bind(&row.project_external_id)
        .bind(&row.key)
        .bind(&row.title)
        .bind(&row.body)
        .bind(&row.item_type)
        .bind(&row.status)
        .bind(&row.assignee)
        .bind(row.code_changed)
        .bind(row.item_created_at)
        .bind(row.item_updated_at)
        .bind(now)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn upsert_changelog(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        tenant_id: i64,
        integration_id: i64,
        row: &ChangelogRow,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO work_item_changelogs
                (tenant_id, integration_id, external_id, work_item_external_id,
                 field, from_value, to_value, author, changed_at,
                 active, created_at, last_updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, TRUE, $10, $10)
            ON CONFLICT (tenant_id, external_id)
            DO UPDATE SET field = EXCLUDED.field,
                          from_value = EXCLUDED.from_value,
                          to_value = EXCLUDED.to_value,
                          author = EXCLUDED.author,
                          changed_at = EXCLUDED.changed_at,
                          active = TRUE,
                          last_updated_at = EXCLUDED.last_updated_at
            "#,
        )
        .bind(tenant_id)
        .bind(integration_id)
        .bind(&row.external_id)
        .bind(&row.work_item_external_id)
        .bind(&row.field)
        .bind(&row.from_value)
        .bind(&row.to_value)
        .bind(&row.author)
        .bind(row.changed_at)
        .bind(now)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn upsert_repository(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        tenant_id: i64,
        integration_id: i64,
        row: &RepositoryRow,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO repositories
                (tenant_id, integration_id, external_id, name, full_name, description,
                 default_branch, pushed_at, active, created_at, last_updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, TRUE, $9, $9)
            ON CONFLICT (tenant_id, external_id)
            DO UPDATE SET name = EXCLUDED.name,
                          full_name = EXCLUDED.full_name,
                          description = EXCLUDED.description,
                          default_branch = EXCLUDED.default_branch,
                          pushed_at = EXCLUDED.pushed_at,
                          active = TRUE,
                          last_updated_at = EXCLUDED.last_updated_at
            "#,
        )
        .bind(tenant_id)
        .bind(integration_id)
        .bind(&row.external_id)
        .bind(&row.name)
        .bind(&row.full_name)
        .bind(&row.description)
        .bind(&row.default_branch)
        .bind(row.pushed_at)
        .bind(now)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn upsert_pull_request(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        tenant_id: i64,
        integration_id: i64,
        row: &PullRequestRow,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO pull_requests
                (tenant_id, integration_id, external_id, repo_external_id, number,
                 title, body, state, author, pr_created_at, pr_updated_at, merged_at,
                 commit_count, author_count, first_review_at, rework_commit_count,
                 review_cycles, active, created_at, last_updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                    $13, $14, $15, $16, $17, TRUE, $18, $18)
            ON CONFLICT (tenant_id, external_id)
            DO UPDATE SET repo_external_id = EXCLUDED.repo_external_id,
                          number = EXCLUDED.number,
                          title = EXCLUDED.title,
                          body = EXCLUDED.body,
                          state = EXCLUDED.state,
                          author = EXCLUDED.author,
                          pr_created_at = EXCLUDED.pr_created_at,
                          pr_updated_at = EXCLUDED.pr_updated_at,
                          merged_at = EXCLUDED.merged_at,
                          commit_count = EXCLUDED.commit_count,
                          author_count = EXCLUDED.author_count,
                          first_review_at = EXCLUDED.first_review_at,
                          rework_commit_count = EXCLUDED.rework_commit_count,
                          review_cycles = EXCLUDED.review_cycles,
                          active = TRUE,
                          last_updated_at = EXCLUDED.last_updated_at
            "#,
        )
        .bind(tenant_id)
        .bind(integration_id)
        .bind(&row.external_id)
        .bind(&row.repo_external_id)
        .bind(row.number)
        .bind(&row.title)
        .bind(&row.body)
        .bind(&row.state)
        .bind(&row.author)
        .bind(row.pr_created_at)
        .bind(row.pr_updated_at)
        .bind(row.merged_at)
        .bind(row.metrics.commit_count)
        .bind(row.metrics.author_count)
        .bind(row.metrics.first_review_at)
        .bind(row.metrics.rework_commit_count)
        .bind(row.metrics.review_cycles)
        .bind(now)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn upsert_commit(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        tenant_id: i64,
        integration_id: i64,
        row: &CommitRow,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO pr_commits
                (tenant_id, integration_id, external_id, pr_external_id, message,
                 author, authored_at, active, created_at, last_updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, TRUE, $8, $8)
            ON CONFLICT (tenant_id, external_id)
            DO UPDATE SET pr_external_id = EXCLUDED.pr_external_id,
                          message = EXCLUDED.message,
                          author = EXCLUDED.author,
                          authored_at = EXCLUDED.authored_at,
                          active = TRUE,
                          last_updated_at = EXCLUDED.last_updated_at
            "#,
        )
        .bind(tenant_id)
        .bind(integration_id)
        .bind(&row.external_id)
        .bind(&row.pr_external_id)
        .bind(&row.message)
        .bind(&row.author)
        .bind(row.authored_at)
        .bind(now)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn upsert_review(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        tenant_id: i64,
        integration_id: i64,
        row: &ReviewRow,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO pr_reviews
                (tenant_id, integration_id, external_id, pr_external_id, state,
                 body, author, submitted_at, active, created_at, last_updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, TRUE, $9, $9)
            ON CONFLICT (tenant_id, external_id)
            DO UPDATE SET pr_external_id = EXCLUDED.pr_external_id,
                          state = EXCLUDED.state,
                          body = EXCLUDED.body,
                          author = EXCLUDED.author,
                          submitted_at = EXCLUDED.submitted_at,
                          active = TRUE,
                          last_updated_at = EXCLUDED.last_updated_at
            "#,
        )
        .bind(tenant_id)
        .bind(integration_id)
        .bind(&row.external_id)
        .bind(&row.pr_external_id)
        .bind(&row.state)
        .bind(&row.body)
        .bind(&row.author)
        .bind(row.submitted_at)
        .bind(now)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn upsert_review_comment(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        tenant_id: i64,
        integration_id: i64,
        row: &ReviewCommentRow,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO pr_review_comments
                (tenant_id, integration_id, external_id, pr_external_id, body,
                 author, comment_created_at, active, created_at, last_updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, TRUE, $8, $8)
            ON CONFLICT (tenant_id, external_id)
            DO UPDATE SET pr_external_id = EXCLUDED.pr_external_id,
                          body = EXCLUDED.body,
                          author = EXCLUDED.author,
                          comment_created_at = EXCLUDED.comment_created_at,
                          active = TRUE,
                          last_updated_at = EXCLUDED.last_updated_at
            "#,
        )
        .bind(tenant_id)
        .bind(integration_id)
        .bind(&row.external_id)
        .bind(&row.pr_external_id)
        .bind(&row.body)
        .bind(&row.author)
        .bind(row.comment_created_at)
        .bind(now)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn upsert_link(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        tenant_id: i64,
        integration_id: i64,
        row: &LinkRow,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO work_item_pr_links
                (tenant_id, integration_id, work_item_external_id, repo_external_id,
                 pr_number, active, created_at, last_updated_at)
            VALUES ($1, $2, $3, $4, $5, TRUE, $6, $6)
            ON CONFLICT (tenant_id, work_item_external_id, repo_external_id, pr_number)
            DO UPDATE SET active = TRUE,
                          last_updated_at = EXCLUDED.last_updated_at
            "#,
        )
        .bind(tenant_id)
        .bind(integration_id)
        .bind(&row.work_item_external_id)
        .bind(&row.repo_external_id)
        .bind(row.pr_number)
        .bind(now)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Known project keys for a tenant's integration, used when the
    /// integration settings carry no explicit project list.
    pub async fn project_keys(
        &self,
        tenant_id: i64,
        integration_id: i64,
    ) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT key FROM projects
            WHERE tenant_id = $1 AND integration_id = $2 AND active = TRUE
            ORDER BY key
            "#,
        )
        .bind(tenant_id)
        .bind(integration_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|row| row.get("key")).collect())
    }

    /// Repository lookup by full name, used by the PR transform to resolve
    /// its parent.
    pub async fn repository_by_full_name(
        &self,
        tenant_id: i64,
        full_name: &str,
    ) -> Result<Option<(i64, String)>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, external_id FROM repositories
            WHERE tenant_id = $1 AND full_name = $2
            "#,
        )
        .bind(tenant_id)
        .bind(full_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| (r.get("id"), r.get("external_id"))))
    }

    /// Whether a pull request already exists; nested pages arriving before
    /// their parent are skipped with a warning.
    pub async fn pull_request_exists(
        &self,
        tenant_id: i64,
        external_id: &str,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"SELECT 1 AS present FROM pull_requests WHERE tenant_id = $1 AND external_id = $2"#,
        )
        .bind(tenant_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Distinct repository names already linked from work items; feeds the
    /// repository search alongside the configured filters.
    pub async fn linked_repository_names(
        &self,
        tenant_id: i64,
        integration_id: i64,
    ) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT r.full_name
            FROM repositories r
            JOIN pull_requests pr
              ON pr.repo_external_id = r.external_id AND pr.tenant_id = r.tenant_id
            JOIN work_item_pr_links l
              ON l.repo_external_id = pr.repo_external_id
             AND l.pr_number = pr.number
             AND l.tenant_id = pr.tenant_id
            WHERE r.tenant_id = $1
              AND r.integration_id = $2
              AND r.active = TRUE
              AND pr.active = TRUE
              AND l.active = TRUE
            "#,
        )
        .bind(tenant_id)
        .bind(integration_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| row.get::<String, _>("full_name"))
            .collect())
    }

    /// Work items with code changes inside the bounded range, for the
    /// dev-status side extraction. Capped at the provider search ceiling.
    pub async fn changed_work_item_keys(
        &self,
        tenant_id: i64,
        integration_id: i64,
        since: Option<DateTime<Utc>>,
        until: DateTime<Utc>,
    ) -> Result<Vec<(String, String)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT key, external_id
            FROM work_items
            WHERE tenant_id = $1
              AND integration_id = $2
              AND code_changed = TRUE
              AND ($3::timestamptz IS NULL OR item_updated_at >= $3)
              AND item_updated_at <= $4
            ORDER BY item_updated_at DESC
            LIMIT 1000
            "#,
        )
        .bind(tenant_id)
        .bind(integration_id)
        .bind(since)
        .bind(until)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("key"), row.get("external_id")))
            .collect())
    }

    /// Load the text-projection source for one row of one table.
    pub async fn source_row(
        &self,
        tenant_id: i64,
        table: &str,
        external_id: &str,
    ) -> Result<Option<SourceRow>, StoreError> {
        let row = match table {
            "projects" => sqlx::query(
                r#"SELECT key, name, description FROM projects
                   WHERE tenant_id = $1 AND external_id = $2"#,
            )
            .bind(tenant_id)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?
            .map(|r| SourceRow::Project {
                key: r.get("key"),
                name: r.get("name"),
                description: r.get("description"),
            }),
            "project_statuses" => sqlx::query(
                r#"SELECT name, category FROM project_statuses
                   WHERE tenant_id = $1 AND external_id = $2"#,
            )
            .bind(tenant_id)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?
            .map(|r| SourceRow::ProjectStatus {
                name: r.get("name"),
                category: r.get("category"),
            }),
            "work_items" => sqlx::query(
                r#"SELECT key, title, body, item_type, status FROM work_items
                   WHERE tenant_id = $1 AND external_id = $2"#,
            )
            .bind(tenant_id)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?
            .map(|r| SourceRow::WorkItem {
                key: r.get("key"),
                title: r.get("title"),
                body: r.get("body"),
                item_type: r.get("item_type"),
                status: r.get("status"),
            }),
            "repositories" => sqlx::query(
                r#"SELECT name, full_name, description FROM repositories
                   WHERE tenant_id = $1 AND external_id = $2"#,
            )
            .bind(tenant_id)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?
            .map(|r| SourceRow::Repository {
                name: r.get("name"),
                full_name: r.get("full_name"),
                description: r.get("description"),
            }),
            "pull_requests" => sqlx::query(
                r#"SELECT number, title, body FROM pull_requests
                   WHERE tenant_id = $1 AND external_id = $2"#,
            )
            .bind(tenant_id)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?
            .map(|r| SourceRow::PullRequest {
                number: r.get("number"),
                title: r.get("title"),
                body: r.get("body"),
            }),
            "pr_commits" => sqlx::query(
                r#"SELECT message, author FROM pr_commits
                   WHERE tenant_id = $1 AND external_id = $2"#,
            )
            .bind(tenant_id)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?
            .map(|r| SourceRow::Commit {
                message: r.get("message"),
                author: r.get("author"),
            }),
            "pr_reviews" => sqlx::query(
                r#"SELECT state, body FROM pr_reviews
                   WHERE tenant_id = $1 AND external_id = $2"#,
            )
            .bind(tenant_id)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?
            .map(|r| SourceRow::Review {
                state: r.get("state"),
                body: r.get("body"),
            }),
            "pr_review_comments" => sqlx::query(
                r#"SELECT body FROM pr_review_comments
                   WHERE tenant_id = $1 AND external_id = $2"#,
            )
            .bind(tenant_id)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?
            .map(|r| SourceRow::ReviewComment { body: r.get("body") }),
            "work_item_pr_links" => sqlx::query(
                r#"SELECT work_item_external_id, repo_external_id, pr_number
                   FROM work_item_pr_links
                   WHERE tenant_id = $1
                     AND work_item_external_id || ':' || repo_external_id || ':' || pr_number::text = $2"#,
            )
            .bind(tenant_id)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?
            .map(|r| SourceRow::Link {
                work_item_external_id: r.get("work_item_external_id"),
                repo_external_id: r.get("repo_external_id"),
                pr_number: r.get("pr_number"),
            }),
            table if MAPPING_TABLES.contains(&table) => sqlx::query(&format!(
                r#"SELECT name FROM {table} WHERE tenant_id = $1 AND external_id = $2"#
            ))
            .bind(tenant_id)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?
            .map(|r| SourceRow::Mapping { label: r.get("name") }),
            other => return Err(StoreError::NotFound(format!("table {other}"))),
        };
        Ok(row)
    }

    /// Recent changelog entries folded into the work item's canonical text.
    pub async fn changelog_lines(
        &self,
        tenant_id: i64,
        work_item_external_id: &str,
        limit: i64,
    ) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT field, from_value, to_value
            FROM work_item_changelogs
            WHERE tenant_id = $1 AND work_item_external_id = $2 AND active = TRUE
            ORDER BY changed_at DESC NULLS LAST
            LIMIT $3
            "#,
        )
        .bind(tenant_id)
        .bind(work_item_external_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let field: String = row.get("field");
                let from_value: Option<String> = row.get("from_value");
                let to_value: Option<String> = row.get("to_value");
                format!(
                    "{}: {} -> {}",
                    field,
                    from_value.unwrap_or_default(),
                    to_value.unwrap_or_default()
                )
            })
            .collect())
    }

    /// Active external ids of a mapping table, for bulk re-embedding. The
    /// table name is validated against the whitelist before interpolation.
    pub async fn active_external_ids(
        &self,
        tenant_id: i64,
        table: &str,
    ) -> Result<Vec<String>, StoreError> {
        if !MAPPING_TABLES.contains(&table) && !EMBEDDABLE_TABLES.contains(&table) {
            return Err(StoreError::NotFound(format!("table {table}")));
        }
        let id_expr = if table == "work_item_pr_links" {
            "work_item_external_id || ':' || repo_external_id || ':' || pr_number::text"
        } else {
            "external_id"
        };
        let rows = sqlx::query(&format!(
            r#"
            SELECT {id_expr} AS external_id FROM {table}
            WHERE tenant_id = $1 AND active = TRUE
            ORDER BY id
            "#
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| row.get::<String, _>("external_id"))
            .collect())
    }
}
