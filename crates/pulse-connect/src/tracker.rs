//! Issue-tracker REST client.
//!
//! Project search, per-project work-item types and statuses, bounded
//! work-item search with changelog expansion, and the development-status
//! side endpoint. Pagination uses the provider's `nextPageToken`/`isLast`
//! contract.

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use pulse_core::RateResource;

use crate::error::ConnectError;
use crate::rate_limit::RateLimitTracker;

pub struct IssueTrackerClient {
    http: reqwest::Client,
    base_url: Url,
    token: String,
    limits: RateLimitTracker,
}

/// One page of a bounded work-item search.
#[derive(Debug, Clone)]
pub struct WorkItemPage {
    pub items: Vec<Value>,
    pub is_last: bool,
    pub next_page_token: Option<String>,
}

impl IssueTrackerClient {
    pub fn new(base_url: &str, token: String) -> Result<Self, ConnectError> {
        Ok(Self {
            http: reqwest::Client::new(),
            base_url: Url::parse(base_url)?,
            token,
            limits: RateLimitTracker::default(),
        })
    }

    /// Bounded search expression for one run: project filter plus the frozen
    /// date range, oldest first so batches stream in stable order.
    pub fn bounded_query(
        projects: &[String],
        since: Option<DateTime<Utc>>,
        until: DateTime<Utc>,
    ) -> String {
        let project_filter = format!("project in ({})", projects.join(","));
        match since {
            Some(since) => format!(
                "{} AND updated >= '{}' AND updated <= '{}' ORDER BY updated ASC",
                project_filter,
                since.format("%Y-%m-%d %H:%M"),
                until.format("%Y-%m-%d %H:%M"),
            ),
            None => format!(
                "{} AND updated <= '{}' ORDER BY updated ASC",
                project_filter,
                until.format("%Y-%m-%d %H:%M"),
            ),
        }
    }

    pub async fn search_projects(&self) -> Result<Vec<Value>, ConnectError> {
        #[derive(Deserialize)]
        struct ProjectPage {
            #[serde(default)]
            values: Vec<Value>,
            #[serde(default, rename = "isLast")]
            is_last: bool,
        }

        let mut projects = Vec::new();
        let mut start_at = 0usize;
        loop {
            let body = self
                .get_json(
                    "rest/api/project/search",
                    &[("startAt", start_at.to_string()), ("maxResults", "50".into())],
                )
                .await?;
            let page: ProjectPage = serde_json::from_value(body)
                .map_err(|e| ConnectError::Decode(e.to_string()))?;
            let fetched = page.values.len();
            projects.extend(page.values);
            if page.is_last || fetched == 0 {
                break;
            }
            start_at += fetched;
        }
        Ok(projects)
    }

    pub async fn project_work_item_types(
        &self,
        project_external_id: &str,
    ) -> Result<Vec<Value>, ConnectError> {
        let body = self
            .get_json(
                &format!("rest/api/project/{project_external_id}/issuetypes"),
                &[],
            )
            .await?;
        as_array(body)
    }

    pub async fn project_statuses(&self, project_key: &str) -> Result<Vec<Value>, ConnectError> {
        let body = self
            .get_json(&format!("rest/api/project/{project_key}/statuses"), &[])
            .await?;
        as_array(body)
    }

    /// One page of work items matching `query`, with changelogs expanded.
    pub async fn search_work_items(
        &self,
        query: &str,
        page_token: Option<&str>,
        max_results: i64,
    ) -> Result<WorkItemPage, ConnectError> {
        #[derive(Deserialize)]
        struct SearchPage {
            #[serde(default)]
            issues: Vec<Value>,
            #[serde(default = "default_true", rename = "isLast")]
            is_last: bool,
            #[serde(default, rename = "nextPageToken")]
            next_page_token: Option<String>,
        }

        fn default_true() -> bool {
            true
        }

        let mut params = vec![
            ("jql", query.to_string()),
            ("maxResults", max_results.to_string()),
            ("fields", "*all".to_string()),
            ("expand", "changelog".to_string()),
        ];
        if let Some(token) = page_token {
            params.push(("nextPageToken", token.to_string()));
        }
        let body = self.get_json("rest/api/search", &params).await?;
        let page: SearchPage =
            serde_json::from_value(body).map_err(|e| ConnectError::Decode(e.to_string()))?;
        Ok(WorkItemPage {
            items: page.issues,
            is_last: page.is_last,
            next_page_token: page.next_page_token,
        })
    }

    /// Development-status side endpoint: repositories and pull requests
    /// linked to one work item.
    pub async fn dev_status(&self, work_item_external_id: &str) -> Result<Value, ConnectError> {
        self.get_json(
            "rest/dev-status/latest/issue/detail",
            &[
                ("issueId", work_item_external_id.to_string()),
                ("applicationType", "GitHub".to_string()),
                ("dataType", "pullrequest".to_string()),
            ],
        )
        .await
    }

    async fn get_json(&self, path: &str, params: &[(&str, String)]) -> Result<Value, ConnectError> {
        self.limits.ensure_budget(RateResource::Core)?;

        let mut url = self.base_url.join(path).map_err(ConnectError::BaseUrl)?;
        {
            let mut query = url.query_pairs_mut();
            for (key, value) in params {
                query.append_pair(key, value);
            }
        }

        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .header("accept", "application/json")
            .send()
            .await?;

        self.limits
            .record_headers(RateResource::Core, response.headers());
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ConnectError::Auth {
                status: status.as_u16(),
            });
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            let reset_at = self
                .limits
                .snapshot(RateResource::Core)
                .and_then(|s| s.reset_at);
            return Err(ConnectError::RateLimited {
                resource: RateResource::Core,
                reset_at,
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConnectError::Http {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json().await?)
    }
}

fn as_array(body: Value) -> Result<Vec<Value>, ConnectError> {
    match body {
        Value::Array(items) => Ok(items),
        other => Err(ConnectError::Decode(format!(
            "expected a JSON array, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn bounded_query_first_run_has_no_lower_bound() {
        let until = Utc.with_ymd_and_hms(2025, 6, 1, 12, 30, 0).unwrap();
        let query = IssueTrackerClient::bounded_query(
            &["CORE".to_string(), "OPS".to_string()],
            None,
            until,
        );
        assert_eq!(
            query,
            "project in (CORE,OPS) AND updated <= '2025-06-01 12:30' ORDER BY updated ASC"
        );
    }

    #[test]
    fn bounded_query_incremental_run_is_range_bounded() {
        let since = Utc.with_ymd_and_hms(2025, 5, 1, 0, 0, 0).unwrap();
        let until = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let query =
            IssueTrackerClient::bounded_query(&["CORE".to_string()], Some(since), until);
        assert!(query.contains("updated >= '2025-05-01 00:00'"));
        assert!(query.contains("updated <= '2025-06-01 00:00'"));
        assert!(query.ends_with("ORDER BY updated ASC"));
    }
}
