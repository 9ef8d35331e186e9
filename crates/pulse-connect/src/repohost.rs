//! Repo-host client: REST repository search and GraphQL pull-request
//! extraction.
//!
//! The search side batches name patterns so each query string stays within
//! the provider's URL budget, follows `Link: rel="next"` pagination, and
//! stops at the provider's search-result ceiling. The GraphQL side fetches
//! pull-request pages with four inlined nested edge collections and one
//! continuation query per nested kind.

use chrono::{DateTime, NaiveDate, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;
use url::Url;

use pulse_core::{NestedKind, RateResource};

use crate::error::ConnectError;
use crate::rate_limit::RateLimitTracker;

/// Provider maximum combined search-query length.
pub const MAX_QUERY_LEN: usize = 256;

/// Provider hard cap on accumulated search results.
pub const SEARCH_RESULT_CEILING: usize = 1000;

const PR_PAGE_SIZE: usize = 50;
const NESTED_PAGE_SIZE: usize = 100;

pub struct RepoHostClient {
    http: reqwest::Client,
    base_url: Url,
    token: String,
    limits: RateLimitTracker,
}

/// One page of a GraphQL connection.
#[derive(Debug, Clone)]
pub struct GraphPage {
    pub nodes: Vec<Value>,
    pub has_next_page: bool,
    pub end_cursor: Option<String>,
}

/// Pagination state of one nested edge collection inlined in a parent node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NestedPageInfo {
    pub has_next_page: bool,
    pub end_cursor: Option<String>,
}

/// Split name patterns into batches such that each combined query including
/// the base filters stays within the length budget.
pub fn batch_search_patterns(base_query: &str, patterns: &[String], max_len: usize) -> Vec<Vec<String>> {
    let base_len = base_query.len() + 1; // trailing space before the patterns
    let mut batches: Vec<Vec<String>> = Vec::new();
    let mut current: Vec<String> = Vec::new();

    for pattern in patterns {
        if current.is_empty() {
            current.push(pattern.clone());
            continue;
        }
        let joined_len: usize = current.iter().map(|p| p.len()).sum::<usize>()
            + pattern.len()
            + " OR ".len() * current.len();
        if base_len + joined_len <= max_len {
            current.push(pattern.clone());
        } else {
            batches.push(std::mem::take(&mut current));
            current.push(pattern.clone());
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Extract the `rel="next"` target from a `Link` header value.
pub fn parse_next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|part| {
        if !part.contains(r#"rel="next""#) {
            return None;
        }
        let url = part.split(';').next()?.trim();
        Some(url.trim_start_matches('<').trim_end_matches('>').to_string())
    })
}

/// GraphQL field name for a nested edge collection.
pub fn nested_field(kind: NestedKind) -> &'static str {
    match kind {
        NestedKind::Commits => "commits",
        NestedKind::Reviews => "reviews",
        NestedKind::Comments => "comments",
        NestedKind::ReviewThreads => "reviewThreads",
    }
}

/// Pagination state of one nested collection inlined in a parent node.
pub fn nested_info(node: &Value, kind: NestedKind) -> NestedPageInfo {
    let page_info = &node[nested_field(kind)]["pageInfo"];
    NestedPageInfo {
        has_next_page: page_info["hasNextPage"].as_bool().unwrap_or(false),
        end_cursor: page_info["endCursor"].as_str().map(str::to_string),
    }
}

/// Provider `updatedAt` timestamp of a node (ISO-8601 with trailing Z).
pub fn node_updated_at(node: &Value) -> Option<DateTime<Utc>> {
    node["updatedAt"]
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

impl RepoHostClient {
    pub fn new(base_url: &str, token: String) -> Result<Self, ConnectError> {
        Ok(Self {
            http: reqwest::Client::new(),
            base_url: Url::parse(base_url)?,
            token,
            limits: RateLimitTracker::default(),
        })
    }

    /// Search the organization's repositories pushed within the date range,
    /// matching any of the name patterns. Batched to the query-length budget,
    /// paginated per batch, deduplicated by external id, capped at the
    /// provider ceiling.
    pub async fn search_repositories(
        &self,
        org: &str,
        start_date: NaiveDate,
        end_date: NaiveDate,
        name_filters: &[String],
        extra_names: &[String],
    ) -> Result<Vec<Value>, ConnectError> {
        let base_query = format!("org:{org} pushed:{start_date}..{end_date} in:name");
        let mut patterns: Vec<String> = name_filters.to_vec();
        patterns.extend(extra_names.iter().cloned());
        if patterns.is_empty() {
            patterns.push(String::new());
        }

        let batches = batch_search_patterns(&base_query, &patterns, MAX_QUERY_LEN);
        let mut seen = std::collections::HashSet::new();
        let mut repositories = Vec::new();

        'batches: for batch in &batches {
            let combined = batch.join(" OR ");
            let query = if combined.is_empty() {
                base_query.clone()
            } else {
                format!("{base_query} {combined}")
            };

            let mut url = self.base_url.join("search/repositories")?;
            url.query_pairs_mut()
                .append_pair("q", &query)
                .append_pair("per_page", "100");
            let mut next_url = Some(url.to_string());

            while let Some(target) = next_url.take() {
                let response = self.rest_get(&target, RateResource::Search).await?;
                let link_next = response
                    .headers()
                    .get("link")
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_next_link);

                #[derive(Deserialize)]
                struct SearchBody {
                    #[serde(default)]
                    items: Vec<Value>,
                }
                let body: SearchBody = response.json().await?;
                for repo in body.items {
                    let external_id = repo["node_id"]
                        .as_str()
                        .or_else(|| repo["id"].as_str())
                        .map(str::to_string)
                        .unwrap_or_else(|| repo["id"].to_string());
                    if seen.insert(external_id) {
                        repositories.push(repo);
                    }
                    if repositories.len() >= SEARCH_RESULT_CEILING {
                        warn!(
                            ceiling = SEARCH_RESULT_CEILING,
                            "Repository search hit the provider result ceiling; results are bounded"
                        );
                        break 'batches;
                    }
                }
                next_url = link_next;
            }
        }

        Ok(repositories)
    }

    /// One page of pull requests with the first page of each nested edge
    /// collection inlined, newest updates first.
    pub async fn pull_requests_page(
        &self,
        owner: &str,
        repo_name: &str,
        cursor: Option<&str>,
    ) -> Result<GraphPage, ConnectError> {
        let query = format!(
            r#"
            query($owner: String!, $name: String!, $cursor: String) {{
              repository(owner: $owner, name: $name) {{
                pullRequests(first: {PR_PAGE_SIZE}, after: $cursor,
                             orderBy: {{field: UPDATED_AT, direction: DESC}}) {{
                  pageInfo {{ hasNextPage endCursor }}
                  nodes {{
                    id number title body state createdAt updatedAt mergedAt
                    author {{ login }}
                    commits(first: {NESTED_PAGE_SIZE}) {{
                      pageInfo {{ hasNextPage endCursor }}
                      nodes {{ commit {{ oid message authoredDate author {{ name email }} }} }}
                    }}
                    reviews(first: {NESTED_PAGE_SIZE}) {{
                      pageInfo {{ hasNextPage endCursor }}
                      nodes {{ id state body submittedAt author {{ login }} }}
                    }}
                    comments(first: {NESTED_PAGE_SIZE}) {{
                      pageInfo {{ hasNextPage endCursor }}
                      nodes {{ id body createdAt author {{ login }} }}
                    }}
                    reviewThreads(first: {NESTED_PAGE_SIZE}) {{
                      pageInfo {{ hasNextPage endCursor }}
                      nodes {{ comments(first: {NESTED_PAGE_SIZE}) {{
                        nodes {{ id body createdAt author {{ login }} }}
                      }} }}
                    }}
                  }}
                }}
              }}
            }}
            "#
        );
        let data = self
            .graphql(&query, json!({ "owner": owner, "name": repo_name, "cursor": cursor }))
            .await?;
        connection_page(&data["repository"]["pullRequests"])
    }

    /// Continuation page of one nested edge collection of one pull request.
    pub async fn nested_page(
        &self,
        parent_external_id: &str,
        kind: NestedKind,
        cursor: Option<&str>,
    ) -> Result<GraphPage, ConnectError> {
        let field = nested_field(kind);
        let selection = match kind {
            NestedKind::Commits => {
                "nodes { commit { oid message authoredDate author { name email } } }"
            }
            NestedKind::Reviews => "nodes { id state body submittedAt author { login } }",
            NestedKind::Comments => "nodes { id body createdAt author { login } }",
            NestedKind::ReviewThreads => {
                "nodes { comments(first: 100) { nodes { id body createdAt author { login } } } }"
            }
        };
        let query = format!(
            r#"
            query($id: ID!, $cursor: String) {{
              node(id: $id) {{
                ... on PullRequest {{
                  {field}(first: {NESTED_PAGE_SIZE}, after: $cursor) {{
                    pageInfo {{ hasNextPage endCursor }}
                    {selection}
                  }}
                }}
              }}
            }}
            "#
        );
        let data = self
            .graphql(&query, json!({ "id": parent_external_id, "cursor": cursor }))
            .await?;
        connection_page(&data["node"][field])
    }

    /// Latest GraphQL budget snapshot, if any call has reported one.
    pub fn rate_limit_reset_at(&self) -> Option<DateTime<Utc>> {
        self.limits
            .snapshot(RateResource::Graphql)
            .and_then(|s| s.reset_at)
    }

    async fn rest_get(
        &self,
        url: &str,
        resource: RateResource,
    ) -> Result<reqwest::Response, ConnectError> {
        self.limits.ensure_budget(resource)?;
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .header("accept", "application/vnd.github+json")
            .header("user-agent", "pulse-etl")
            .send()
            .await?;
        self.limits.record_headers(resource, response.headers());
        self.check_status(response, resource).await
    }

    async fn graphql(&self, query: &str, variables: Value) -> Result<Value, ConnectError> {
        self.limits.ensure_budget(RateResource::Graphql)?;
        let url = self.base_url.join("graphql")?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .header("user-agent", "pulse-etl")
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await?;
        self.limits
            .record_headers(RateResource::Graphql, response.headers());
        let response = self.check_status(response, RateResource::Graphql).await?;

        #[derive(Deserialize)]
        struct GraphQlBody {
            #[serde(default)]
            data: Value,
            #[serde(default)]
            errors: Vec<Value>,
        }
        let body: GraphQlBody = response.json().await?;
        if !body.errors.is_empty() {
            let rate_limited = body.errors.iter().any(|e| {
                e["type"].as_str() == Some("RATE_LIMITED")
            });
            if rate_limited {
                return Err(ConnectError::RateLimited {
                    resource: RateResource::Graphql,
                    reset_at: self.rate_limit_reset_at(),
                });
            }
            return Err(ConnectError::Decode(format!(
                "GraphQL errors: {}",
                serde_json::to_string(&body.errors).unwrap_or_default()
            )));
        }
        Ok(body.data)
    }

    async fn check_status(
        &self,
        response: reqwest::Response,
        resource: RateResource,
    ) -> Result<reqwest::Response, ConnectError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        // A 403 with a drained budget is a rate limit, not an auth failure.
        let drained = self
            .limits
            .snapshot(resource)
            .map(|s| s.remaining == 0)
            .unwrap_or(false);
        if status == StatusCode::TOO_MANY_REQUESTS || (status == StatusCode::FORBIDDEN && drained) {
            return Err(ConnectError::RateLimited {
                resource,
                reset_at: self.limits.snapshot(resource).and_then(|s| s.reset_at),
            });
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ConnectError::Auth {
                status: status.as_u16(),
            });
        }
        let body = response.text().await.unwrap_or_default();
        Err(ConnectError::Http {
            status: status.as_u16(),
            body,
        })
    }
}

fn connection_page(connection: &Value) -> Result<GraphPage, ConnectError> {
    if connection.is_null() {
        return Err(ConnectError::Decode(
            "connection missing from GraphQL response".into(),
        ));
    }
    let nodes = connection["nodes"]
        .as_array()
        .cloned()
        .unwrap_or_default();
    let page_info = &connection["pageInfo"];
    Ok(GraphPage {
        nodes,
        has_next_page: page_info["hasNextPage"].as_bool().unwrap_or(false),
        end_cursor: page_info["endCursor"].as_str().map(str::to_string),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterns(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn batches_respect_the_length_budget() {
        let base = "org:acme pushed:2025-01-01..2025-06-01 in:name";
        let input = patterns(&[
            "platform-",
            "billing-service",
            "edge-proxy",
            "data-warehouse-loader",
            "mobile-gateway",
            "internal-tools",
        ]);
        let batches = batch_search_patterns(base, &input, MAX_QUERY_LEN);

        assert!(!batches.is_empty());
        for batch in &batches {
            let query = format!("{base} {}", batch.join(" OR "));
            assert!(query.len() <= MAX_QUERY_LEN, "over budget: {}", query.len());
        }
        // Nothing dropped, order preserved.
        let flattened: Vec<String> = batches.into_iter().flatten().collect();
        assert_eq!(flattened, input);
    }

    #[test]
    fn oversized_single_pattern_still_gets_a_batch() {
        let base = "org:acme in:name";
        let giant = "x".repeat(300);
        let batches = batch_search_patterns(base, &[giant.clone()], MAX_QUERY_LEN);
        assert_eq!(batches, vec![vec![giant]]);
    }

    #[test]
    fn short_pattern_lists_collapse_to_one_batch() {
        let base = "org:acme in:name";
        let input = patterns(&["health-", "ops-"]);
        let batches = batch_search_patterns(base, &input, MAX_QUERY_LEN);
        assert_eq!(batches.len(), 1);
    }

    #[test]
    fn parses_next_link_relations() {
        let header = r#"<https://api.example.com/search?page=2>; rel="next", <https://api.example.com/search?page=9>; rel="last""#;
        assert_eq!(
            parse_next_link(header).as_deref(),
            Some("https://api.example.com/search?page=2")
        );
        assert_eq!(
            parse_next_link(r#"<https://api.example.com/search?page=9>; rel="last""#),
            None
        );
    }

    #[test]
    fn nested_info_reads_inlined_page_state() {
        let node = serde_json::json!({
            "commits": {
                "pageInfo": { "hasNextPage": true, "endCursor": "c-100" },
                "nodes": []
            },
            "reviews": {
                "pageInfo": { "hasNextPage": false, "endCursor": null },
                "nodes": []
            }
        });
        assert_eq!(
            nested_info(&node, NestedKind::Commits),
            NestedPageInfo {
                has_next_page: true,
                end_cursor: Some("c-100".into())
            }
        );
        assert_eq!(
            nested_info(&node, NestedKind::Reviews),
            NestedPageInfo::default()
        );
        // Absent collection reads as exhausted.
        assert_eq!(
            nested_info(&node, NestedKind::Comments),
            NestedPageInfo::default()
        );
    }

    #[test]
    fn node_updated_at_parses_trailing_z() {
        let node = serde_json::json!({ "updatedAt": "2025-10-27T14:30:00Z" });
        let parsed = node_updated_at(&node).unwrap();
        assert_eq!(parsed.to_rfc3339(), "2025-10-27T14:30:00+00:00");
        assert!(node_updated_at(&serde_json::json!({})).is_none());
    }
}
