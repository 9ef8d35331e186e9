//! Job ladder types.
//!
//! A job is one rung of a tenant's ordered ladder. The orchestrator owns the
//! status field; stages touch only the checkpoint and the per-step stage
//! statuses.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Job status as stored on the ladder row.
///
/// ```text
/// READY ───(first tick)──> RUNNING
/// PENDING ──(tick lock)──> RUNNING
/// RUNNING ──(terminal embed message)──> FINISHED ──(chain)──> next: PENDING
/// RUNNING ──(fatal error / rate limit)──> PENDING (checkpoint kept)
/// any ──(admin)──> PAUSED ──(admin resume)──> prior status
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Ready,
    Pending,
    Running,
    Finished,
    Paused,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "READY",
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
            Self::Paused => "PAUSED",
            Self::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<String> for JobStatus {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "READY" => Ok(Self::Ready),
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "FINISHED" => Ok(Self::Finished),
            "PAUSED" => Ok(Self::Paused),
            "FAILED" => Ok(Self::Failed),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// Per-stage status within one step of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    #[default]
    Idle,
    Running,
    Finished,
    Failed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }
}

/// One named sub-phase of a job with its extract/transform/embed triple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStep {
    pub name: String,
    pub order: i32,
    pub display_name: String,
    #[serde(default)]
    pub extraction: StageStatus,
    #[serde(default)]
    pub transform: StageStatus,
    #[serde(default)]
    pub embedding: StageStatus,
}

impl JobStep {
    pub fn new(name: impl Into<String>, order: i32, display_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            order,
            display_name: display_name.into(),
            extraction: StageStatus::Idle,
            transform: StageStatus::Idle,
            embedding: StageStatus::Idle,
        }
    }
}

/// Pagination state of one nested edge collection, as saved in a rate-limit
/// checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NestedCursorState {
    pub fetched: bool,
    pub has_next_page: bool,
    pub cursor: Option<String>,
}

/// The parent object a resumed extraction re-enters under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentContext {
    pub owner: String,
    pub repo_name: String,
    pub full_name: String,
}

/// Structured resume state stored on the job row.
///
/// Sufficient to re-enter extraction exactly where it left off: the last
/// top-level cursor, the node type at which a rate limit was hit, and the
/// per-nested-kind sub-cursors of the parent being processed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default)]
    pub last_cursor: Option<String>,
    #[serde(default)]
    pub rate_limit_hit: bool,
    #[serde(default)]
    pub rate_limit_reset_at: Option<DateTime<Utc>>,
    /// Node type at which the rate limit was hit (e.g. "pull_requests",
    /// "commits").
    #[serde(default)]
    pub rate_limit_node_type: Option<String>,
    /// External id of the parent whose nested edges were mid-flight.
    #[serde(default)]
    pub current_parent_external_id: Option<String>,
    /// Owner/name of the repository being walked when extraction stopped.
    #[serde(default)]
    pub parent_context: Option<ParentContext>,
    #[serde(default)]
    pub nested_cursors: BTreeMap<String, NestedCursorState>,
    #[serde(default)]
    pub items_processed: i64,
}

impl Checkpoint {
    /// Checkpoint recorded when a rate limit interrupts extraction.
    pub fn rate_limited(
        node_type: impl Into<String>,
        last_cursor: Option<String>,
        reset_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            last_cursor,
            rate_limit_hit: true,
            rate_limit_reset_at: reset_at,
            rate_limit_node_type: Some(node_type.into()),
            ..Self::default()
        }
    }
}

/// One rung of a tenant's job ladder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub tenant_id: i64,
    pub integration_id: Option<i64>,
    /// Unique per tenant.
    pub job_name: String,
    /// Ladder position; total order per tenant.
    pub execution_order: i32,
    pub schedule_interval_minutes: i64,
    pub retry_interval_minutes: i64,
    pub status: JobStatus,
    /// Status to restore when a paused job is resumed.
    pub resume_status: Option<JobStatus>,
    pub last_run_started_at: Option<DateTime<Utc>>,
    pub last_run_finished_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    /// Incremental boundary of the last successful run.
    pub last_sync_date: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub checkpoint: Option<Checkpoint>,
    pub steps: Vec<JobStep>,
    pub active: bool,
}

impl Job {
    /// Whether the saved checkpoint calls for a resumed (not fresh) run.
    pub fn has_recovery_checkpoint(&self) -> bool {
        self.checkpoint.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            JobStatus::Ready,
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Finished,
            JobStatus::Paused,
            JobStatus::Failed,
        ] {
            let parsed = JobStatus::try_from(status.as_str().to_string()).unwrap();
            assert_eq!(parsed, status);
        }
        assert!(JobStatus::try_from("DONE".to_string()).is_err());
    }

    #[test]
    fn checkpoint_serde_keeps_nested_cursors() {
        let mut checkpoint = Checkpoint::rate_limited(
            "commits",
            Some("cursor-42".into()),
            Some(Utc::now()),
        );
        checkpoint.current_parent_external_id = Some("PR_node_9".into());
        checkpoint.nested_cursors.insert(
            "commits".into(),
            NestedCursorState {
                fetched: true,
                has_next_page: true,
                cursor: Some("c-100".into()),
            },
        );

        let json = serde_json::to_string(&checkpoint).unwrap();
        let back: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, checkpoint);
        assert!(back.rate_limit_hit);
        assert_eq!(back.nested_cursors["commits"].cursor.as_deref(), Some("c-100"));
    }

    #[test]
    fn empty_checkpoint_json_deserializes() {
        let checkpoint: Checkpoint = serde_json::from_str("{}").unwrap();
        assert!(!checkpoint.rate_limit_hit);
        assert!(checkpoint.last_cursor.is_none());
    }
}
