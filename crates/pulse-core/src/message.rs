//! Queue-message envelope.
//!
//! Every message on every queue is one self-describing JSON `Envelope`. The
//! payload names the stage-specific work; the control flags and relay bits
//! carry the terminal-flag protocol (see `flags`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids;
use crate::tenant::ProviderKind;

/// Terminal flags carried by every message.
///
/// `first_item` and `last_item` are each set on exactly one message per step;
/// `last_job_item` on exactly one message per job run. `rate_limited` rides
/// along on completion messages produced by an interrupted extraction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlFlags {
    #[serde(default)]
    pub first_item: bool,
    #[serde(default)]
    pub last_item: bool,
    #[serde(default)]
    pub last_job_item: bool,
    #[serde(default)]
    pub rate_limited: bool,
}

impl ControlFlags {
    /// Flags for a zero-data completion marker: terminal on both the step and
    /// the job, never first.
    pub fn completion(rate_limited: bool) -> Self {
        Self {
            first_item: false,
            last_item: true,
            last_job_item: true,
            rate_limited,
        }
    }

    /// Flags for the seed message of a run: the sole item of its step until
    /// fan-out splits it.
    pub fn seed() -> Self {
        Self {
            first_item: true,
            last_item: true,
            last_job_item: true,
            rate_limited: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.last_job_item
    }
}

/// Relay bits passed from a fan-out producer to each child so the child can
/// decide, after its own fan-out, whether to carry the terminal flag further.
///
/// Exactly one branch of any fan-out receives a true bit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayFlags {
    /// This branch descends from the last parent (last repository) of the
    /// run.
    #[serde(default)]
    pub last_parent: bool,
    /// This branch is the last nested kind of the last pull request of the
    /// last parent; combined with page exhaustion it terminates the job.
    #[serde(default)]
    pub last_parent_last_nested: bool,
}

/// Nested edge collections of a pull request, each paginated independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NestedKind {
    Commits,
    Reviews,
    Comments,
    ReviewThreads,
}

impl NestedKind {
    pub const ALL: [NestedKind; 4] = [
        Self::Commits,
        Self::Reviews,
        Self::Comments,
        Self::ReviewThreads,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Commits => "commits",
            Self::Reviews => "reviews",
            Self::Comments => "comments",
            Self::ReviewThreads => "review_threads",
        }
    }
}

impl std::fmt::Display for NestedKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payload type tag on raw-extraction records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawKind {
    Project,
    ProjectStatuses,
    WorkItem,
    DevStatus,
    Repository,
    PullRequest,
    NestedPage,
}

impl RawKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::ProjectStatuses => "project_statuses",
            Self::WorkItem => "work_item",
            Self::DevStatus => "dev_status",
            Self::Repository => "repository",
            Self::PullRequest => "pull_request",
            Self::NestedPage => "nested_page",
        }
    }
}

/// Work requested from the extract stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractSpec {
    /// Issue tracker: projects and their work-item types.
    Projects,
    /// Issue tracker: statuses and project relationships.
    ProjectStatuses,
    /// Issue tracker: work items with changelogs, bounded by the sync dates.
    WorkItems { page_token: Option<String> },
    /// Issue tracker: development-status side endpoint for changed items.
    DevStatus,
    /// Repo host: repository search seed.
    Repositories,
    /// Repo host: one page of pull requests with inlined nested edges.
    PullRequests {
        owner: String,
        repo_name: String,
        full_name: String,
        pr_cursor: Option<String>,
    },
    /// Repo host: continuation of one nested edge collection of one PR.
    NestedPage {
        owner: String,
        repo_name: String,
        full_name: String,
        parent_external_id: String,
        nested: NestedKind,
        cursor: Option<String>,
    },
}

/// Work requested from the transform stage.
///
/// `raw_data_id = None` is the completion marker: no data, flags only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformSpec {
    pub raw_data_id: Option<i64>,
    pub data_type: RawKind,
}

impl TransformSpec {
    pub fn completion(data_type: RawKind) -> Self {
        Self {
            raw_data_id: None,
            data_type,
        }
    }

    pub fn is_completion(&self) -> bool {
        self.raw_data_id.is_none()
    }
}

/// Work requested from the embed stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EmbedSpec {
    /// Vectorize one normalized row, located by table + external id.
    Row { table: String, external_id: String },
    /// Terminal signal with no row; triggers job chaining.
    Completion,
    /// Re-vectorize every active row of a mapping table.
    MappingTable { table: String },
}

impl EmbedSpec {
    pub fn is_completion(&self) -> bool {
        matches!(self, Self::Completion)
    }
}

/// Stage-discriminated payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum Payload {
    Extract(ExtractSpec),
    Transform(TransformSpec),
    Embed(EmbedSpec),
}

/// The queue message. One envelope per delivery, on every queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: Uuid,
    pub tenant_id: i64,
    pub integration_id: Option<i64>,
    /// Absent for administrative work outside any job run (bulk re-embeds).
    pub job_id: Option<i64>,
    pub provider: ProviderKind,
    /// Step name within the job (e.g. "work_items", "pull_requests").
    pub step: String,
    pub payload: Payload,
    #[serde(default)]
    pub flags: ControlFlags,
    #[serde(default)]
    pub relay: RelayFlags,
    /// Filter boundary from the previous successful run; frozen at run start.
    pub old_last_sync_date: Option<DateTime<Utc>>,
    /// Extraction end date stamped at run start; becomes the next run's
    /// boundary on success.
    pub new_last_sync_date: Option<DateTime<Utc>>,
}

impl Envelope {
    /// Derive a new envelope for a downstream stage, keeping identity,
    /// provider, step and the frozen sync boundary.
    pub fn derive(&self, payload: Payload, flags: ControlFlags, relay: RelayFlags) -> Self {
        Self {
            message_id: ids::new_message_id(),
            tenant_id: self.tenant_id,
            integration_id: self.integration_id,
            job_id: self.job_id,
            provider: self.provider,
            step: self.step.clone(),
            payload,
            flags,
            relay,
            old_last_sync_date: self.old_last_sync_date,
            new_last_sync_date: self.new_last_sync_date,
        }
    }

    /// Same as `derive` but for a different step name.
    pub fn derive_step(
        &self,
        step: impl Into<String>,
        payload: Payload,
        flags: ControlFlags,
        relay: RelayFlags,
    ) -> Self {
        let mut envelope = self.derive(payload, flags, relay);
        envelope.step = step.into();
        envelope
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> Envelope {
        Envelope {
            message_id: ids::new_message_id(),
            tenant_id: 7,
            integration_id: Some(3),
            job_id: Some(11),
            provider: ProviderKind::Repos,
            step: "pull_requests".into(),
            payload: Payload::Extract(ExtractSpec::Repositories),
            flags: ControlFlags::seed(),
            relay: RelayFlags::default(),
            old_last_sync_date: None,
            new_last_sync_date: Some(Utc::now()),
        }
    }

    #[test]
    fn envelope_json_round_trip() {
        let original = envelope();
        let json = serde_json::to_string(&original).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn missing_flags_default_false() {
        let json = r#"{
            "message_id": "6dca8f7e-5f2b-4f4e-b3a7-3a4cf02cf0aa",
            "tenant_id": 1,
            "integration_id": null,
            "job_id": 2,
            "provider": "issues",
            "step": "work_items",
            "payload": {"stage": "transform", "raw_data_id": null, "data_type": "work_item"},
            "old_last_sync_date": null,
            "new_last_sync_date": null
        }"#;
        let envelope: Envelope = serde_json::from_str(json).unwrap();
        assert!(!envelope.flags.first_item);
        assert!(!envelope.relay.last_parent);
        match envelope.payload {
            Payload::Transform(ref spec) => assert!(spec.is_completion()),
            _ => panic!("expected transform payload"),
        }
    }

    #[test]
    fn derive_keeps_identity_and_boundary() {
        let seed = envelope();
        let derived = seed.derive_step(
            "repositories",
            Payload::Embed(EmbedSpec::Completion),
            ControlFlags::completion(true),
            RelayFlags::default(),
        );
        assert_eq!(derived.tenant_id, seed.tenant_id);
        assert_eq!(derived.job_id, seed.job_id);
        assert_eq!(derived.new_last_sync_date, seed.new_last_sync_date);
        assert_ne!(derived.message_id, seed.message_id);
        assert!(derived.flags.rate_limited);
    }
}
