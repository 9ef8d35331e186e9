//! Error taxonomy shared by every stage.
//!
//! Kinds, not types: each variant names a handling policy. Stage loops
//! recover locally from `Transient` and `Permanent`; `RateLimited` drives the
//! checkpoint + completion-message path; the rest surface to the orchestrator
//! through `FailJob`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rate-limit budget classes exposed by external providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateResource {
    Core,
    Search,
    Graphql,
}

impl RateResource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Core => "core",
            Self::Search => "search",
            Self::Graphql => "graphql",
        }
    }
}

impl std::fmt::Display for RateResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum EtlError {
    /// Not a failure: the extractor checkpoints and emits a completion
    /// message so the job chains and re-enters on the next tick.
    #[error("rate limited on {resource}, resets at {reset_at:?}")]
    RateLimited {
        resource: RateResource,
        reset_at: Option<DateTime<Utc>>,
    },

    /// Network flakes, 5xx, broker visibility timeouts. Retried locally with
    /// backoff; nacked for redelivery after the retry budget is spent.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Non-auth 4xx, malformed payloads, missing parent rows. Acked and
    /// skipped with a warning.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// 401/403 from a provider. Fails the job and surfaces to the operator.
    #[error("provider rejected credentials: {0}")]
    AuthFailure(String),

    /// Constraint violation that survived upsert conflict resolution. Fails
    /// the job with its checkpoint for triage.
    #[error("data integrity violation: {0}")]
    DataIntegrity(String),

    /// Programmer error. Fails the job; redelivery will reproduce it.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EtlError {
    /// Worth an inline retry within the same message.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Skip-with-warning: ack the message and move on.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    /// Routes through `FailJob` rather than local recovery.
    pub fn fails_job(&self) -> bool {
        matches!(
            self,
            Self::AuthFailure(_) | Self::DataIntegrity(_) | Self::Internal(_)
        )
    }
}

pub type EtlResult<T> = Result<T, EtlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_is_disjoint() {
        let transient = EtlError::Transient("reset".into());
        assert!(transient.is_transient());
        assert!(!transient.fails_job());

        let auth = EtlError::AuthFailure("401".into());
        assert!(auth.fails_job());
        assert!(!auth.is_permanent());

        let rate = EtlError::RateLimited {
            resource: RateResource::Graphql,
            reset_at: None,
        };
        assert!(!rate.is_transient());
        assert!(!rate.fails_job());
    }
}
