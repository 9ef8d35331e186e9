//! Core types for the pulse ETL pipeline.
//!
//! Everything the stages, the store, and the broker share lives here: the
//! job ladder types, the queue-message envelope, the terminal-flag fan-out
//! rules, the error taxonomy, and the small ambient services (clock, ids,
//! config, credential keyring).

pub mod clock;
pub mod config;
pub mod error;
pub mod flags;
pub mod ids;
pub mod job;
pub mod keyring;
pub mod message;
pub mod tenant;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::PulseConfig;
pub use error::{EtlError, EtlResult, RateResource};
pub use flags::FanOut;
pub use job::{Checkpoint, Job, JobStatus, JobStep, NestedCursorState, ParentContext, StageStatus};
pub use message::{
    ControlFlags, EmbedSpec, Envelope, ExtractSpec, NestedKind, Payload, RawKind, RelayFlags,
    TransformSpec,
};
pub use tenant::{Integration, IntegrationSettings, ProviderKind, Tenant, TenantTier};
