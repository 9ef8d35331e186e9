//! External provider clients.
//!
//! One client per provider kind, all speaking JSON over reqwest. Each client
//! tracks the provider's most recent rate-limit headers and fails fast with a
//! typed rate-limit error when the remaining budget drops below the safety
//! threshold, so the extract stage can checkpoint instead of burning the last
//! requests.

pub mod error;
pub mod rate_limit;
pub mod repohost;
pub mod tracker;
pub mod vector_gateway;

pub use error::ConnectError;
pub use rate_limit::{RateLimitSnapshot, SAFETY_THRESHOLD};
pub use repohost::{GraphPage, NestedPageInfo, RepoHostClient};
pub use tracker::{IssueTrackerClient, WorkItemPage};
pub use vector_gateway::{EmbedOutcome, VectorGatewayClient};
