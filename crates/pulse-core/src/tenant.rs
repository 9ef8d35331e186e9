//! Tenant and integration types.
//!
//! Every row in the system is tenant-scoped; these are the identities the
//! scoping hangs off.

use serde::{Deserialize, Serialize};

/// Tenant tier, which determines per-stage worker quotas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantTier {
    Free,
    Standard,
    Premium,
}

impl TenantTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Standard => "standard",
            Self::Premium => "premium",
        }
    }

    /// Concurrent workers per stage for this tier.
    pub fn worker_quota(&self) -> usize {
        match self {
            Self::Free => 1,
            Self::Standard => 3,
            Self::Premium => 5,
        }
    }
}

impl TryFrom<String> for TenantTier {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "free" => Ok(Self::Free),
            "standard" => Ok(Self::Standard),
            "premium" => Ok(Self::Premium),
            _ => Err(format!("Unknown tenant tier: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: i64,
    pub name: String,
    pub tier: TenantTier,
    pub active: bool,
}

/// The kind of external provider an integration binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Issue tracker (projects, work items, changelogs).
    Issues,
    /// Source-code host (repositories, pull requests, nested edges).
    Repos,
    /// Downstream vectorizer endpoint.
    VectorGateway,
    /// Internal-only work (mapping-table re-embeds).
    Internal,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Issues => "issues",
            Self::Repos => "repos",
            Self::VectorGateway => "vector_gateway",
            Self::Internal => "internal",
        }
    }
}

impl TryFrom<String> for ProviderKind {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "issues" => Ok(Self::Issues),
            "repos" => Ok(Self::Repos),
            "vector_gateway" => Ok(Self::VectorGateway),
            "internal" => Ok(Self::Internal),
            _ => Err(format!("Unknown provider kind: {}", s)),
        }
    }
}

/// Provider-specific settings stored as JSON on the integration row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrationSettings {
    /// Organization to search under (repo host).
    #[serde(default)]
    pub organization: Option<String>,
    /// Project keys to sync (issue tracker).
    #[serde(default)]
    pub projects: Vec<String>,
    /// Repository name patterns to search for (repo host).
    #[serde(default)]
    pub repository_filters: Vec<String>,
    /// Embedding model requested from the vector gateway.
    #[serde(default)]
    pub vector_model: Option<String>,
}

/// A tenant's configured binding to an external provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Integration {
    pub id: i64,
    pub tenant_id: i64,
    pub provider: ProviderKind,
    pub base_url: String,
    /// Encrypted credential blob; decrypted through the keyring only.
    pub credentials: Option<String>,
    pub settings: IntegrationSettings,
    pub active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_quotas() {
        assert_eq!(TenantTier::Free.worker_quota(), 1);
        assert_eq!(TenantTier::Standard.worker_quota(), 3);
        assert_eq!(TenantTier::Premium.worker_quota(), 5);
    }

    #[test]
    fn settings_tolerate_missing_fields() {
        let settings: IntegrationSettings = serde_json::from_str("{}").unwrap();
        assert!(settings.projects.is_empty());
        assert!(settings.organization.is_none());
    }
}
