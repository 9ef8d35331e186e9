//! Stage context bundle.
//!
//! Explicit dependency injection: every stage handler receives this bundle
//! rather than reaching for process globals. Provider clients are built per
//! integration because each carries that integration's decrypted credential.

use std::sync::Arc;

use pulse_connect::{IssueTrackerClient, RepoHostClient, VectorGatewayClient};
use pulse_core::keyring::Keyring;
use pulse_core::{Clock, Envelope, EtlError, EtlResult, Integration, PulseConfig};
use pulse_postgres::{
    EntityRepository, JobRepository, RawDataRepository, SettingsRepository, TenantRepository,
    VectorRefRepository,
};
use pulse_queue::Broker;

use crate::chain::JobChainingSink;
use crate::progress::ProgressBroadcaster;

pub struct EtlContext {
    pub config: PulseConfig,
    pub clock: Arc<dyn Clock>,
    pub broker: Arc<dyn Broker>,
    pub jobs: Arc<JobRepository>,
    pub raw: Arc<RawDataRepository>,
    pub entities: Arc<EntityRepository>,
    pub vectors: Arc<VectorRefRepository>,
    pub tenants: Arc<TenantRepository>,
    pub settings: Arc<SettingsRepository>,
    pub keyring: Arc<Keyring>,
    pub chain: Arc<dyn JobChainingSink>,
    pub progress: ProgressBroadcaster,
    pub vector_gateway: Arc<VectorGatewayClient>,
}

impl EtlContext {
    /// The envelope's integration, verified present and active.
    pub async fn integration_for(&self, envelope: &Envelope) -> EtlResult<Integration> {
        let integration_id = envelope
            .integration_id
            .ok_or_else(|| EtlError::Permanent("message carries no integration".into()))?;
        let integration = self
            .tenants
            .integration(envelope.tenant_id, integration_id)
            .await?
            .ok_or_else(|| {
                EtlError::Permanent(format!("integration {integration_id} not found"))
            })?;
        if !integration.active {
            return Err(EtlError::AuthFailure(format!(
                "integration {integration_id} is inactive"
            )));
        }
        Ok(integration)
    }

    pub fn issue_tracker_for(&self, integration: &Integration) -> EtlResult<IssueTrackerClient> {
        let token = self.decrypt_credentials(integration)?;
        IssueTrackerClient::new(&integration.base_url, token).map_err(Into::into)
    }

    pub fn repo_host_for(&self, integration: &Integration) -> EtlResult<RepoHostClient> {
        let token = self.decrypt_credentials(integration)?;
        RepoHostClient::new(&integration.base_url, token).map_err(Into::into)
    }

    fn decrypt_credentials(&self, integration: &Integration) -> EtlResult<String> {
        let blob = integration.credentials.as_deref().ok_or_else(|| {
            EtlError::AuthFailure(format!("integration {} has no credentials", integration.id))
        })?;
        self.keyring
            .decrypt(blob)
            .map_err(|e| EtlError::AuthFailure(e.to_string()))
    }
}
