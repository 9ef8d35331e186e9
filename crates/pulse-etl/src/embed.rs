//! Embed stage.
//!
//! Locates each normalized row, requests an embedding for its canonical
//! text, and upserts the vector reference. A message with
//! `last_job_item=true` hands the run to the chaining sink; `rate_limited`
//! on that message returns the job to PENDING with its checkpoint instead of
//! finishing it. Also serves bulk mapping-table re-embeds.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use pulse_core::{
    Clock, ControlFlags, EmbedSpec, Envelope, EtlResult, FanOut, Payload, StageStatus,
};
use pulse_queue::{Broker, QueueName};

use crate::chain::JobChainingSink;
use crate::context::EtlContext;
use crate::text::canonical_text;

/// Model requested when the integration settings name none.
const DEFAULT_VECTOR_MODEL: &str = "pulse-embed-v1";

/// Changelog entries folded into a work item's canonical text.
const CHANGELOG_LINES: i64 = 20;

pub async fn handle(ctx: &Arc<EtlContext>, envelope: &Envelope, spec: &EmbedSpec) -> EtlResult<()> {
    match spec {
        EmbedSpec::Completion => {
            debug!(
                tenant_id = envelope.tenant_id,
                rate_limited = envelope.flags.rate_limited,
                "Terminal completion message reached embed"
            );
            finish_if_terminal(ctx, envelope).await
        }
        EmbedSpec::Row { table, external_id } => {
            embed_row(ctx, envelope, table, external_id).await?;
            finish_if_terminal(ctx, envelope).await
        }
        EmbedSpec::MappingTable { table } => replay_table(ctx, envelope, table).await,
    }
}

async fn embed_row(
    ctx: &Arc<EtlContext>,
    envelope: &Envelope,
    table: &str,
    external_id: &str,
) -> EtlResult<()> {
    let Some(source) = ctx
        .entities
        .source_row(envelope.tenant_id, table, external_id)
        .await?
    else {
        // Raced a late transaction or the row was deactivated meanwhile.
        warn!(
            tenant_id = envelope.tenant_id,
            table,
            external_id,
            "Row not found for embedding; skipping"
        );
        return Ok(());
    };

    let changelog = if table == "work_items" {
        ctx.entities
            .changelog_lines(envelope.tenant_id, external_id, CHANGELOG_LINES)
            .await?
    } else {
        Vec::new()
    };
    let text = canonical_text(&source, &changelog);
    let model = vector_model(ctx, envelope).await;

    let outcome = ctx
        .vector_gateway
        .embed(&model, &text)
        .await
        .map_err(pulse_core::EtlError::from)?;
    if outcome.degraded {
        ctx.progress
            .degraded(envelope.tenant_id, envelope.job_id, "fallback vector gateway in use");
    }

    // Deterministic point id, so re-embedding overwrites the stored vector.
    let point_key = format!("{}:{}:{}", envelope.tenant_id, table, external_id);
    let point_id = Uuid::new_v5(&Uuid::NAMESPACE_OID, point_key.as_bytes());
    let collection = format!("tenant-{}", envelope.tenant_id);
    ctx.vectors
        .upsert(
            envelope.tenant_id,
            table,
            external_id,
            &collection,
            point_id,
            ctx.clock.now(),
        )
        .await?;
    debug!(table, external_id, dims = outcome.vector.len(), "Vector reference upserted");
    Ok(())
}

/// Re-queue every active row of a mapping table for embedding, terminal
/// flags placed on the first and the K-th message.
async fn replay_table(ctx: &Arc<EtlContext>, envelope: &Envelope, table: &str) -> EtlResult<()> {
    let ids = ctx
        .entities
        .active_external_ids(envelope.tenant_id, table)
        .await?;
    info!(
        tenant_id = envelope.tenant_id,
        table,
        rows = ids.len(),
        "Bulk re-embed requested"
    );
    if ids.is_empty() {
        return Ok(());
    }

    let fan_out = FanOut::new(ControlFlags::seed(), ids.len());
    for (index, external_id) in ids.iter().enumerate() {
        let message = envelope.derive(
            Payload::Embed(EmbedSpec::Row {
                table: table.to_string(),
                external_id: external_id.clone(),
            }),
            fan_out.child(index),
            envelope.relay,
        );
        ctx.broker
            .publish(&QueueName::embed(envelope.tenant_id), &message)
            .await?;
    }
    Ok(())
}

/// The arrival of `last_job_item=true` is what completes a run. Outside a
/// job (bulk re-embeds) there is nothing to chain.
async fn finish_if_terminal(ctx: &Arc<EtlContext>, envelope: &Envelope) -> EtlResult<()> {
    if !envelope.flags.last_job_item {
        return Ok(());
    }
    let Some(job_id) = envelope.job_id else {
        return Ok(());
    };

    if let Err(e) = ctx
        .jobs
        .set_step_stage(
            envelope.tenant_id,
            job_id,
            &envelope.step,
            "embedding",
            StageStatus::Finished,
        )
        .await
    {
        warn!(error = %e, "Could not update embedding step status");
    }
    ctx.progress.stage(
        envelope.tenant_id,
        envelope.job_id,
        &envelope.step,
        "embedding",
        StageStatus::Finished,
        Some(1.0),
    );

    ctx.chain
        .complete_job(
            envelope.tenant_id,
            job_id,
            envelope.flags.rate_limited,
            envelope.new_last_sync_date,
        )
        .await
}

async fn vector_model(ctx: &EtlContext, envelope: &Envelope) -> String {
    if let Some(integration_id) = envelope.integration_id {
        if let Ok(Some(integration)) = ctx
            .tenants
            .integration(envelope.tenant_id, integration_id)
            .await
        {
            if let Some(model) = integration.settings.vector_model {
                return model;
            }
        }
    }
    DEFAULT_VECTOR_MODEL.to_string()
}
