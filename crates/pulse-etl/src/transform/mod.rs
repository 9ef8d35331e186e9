//! Transform stage.
//!
//! Loads each raw record, parses the payload, upserts the normalized rows
//! and the raw `completed` flip in one transaction, then publishes embed
//! messages after commit. Completion markers pass straight through to the
//! embed queue with their flags intact. Redelivery of an already-completed
//! raw id is a no-op.

mod repohost;
mod tracker;

use std::sync::Arc;

use tracing::{debug, warn};

use pulse_core::{
    Clock, ControlFlags, EmbedSpec, Envelope, EtlError, EtlResult, FanOut, Payload, RawKind,
    StageStatus, TransformSpec,
};
use pulse_postgres::raw::RawRecord;
use pulse_queue::{Broker, QueueName};

use crate::context::EtlContext;

pub async fn handle(
    ctx: &Arc<EtlContext>,
    envelope: &Envelope,
    spec: &TransformSpec,
) -> EtlResult<()> {
    let Some(raw_data_id) = spec.raw_data_id else {
        return forward_completion(ctx, envelope).await;
    };

    let record = ctx.raw.load(envelope.tenant_id, raw_data_id).await?;
    if record.status == "completed" {
        // Duplicate publish or broker redelivery after a successful pass.
        debug!(raw_data_id, "Raw record already completed; dropping duplicate");
        return Ok(());
    }

    let result = match spec.data_type {
        RawKind::Project => tracker::transform_project(ctx, envelope, &record).await,
        RawKind::ProjectStatuses => {
            tracker::transform_project_statuses(ctx, envelope, &record).await
        }
        RawKind::WorkItem => tracker::transform_work_item(ctx, envelope, &record).await,
        RawKind::DevStatus => tracker::transform_dev_status(ctx, envelope, &record).await,
        RawKind::Repository => repohost::transform_repository(ctx, envelope, &record).await,
        RawKind::PullRequest => repohost::transform_pull_request(ctx, envelope, &record).await,
        RawKind::NestedPage => repohost::transform_nested_page(ctx, envelope, &record).await,
    };

    if let Err(e) = &result {
        if e.is_permanent() {
            // Record the skip so operators can replay the payload later.
            if let Err(mark_err) = ctx
                .raw
                .mark_failed(envelope.tenant_id, raw_data_id, &e.to_string(), ctx.clock.now())
                .await
            {
                warn!(raw_data_id, error = %mark_err, "Could not mark raw record failed");
            }
        }
    }

    if result.is_ok() && envelope.flags.last_item {
        mark_step_finished(ctx, envelope).await;
    }
    result
}

/// Completion marker in, completion marker out, flags preserved (including
/// `rate_limited`).
async fn forward_completion(ctx: &EtlContext, envelope: &Envelope) -> EtlResult<()> {
    debug!(
        tenant_id = envelope.tenant_id,
        rate_limited = envelope.flags.rate_limited,
        "Forwarding completion message to embed"
    );
    let message = envelope.derive(
        Payload::Embed(EmbedSpec::Completion),
        envelope.flags,
        envelope.relay,
    );
    ctx.broker
        .publish(&QueueName::embed(envelope.tenant_id), &message)
        .await?;
    if envelope.flags.last_item {
        mark_step_finished(ctx, envelope).await;
    }
    Ok(())
}

/// Publish one embed message per upserted row, flags fanned out from the
/// transform input. Zero rows with a terminal input still owe the embed
/// stage its completion marker.
pub(crate) async fn publish_embed_rows(
    ctx: &EtlContext,
    envelope: &Envelope,
    rows: &[(&str, String)],
) -> EtlResult<()> {
    let fan_out = FanOut::new(envelope.flags, rows.len());
    for (index, (table, external_id)) in rows.iter().enumerate() {
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

    if fan_out.completion_needed() {
        let message = envelope.derive(
            Payload::Embed(EmbedSpec::Completion),
            ControlFlags {
                first_item: false,
                ..envelope.flags
            },
            envelope.relay,
        );
        ctx.broker
            .publish(&QueueName::embed(envelope.tenant_id), &message)
            .await?;
    }
    Ok(())
}

pub(crate) fn require_integration(envelope: &Envelope) -> EtlResult<i64> {
    envelope
        .integration_id
        .ok_or_else(|| EtlError::Permanent("transform message carries no integration".into()))
}

async fn mark_step_finished(ctx: &EtlContext, envelope: &Envelope) {
    if let Some(job_id) = envelope.job_id {
        if let Err(e) = ctx
            .jobs
            .set_step_stage(
                envelope.tenant_id,
                job_id,
                &envelope.step,
                "transform",
                StageStatus::Finished,
            )
            .await
        {
            warn!(error = %e, "Could not update transform step status");
        }
        ctx.progress.stage(
            envelope.tenant_id,
            envelope.job_id,
            &envelope.step,
            "transform",
            StageStatus::Finished,
            Some(1.0),
        );
    }
}

/// Shared helper: the record's payload, with a permanent error on mismatch.
pub(crate) fn payload_object<'a>(record: &'a RawRecord) -> EtlResult<&'a serde_json::Value> {
    if record.payload.is_object() {
        Ok(&record.payload)
    } else {
        Err(EtlError::Permanent(format!(
            "raw record {} payload is not a JSON object",
            record.id
        )))
    }
}

/// Provider timestamps arrive as ISO-8601, either with a trailing `Z` or a
/// `+0000`-style offset. Normalized to UTC.
pub(crate) fn parse_provider_datetime(value: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(value)
        .or_else(|_| chrono::DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.3f%z"))
        .ok()
        .map(|dt| dt.with_timezone(&chrono::Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_datetimes_normalize_to_utc() {
        let zulu = parse_provider_datetime("2025-06-01T10:30:00Z").unwrap();
        assert_eq!(zulu.to_rfc3339(), "2025-06-01T10:30:00+00:00");

        let offset = parse_provider_datetime("2025-06-01T12:30:00.000+0200").unwrap();
        assert_eq!(offset, zulu);

        assert!(parse_provider_datetime("June 1st").is_none());
    }
}
