//! Stage worker pools.
//!
//! One pool per stage per tenant, sized by the tenant's tier quota. Each
//! worker polls its queue, dispatches to the stage handler under the
//! configured timeout, and acks/nacks according to the error taxonomy:
//! transient errors retry inline with backoff then nack for redelivery,
//! permanent errors are skipped with a warning, job-fatal errors fail the
//! job and ack.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use pulse_core::{Clock, Envelope, EtlError, EtlResult, Payload, Tenant};
use pulse_queue::{Broker, Delivery, QueueName};

use crate::context::EtlContext;
use crate::{embed, extract, transform};

/// Polling interval when the queue is empty.
const POLL_INTERVAL_MS: u64 = 100;

/// Backoff after a broker error.
const ERROR_BACKOFF_MS: u64 = 1000;

/// Inline retries for transient handler failures before nacking.
const MAX_INLINE_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Extract,
    Transform,
    Embed,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Self::Extract, Self::Transform, Self::Embed];

    pub fn queue(&self, tenant_id: i64) -> QueueName {
        match self {
            Self::Extract => QueueName::extraction(tenant_id),
            Self::Transform => QueueName::transform(tenant_id),
            Self::Embed => QueueName::embed(tenant_id),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extract => "extraction",
            Self::Transform => "transform",
            Self::Embed => "embedding",
        }
    }

    fn timeout(&self, ctx: &EtlContext) -> Duration {
        let secs = match self {
            Self::Extract => ctx.config.extract_timeout_secs,
            Self::Transform => ctx.config.transform_timeout_secs,
            Self::Embed => ctx.config.embed_timeout_secs,
        };
        Duration::from_secs(secs)
    }
}

/// Spawn the full worker set for one tenant: quota workers per stage.
pub fn spawn_tenant_workers(
    ctx: Arc<EtlContext>,
    tenant: &Tenant,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let quota = tenant.tier.worker_quota();
    let mut handles = Vec::new();
    for stage in Stage::ALL {
        for _ in 0..quota {
            let ctx = ctx.clone();
            let shutdown = shutdown.clone();
            let tenant_id = tenant.id;
            handles.push(tokio::spawn(async move {
                run_stage_worker(ctx, tenant_id, stage, shutdown).await;
            }));
        }
    }
    handles
}

/// Long-running consume loop for one stage of one tenant.
pub async fn run_stage_worker(
    ctx: Arc<EtlContext>,
    tenant_id: i64,
    stage: Stage,
    mut shutdown: watch::Receiver<bool>,
) {
    let queue = stage.queue(tenant_id);
    info!(tenant_id, stage = stage.as_str(), "Stage worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        match ctx.broker.poll(&queue).await {
            Ok(Some(delivery)) => {
                process_delivery(&ctx, tenant_id, stage, &queue, delivery).await;
            }
            Ok(None) => {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)) => {}
                    _ = shutdown.changed() => {}
                }
            }
            Err(e) => {
                error!(tenant_id, stage = stage.as_str(), error = %e, "Broker poll failed");
                tokio::time::sleep(Duration::from_millis(ERROR_BACKOFF_MS)).await;
            }
        }
    }
    info!(tenant_id, stage = stage.as_str(), "Stage worker shutting down");
}

async fn process_delivery(
    ctx: &Arc<EtlContext>,
    tenant_id: i64,
    stage: Stage,
    queue: &QueueName,
    delivery: Delivery,
) {
    let envelope = &delivery.envelope;
    debug!(
        tenant_id,
        stage = stage.as_str(),
        message_id = %envelope.message_id,
        step = %envelope.step,
        "Processing message"
    );

    // Messages of a paused job are parked: re-published with a fresh
    // delivery budget so a long pause never dead-letters the run.
    if let Some(job_id) = envelope.job_id {
        match ctx.jobs.status(tenant_id, job_id).await {
            Ok(Some(pulse_core::JobStatus::Paused)) => {
                debug!(job_id, "Job paused; parking message");
                if let Err(e) = ctx.broker.publish(queue, envelope).await {
                    error!(error = %e, "Could not park message of paused job");
                }
                if let Err(e) = ctx.broker.ack(queue, &delivery).await {
                    error!(error = %e, "Could not ack parked message");
                }
                tokio::time::sleep(Duration::from_millis(ERROR_BACKOFF_MS)).await;
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(job_id, error = %e, "Could not probe job status; processing anyway");
            }
        }
    }

    let mut attempt = 0u32;
    let outcome = loop {
        match dispatch_with_timeout(ctx, stage, envelope).await {
            Ok(()) => break Ok(()),
            Err(e) if e.is_transient() && attempt < MAX_INLINE_RETRIES => {
                attempt += 1;
                let backoff = backoff_with_jitter(attempt);
                warn!(
                    tenant_id,
                    stage = stage.as_str(),
                    attempt,
                    error = %e,
                    "Transient failure; retrying after {:?}",
                    backoff
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => break Err(e),
        }
    };

    let broker_result = match outcome {
        Ok(()) => ctx.broker.ack(queue, &delivery).await,
        Err(e) if e.is_transient() => {
            warn!(tenant_id, stage = stage.as_str(), error = %e, "Retries exhausted; nacking for redelivery");
            ctx.broker.nack(queue, &delivery, &e.to_string()).await
        }
        Err(e) if e.is_permanent() => {
            warn!(
                tenant_id,
                stage = stage.as_str(),
                message_id = %envelope.message_id,
                error = %e,
                "Skipping message"
            );
            ctx.broker.ack(queue, &delivery).await
        }
        Err(e) => {
            error!(tenant_id, stage = stage.as_str(), error = %e, "Fatal error; failing job");
            if let Some(job_id) = envelope.job_id {
                if let Err(fail_err) = ctx
                    .jobs
                    .fail(tenant_id, job_id, &e.to_string(), None, ctx.clock.now())
                    .await
                {
                    error!(job_id, error = %fail_err, "Could not record job failure");
                } else {
                    ctx.progress.job_status(tenant_id, job_id, "PENDING");
                }
            }
            ctx.broker.ack(queue, &delivery).await
        }
    };

    if let Err(e) = broker_result {
        error!(tenant_id, stage = stage.as_str(), error = %e, "Broker ack/nack failed");
    }
}

async fn dispatch_with_timeout(
    ctx: &Arc<EtlContext>,
    stage: Stage,
    envelope: &Envelope,
) -> EtlResult<()> {
    let work = dispatch(ctx, stage, envelope);
    match tokio::time::timeout(stage.timeout(ctx), work).await {
        Ok(result) => result,
        Err(_) => Err(EtlError::Transient(format!(
            "{} handler timed out",
            stage.as_str()
        ))),
    }
}

async fn dispatch(ctx: &Arc<EtlContext>, stage: Stage, envelope: &Envelope) -> EtlResult<()> {
    match (stage, &envelope.payload) {
        (Stage::Extract, Payload::Extract(spec)) => extract::handle(ctx, envelope, spec).await,
        (Stage::Transform, Payload::Transform(spec)) => {
            transform::handle(ctx, envelope, spec).await
        }
        (Stage::Embed, Payload::Embed(spec)) => embed::handle(ctx, envelope, spec).await,
        (stage, _) => Err(EtlError::Permanent(format!(
            "{} message delivered to the {} queue",
            payload_stage(envelope),
            stage.as_str()
        ))),
    }
}

fn payload_stage(envelope: &Envelope) -> &'static str {
    match envelope.payload {
        Payload::Extract(_) => "extract",
        Payload::Transform(_) => "transform",
        Payload::Embed(_) => "embed",
    }
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let base = 500u64.saturating_mul(1 << attempt.min(6));
    let jitter = rand::thread_rng().gen_range(0..250);
    Duration::from_millis(base + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_with_attempts() {
        let first = backoff_with_jitter(1);
        let third = backoff_with_jitter(3);
        assert!(first >= Duration::from_millis(1000));
        assert!(first < Duration::from_millis(1250));
        assert!(third >= Duration::from_millis(4000));
    }

    #[test]
    fn stage_queues_are_tenant_scoped() {
        assert_eq!(Stage::Extract.queue(7).as_str(), "extraction.7");
        assert_eq!(Stage::Transform.queue(7).as_str(), "transform.7");
        assert_eq!(Stage::Embed.queue(7).as_str(), "embed.7");
    }
}
