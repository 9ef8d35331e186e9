//! pulse — operations tooling for the ETL pipeline.
//!
//! `serve` runs the scheduler and the stage worker pools until interrupted;
//! the remaining subcommands are one-shot operator actions. Exit codes:
//! 0 success, 1 runtime error, 2 usage error.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context as _};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pulse_core::keyring::Keyring;
use pulse_core::{
    ids, ControlFlags, EmbedSpec, Envelope, Payload, ProviderKind, PulseConfig, RelayFlags,
    SystemClock,
};
use pulse_etl::{EtlContext, Orchestrator, PgChainingSink, ProgressBroadcaster, Scheduler};
use pulse_postgres::{
    EntityRepository, JobRepository, RawDataRepository, SettingsRepository, TenantRepository,
    VectorRefRepository,
};
use pulse_queue::{Broker, PgBroker, QueueName};

#[derive(Parser)]
#[command(name = "pulse", about = "Multi-tenant ETL pipeline operations", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler and stage worker pools until interrupted.
    Serve,
    /// Run one orchestrator tick and exit.
    TickOnce,
    /// Set a job to PENDING so the next tick starts it.
    Trigger { tenant: String, job_name: String },
    /// Pause a job (preserves its ladder position).
    Pause { tenant: String, job_name: String },
    /// Resume a paused job, restoring its prior status.
    Resume { tenant: String, job_name: String },
    /// Show the tenant's job ladder with per-step stage statuses.
    Status { tenant: String },
    /// Re-queue all rows of a table for embedding.
    ReplayEmbed { tenant: String, table: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let ctx = build_context().await?;
    match cli.command {
        Command::Serve => serve(ctx).await,
        Command::TickOnce => {
            let started = Orchestrator::new(ctx).tick_once().await?;
            println!("tick complete: {started} pipeline(s) seeded");
            Ok(())
        }
        Command::Trigger { tenant, job_name } => {
            let tenant_id = resolve_tenant(&ctx, &tenant).await?;
            let job = require_job(&ctx, tenant_id, &job_name).await?;
            ctx.jobs.trigger(tenant_id, job.id).await?;
            println!("job {job_name} set to PENDING for tenant {tenant_id}");
            Ok(())
        }
        Command::Pause { tenant, job_name } => {
            let tenant_id = resolve_tenant(&ctx, &tenant).await?;
            let job = require_job(&ctx, tenant_id, &job_name).await?;
            ctx.jobs.pause(tenant_id, job.id).await?;
            println!("job {job_name} paused");
            Ok(())
        }
        Command::Resume { tenant, job_name } => {
            let tenant_id = resolve_tenant(&ctx, &tenant).await?;
            let job = require_job(&ctx, tenant_id, &job_name).await?;
            ctx.jobs.resume(tenant_id, job.id).await?;
            println!("job {job_name} resumed");
            Ok(())
        }
        Command::Status { tenant } => {
            let tenant_id = resolve_tenant(&ctx, &tenant).await?;
            print_ladder(&ctx, tenant_id).await
        }
        Command::ReplayEmbed { tenant, table } => {
            let tenant_id = resolve_tenant(&ctx, &tenant).await?;
            replay_embed(&ctx, tenant_id, &table).await
        }
    }
}

async fn build_context() -> anyhow::Result<Arc<EtlContext>> {
    let config = PulseConfig::from_env().context("loading configuration")?;
    let pool = pulse_postgres::connect(&config.database_url)
        .await
        .context("connecting to the database")?;

    let clock = Arc::new(SystemClock);
    let progress = ProgressBroadcaster::default();
    let jobs = Arc::new(JobRepository::new(pool.clone()));
    let chain = Arc::new(PgChainingSink::new(
        jobs.clone(),
        clock.clone(),
        progress.clone(),
    ));
    let vector_gateway = Arc::new(
        pulse_connect::VectorGatewayClient::new(
            &config.vector_gateway_url,
            config.vector_gateway_fallback_url.as_deref(),
            config.vector_gateway_api_key.clone(),
        )
        .context("configuring the vector gateway client")?,
    );
    let keyring = Arc::new(Keyring::new(&config.signing_key));

    Ok(Arc::new(EtlContext {
        clock,
        broker: Arc::new(PgBroker::new(pool.clone())),
        jobs,
        raw: Arc::new(RawDataRepository::new(pool.clone())),
        entities: Arc::new(EntityRepository::new(pool.clone())),
        vectors: Arc::new(VectorRefRepository::new(pool.clone())),
        tenants: Arc::new(TenantRepository::new(pool.clone())),
        settings: Arc::new(SettingsRepository::new(pool)),
        keyring,
        chain,
        progress,
        vector_gateway,
        config,
    }))
}

async fn serve(ctx: Arc<EtlContext>) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let orchestrator = Arc::new(Orchestrator::new(ctx.clone()));
    let scheduler = Scheduler::new(
        orchestrator,
        Duration::from_secs(60),
        8,
    );

    let tenants = ctx.tenants.list_active().await?;
    let mut handles = Vec::new();
    for tenant in &tenants {
        info!(tenant_id = tenant.id, tier = tenant.tier.as_str(), "Starting workers");
        handles.extend(pulse_etl::worker::spawn_tenant_workers(
            ctx.clone(),
            tenant,
            shutdown_rx.clone(),
        ));
    }

    let scheduler_shutdown = shutdown_rx.clone();
    let scheduler_handle = tokio::spawn(async move { scheduler.run(scheduler_shutdown).await });

    tokio::signal::ctrl_c().await.context("waiting for SIGINT")?;
    info!("Shutdown requested; draining workers");
    shutdown_tx.send(true).ok();

    scheduler_handle.await.ok();
    for handle in handles {
        handle.await.ok();
    }
    Ok(())
}

async fn print_ladder(ctx: &EtlContext, tenant_id: i64) -> anyhow::Result<()> {
    let ladder = ctx.jobs.ladder(tenant_id).await?;
    if ladder.is_empty() {
        println!("no jobs for tenant {tenant_id}");
        return Ok(());
    }
    for job in ladder {
        println!(
            "[{:>2}] {:<16} {:<9} retries={} last_success={} {}",
            job.execution_order,
            job.job_name,
            job.status.as_str(),
            job.retry_count,
            job.last_success_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".into()),
            job.error_message.as_deref().unwrap_or(""),
        );
        for step in &job.steps {
            println!(
                "       - {:<24} extract={:<8} transform={:<8} embed={}",
                step.name,
                step.extraction.as_str(),
                step.transform.as_str(),
                step.embedding.as_str(),
            );
        }
    }
    Ok(())
}

async fn replay_embed(ctx: &EtlContext, tenant_id: i64, table: &str) -> anyhow::Result<()> {
    let envelope = Envelope {
        message_id: ids::new_message_id(),
        tenant_id,
        integration_id: None,
        job_id: None,
        provider: ProviderKind::Internal,
        step: "replay_embed".to_string(),
        payload: Payload::Embed(EmbedSpec::MappingTable {
            table: table.to_string(),
        }),
        flags: ControlFlags::seed(),
        relay: RelayFlags::default(),
        old_last_sync_date: None,
        new_last_sync_date: None,
    };
    ctx.broker
        .publish(&QueueName::embed(tenant_id), &envelope)
        .await?;
    println!("table {table} queued for re-embedding (tenant {tenant_id})");
    Ok(())
}

async fn resolve_tenant(ctx: &EtlContext, tenant: &str) -> anyhow::Result<i64> {
    if let Ok(id) = tenant.parse::<i64>() {
        return Ok(id);
    }
    let found = ctx
        .tenants
        .find_by_name(tenant)
        .await?
        .ok_or_else(|| anyhow!("tenant {tenant:?} not found"))?;
    Ok(found.id)
}

async fn require_job(
    ctx: &EtlContext,
    tenant_id: i64,
    job_name: &str,
) -> anyhow::Result<pulse_core::Job> {
    ctx.jobs
        .find_by_name(tenant_id, job_name)
        .await?
        .ok_or_else(|| anyhow!("job {job_name:?} not found for tenant {tenant_id}"))
}
