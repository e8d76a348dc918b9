use anyhow::{Context, Result};
use std::sync::Arc;
use stepiq_worker::{
    cli::{
        commands::{RotateKeysCommand, RunCommand, TriggerCommand, ValidateCommand, WorkerCommand},
        output::*,
        Cli, Command,
    },
    core::{PipelineDefinition, TriggerType},
    execution::{create_and_enqueue_run, RunOrchestrator},
    model::{GatewayModelClient, ModelClientConfig},
    persistence::Store,
    queue::{run_consumer, JobQueue, MemoryQueue},
    scheduler::{CronScheduler, DistributedLock, MemoryLock, StaticPlanLimits},
    settings::WorkerSettings,
    vault::{
        kms::{optional_provider, parse_master_key_hex, provider_from_settings},
        rotate_all_secrets, KeyProvider, KmsError,
    },
    webhook::{ReqwestTransport, RetryPolicy, WebhookDispatcher},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging; RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to set logging subscriber: {}", e))?;

    let settings = WorkerSettings::from_env();

    match &cli.command {
        Command::Worker(cmd) => run_worker(cmd, settings).await?,
        Command::Run(cmd) => run_once(cmd, settings).await?,
        Command::Trigger(cmd) => trigger_run(cmd, settings).await?,
        Command::RotateKeys(cmd) => rotate_keys(cmd, settings).await?,
        Command::Validate(cmd) => validate_definition(cmd)?,
    }

    Ok(())
}

#[cfg(feature = "sqlite")]
async fn open_store(settings: &WorkerSettings) -> Result<Arc<dyn Store>> {
    use stepiq_worker::persistence::SqliteStore;

    let store = match &settings.database_url {
        Some(url) => SqliteStore::new(url).await?,
        None => SqliteStore::with_default_path().await?,
    };
    Ok(Arc::new(store))
}

#[cfg(not(feature = "sqlite"))]
async fn open_store(_settings: &WorkerSettings) -> Result<Arc<dyn Store>> {
    warn!("Built without SQLite support; using an in-memory store");
    Ok(Arc::new(stepiq_worker::persistence::InMemoryStore::new()))
}

async fn open_queue(settings: &WorkerSettings) -> Result<Arc<dyn JobQueue>> {
    match &settings.redis_url {
        #[cfg(feature = "redis")]
        Some(url) => Ok(Arc::new(stepiq_worker::queue::RedisQueue::connect(url).await?)),
        #[cfg(not(feature = "redis"))]
        Some(_) => anyhow::bail!("STEPIQ_REDIS_URL is set but this build has no Redis support"),
        None => {
            warn!("STEPIQ_REDIS_URL not set; using an in-process queue (single process only)");
            Ok(Arc::new(MemoryQueue::new()))
        }
    }
}

async fn open_lock(settings: &WorkerSettings) -> Result<Arc<dyn DistributedLock>> {
    match &settings.redis_url {
        #[cfg(feature = "redis")]
        Some(url) => Ok(Arc::new(stepiq_worker::scheduler::RedisLock::connect(url).await?)),
        #[cfg(not(feature = "redis"))]
        Some(_) => anyhow::bail!("STEPIQ_REDIS_URL is set but this build has no Redis support"),
        None => Ok(Arc::new(MemoryLock::new())),
    }
}

/// The orchestrator starts without a KMS when none is configured; runs that
/// need a secret then fail with "Cannot decrypt secrets". A KMS that is
/// configured but broken stops startup.
fn build_kms(settings: &WorkerSettings) -> Result<Option<Arc<dyn KeyProvider>>> {
    let provider = optional_provider(&settings.kms).context("Invalid KMS configuration")?;
    if provider.is_none() {
        warn!("{}", KmsError::NotConfigured);
    }
    Ok(provider)
}

fn build_orchestrator(
    settings: &WorkerSettings,
    store: Arc<dyn Store>,
    cancel: &CancellationToken,
) -> Result<RunOrchestrator> {
    let mut config = ModelClientConfig::new().with_timeout(settings.model_timeout_secs);
    match &settings.model_gateway_url {
        Some(url) => config = config.with_endpoint(url),
        None => warn!("STEPIQ_MODEL_GATEWAY_URL not set; llm steps will fail"),
    }
    let model = GatewayModelClient::new(config).context("Failed to create model client")?;

    let webhooks = WebhookDispatcher::new(
        Arc::new(ReqwestTransport::new()),
        RetryPolicy::new(settings.webhook_max_attempts),
        settings.webhook_timeout,
    )
    .with_cancellation(cancel.clone());

    Ok(RunOrchestrator::new(store, Arc::new(model), build_kms(settings)?).with_webhooks(webhooks))
}

async fn run_worker(cmd: &WorkerCommand, settings: WorkerSettings) -> Result<()> {
    let cancel = CancellationToken::new();
    let store = open_store(&settings).await?;
    let queue = open_queue(&settings).await?;
    let orchestrator = Arc::new(build_orchestrator(&settings, Arc::clone(&store), &cancel)?);
    let concurrency = cmd.concurrency.unwrap_or(settings.worker_concurrency);

    println!("{} Worker starting (concurrency {})", ROCKET, style(concurrency).cyan());

    let consumer = tokio::spawn(run_consumer(
        Arc::clone(&queue),
        orchestrator,
        concurrency,
        cancel.clone(),
    ));

    let scheduler = if cmd.no_scheduler {
        info!("Scheduler disabled for this process");
        None
    } else {
        let scheduler = CronScheduler::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            open_lock(&settings).await?,
            Arc::new(StaticPlanLimits::new(settings.plan)),
            settings.scheduler,
        );
        let token = cancel.clone();
        Some(tokio::spawn(async move { scheduler.run(token).await }))
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    println!("{} Shutting down; waiting for in-flight runs", INFO);
    cancel.cancel();

    if let Some(scheduler) = scheduler {
        if let Err(e) = scheduler.await {
            error!("Scheduler task panicked: {}", e);
        }
    }
    if let Err(e) = consumer.await {
        error!("Consumer task panicked: {}", e);
    }

    println!("{} Worker stopped", CHECK);
    Ok(())
}

async fn run_once(cmd: &RunCommand, settings: WorkerSettings) -> Result<()> {
    let cancel = CancellationToken::new();
    let store = open_store(&settings).await?;
    let orchestrator = build_orchestrator(&settings, Arc::clone(&store), &cancel)?;

    println!("{} Executing run {}", SPINNER, style(cmd.run_id).dim());
    let (outcome, delivery) = orchestrator.execute_run_with_delivery(cmd.run_id).await?;

    if let Some(delivery) = delivery {
        match delivery.await {
            Ok(attempts) if attempts.last().is_some_and(|a| a.ok) => {
                println!("{} Webhook delivered", CHECK)
            }
            Ok(attempts) => println!(
                "{} Webhook not delivered after {} attempt(s)",
                WARN,
                attempts.len()
            ),
            Err(e) => error!("Webhook task panicked: {}", e),
        }
    }

    if cmd.steps {
        for step in store.list_step_executions(cmd.run_id).await? {
            println!("{}", format_step(&step));
        }
    }

    println!("{}", format_outcome(&outcome));
    if let stepiq_worker::RunOutcome::Completed {
        output: Some(output),
        ..
    } = &outcome
    {
        println!("{}", format_output(&serde_json::to_string_pretty(output)?, 20));
    }

    if matches!(outcome, stepiq_worker::RunOutcome::Failed { .. }) {
        std::process::exit(1);
    }
    Ok(())
}

async fn trigger_run(cmd: &TriggerCommand, settings: WorkerSettings) -> Result<()> {
    if !cmd.input.is_object() {
        anyhow::bail!("--input must be a JSON object");
    }

    let store = open_store(&settings).await?;
    let queue = open_queue(&settings).await?;
    let run = create_and_enqueue_run(
        store.as_ref(),
        queue.as_ref(),
        cmd.pipeline_id,
        TriggerType::Manual,
        cmd.input.clone(),
    )
    .await?;

    println!(
        "{} Created run {} (pipeline v{})",
        CHECK,
        style(run.id).cyan(),
        run.pipeline_version
    );
    if settings.redis_url.is_none() {
        println!(
            "{} No shared queue configured; execute it with `stepiq-worker run --run-id {}`",
            WARN, run.id
        );
    }
    Ok(())
}

async fn rotate_keys(cmd: &RotateKeysCommand, settings: WorkerSettings) -> Result<()> {
    let old_hex = std::env::var(&cmd.old_key_env)
        .with_context(|| format!("{} is not set", cmd.old_key_env))?;
    let old_key = parse_master_key_hex(&old_hex)?;

    let provider = provider_from_settings(&settings.kms)?;
    let new_key = provider.master_key(None).await?;
    let new_version = provider.current_version();

    if old_key[..] == new_key[..] {
        anyhow::bail!("Old and current master keys are identical; nothing to rotate");
    }

    let store = open_store(&settings).await?;
    println!(
        "{} Re-wrapping secrets to key version {} ({} provider)",
        INFO,
        style(new_version).cyan(),
        provider.name()
    );

    let report = rotate_all_secrets(store.as_ref(), &old_key[..], &new_key[..], new_version, cmd.dry_run).await?;
    println!("{}", format_rotation_report(&report));

    if !report.is_clean() {
        std::process::exit(1);
    }
    Ok(())
}

fn validate_definition(cmd: &ValidateCommand) -> Result<()> {
    println!("{} Validating pipeline...", INFO);

    match PipelineDefinition::from_file(&cmd.file) {
        Ok(definition) => {
            println!("{} Pipeline definition is valid!", CHECK);
            println!("{}", format_definition(&definition));

            if cmd.json {
                let json = serde_json::to_string_pretty(&definition)?;
                println!("\n{}", json);
            }
            Ok(())
        }
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(format!("{:#}", e)).red());
            std::process::exit(1);
        }
    }
}
