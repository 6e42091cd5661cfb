//! rivven-trigger - Change-feed trigger runner
//!
//! Watches the tables listed in a YAML file and writes every change batch to
//! stdout as JSON lines.
//!
//! # Usage
//!
//! ```bash
//! # Run every binding until Ctrl-C
//! rivven-trigger -c trigger.yaml
//!
//! # Validate configuration
//! rivven-trigger -c trigger.yaml validate
//!
//! # Show pending changes and the worker count they call for
//! rivven-trigger -c trigger.yaml scale
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use rivven_trigger::common::{
    desired_workers, LeasesTable, OwnerId, ScaleEstimator, ScaleTarget, VersionStore,
};
use rivven_trigger::sqlserver::{
    SqlServerClient, SqlServerConfig, SqlServerLeaseStore, SqlServerVersionStore,
};
use rivven_trigger::{
    ChangeBatch, ChangeHandler, ChangeTrigger, HandlerError, PartitionKey, PollingConfig,
    TableName, TriggerConfig, TriggerEvent, TriggerHandle,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "rivven-trigger")]
#[command(version, about = "Change-feed triggers for change-tracked tables")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "trigger.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Take polling options from RIVVEN_TRIGGER_* environment variables
    /// instead of the `polling` section
    #[arg(long)]
    polling_from_env: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every binding until interrupted (default)
    Run,
    /// Validate configuration file
    Validate,
    /// Print pending changes and desired worker count per binding
    Scale,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = TriggerConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
    if cli.polling_from_env {
        config.polling =
            PollingConfig::from_env().context("Invalid RIVVEN_TRIGGER_* polling settings")?;
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::Validate => validate(&config),
        Commands::Scale => scale(config).await,
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("rivven_trigger=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rivven_trigger=info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn sqlserver_config(config: &TriggerConfig) -> Result<SqlServerConfig> {
    let section = config
        .sqlserver
        .clone()
        .context("Missing `sqlserver` section in configuration")?;
    Ok(SqlServerConfig::from_yaml_value(section)?)
}

fn validate(config: &TriggerConfig) -> Result<()> {
    let sqlserver = sqlserver_config(config)?;

    println!("Configuration valid (version {})", config.version);
    println!("SQL Server: {}", sqlserver.endpoint());
    println!("Polling: {}", config.polling.format());
    println!("Lease duration: {:?}", config.lease.duration());
    println!("Poison batch policy: {:?}", config.scheduler.poison_batch);
    println!("Bindings:");
    for binding in &config.bindings {
        let table = TableName::parse(&binding.table)?;
        let leases = LeasesTable::for_table(&table, binding.leases_table.as_deref());
        println!(
            "  {} -> consumer group '{}' (leases {})",
            table, binding.consumer_group, leases
        );
    }
    Ok(())
}

async fn run(config: TriggerConfig) -> Result<()> {
    let sqlserver = sqlserver_config(&config)?;
    info!("Starting rivven-trigger against {}", sqlserver.endpoint());

    let client = Arc::new(
        SqlServerClient::connect(sqlserver)
            .await
            .context("Failed to connect to SQL Server")?,
    );
    let versions: Arc<dyn VersionStore> = Arc::new(SqlServerVersionStore::new(client.clone()));
    let owner = OwnerId::new();
    let handler = Arc::new(JsonLinesHandler);

    let mut handles: Vec<TriggerHandle> = Vec::with_capacity(config.bindings.len());
    for binding in &config.bindings {
        let table = TableName::parse(&binding.table)?;
        let leases = SqlServerLeaseStore::new(
            client.clone(),
            LeasesTable::for_table(&table, binding.leases_table.as_deref()),
            config.lease.duration(),
        );

        let handle = ChangeTrigger::builder()
            .versions(versions.clone())
            .leases(Arc::new(leases))
            .table(table.clone())
            .consumer_group(&binding.consumer_group)
            .polling(config.polling.clone())
            .options(config.scheduler.clone())
            .owner(owner)
            .handler(handler.clone())
            .build()?
            .start()
            .await
            .with_context(|| format!("Failed to start trigger for {}", table))?;

        tokio::spawn(log_events(handle.subscribe()));
        handles.push(handle);
    }

    info!(owner = %owner, "Running {} binding(s), press Ctrl-C to stop", handles.len());

    let mut check = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
            _ = check.tick() => {
                if handles.iter().all(|h| h.is_finished()) {
                    warn!("Every binding has halted");
                    break;
                }
            }
        }
    }

    let mut failed = Vec::new();
    for handle in handles {
        let partition = handle.partition().clone();
        if let Err(e) = handle.stop().await {
            error!(partition = %partition, "Binding halted: {}", e);
            failed.push(partition);
        }
    }

    if failed.is_empty() {
        info!("rivven-trigger stopped");
        Ok(())
    } else {
        anyhow::bail!("{} binding(s) halted with errors", failed.len())
    }
}

async fn scale(config: TriggerConfig) -> Result<()> {
    let client = Arc::new(SqlServerClient::connect(sqlserver_config(&config)?).await?);
    let versions: Arc<dyn VersionStore> = Arc::new(SqlServerVersionStore::new(client.clone()));
    let max = config.polling.max_changes_per_worker();

    let mut estimator = ScaleEstimator::new(max);
    for binding in &config.bindings {
        let table = TableName::parse(&binding.table)?;
        let leases = SqlServerLeaseStore::new(
            client.clone(),
            LeasesTable::for_table(&table, binding.leases_table.as_deref()),
            config.lease.duration(),
        );
        estimator.add_target(ScaleTarget {
            partition: PartitionKey::new(table.to_string(), binding.consumer_group.clone()),
            table,
            versions: versions.clone(),
            leases: Arc::new(leases),
            metrics: None,
        });
    }

    let pending = estimator.pending_by_target().await?;
    let total: u64 = pending.iter().map(|(_, count)| count).sum();

    let bindings = pending
        .iter()
        .map(|(partition, count)| {
            Ok(serde_json::json!({
                "partition": partition.to_string(),
                "pending": count,
                "desired_workers": desired_workers(*count, max)?,
            }))
        })
        .collect::<rivven_trigger::Result<Vec<_>>>()?;

    let report = serde_json::json!({
        "max_changes_per_worker": max,
        "bindings": bindings,
        "pending": total,
        "desired_workers": desired_workers(total, max)?,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Writes each change as one JSON object per line on stdout
struct JsonLinesHandler;

#[async_trait]
impl ChangeHandler for JsonLinesHandler {
    async fn handle(&self, batch: &ChangeBatch) -> std::result::Result<(), HandlerError> {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        for change in batch.iter() {
            let line = serde_json::json!({
                "table": batch.partition.table,
                "consumer_group": batch.partition.consumer_group,
                "operation": change.operation.as_str(),
                "version": change.version,
                "key": change.primary_key,
                "row": change.payload,
            });
            writeln!(out, "{}", line)
                .map_err(|e| HandlerError::retryable(format!("stdout: {}", e)))?;
        }
        out.flush()
            .map_err(|e| HandlerError::retryable(format!("stdout: {}", e)))
    }
}

async fn log_events(mut events: tokio::sync::broadcast::Receiver<TriggerEvent>) {
    use tokio::sync::broadcast::error::RecvError;

    loop {
        match events.recv().await {
            Ok(TriggerEvent::Stopped { .. }) => break,
            Ok(event @ (TriggerEvent::PartitionStalled { .. } | TriggerEvent::Fatal { .. })) => {
                error!("{}", serde_json::to_string(&event).unwrap_or_default());
            }
            Ok(event) => {
                info!("{}", serde_json::to_string(&event).unwrap_or_default());
            }
            Err(RecvError::Lagged(skipped)) => warn!("Event log skipped {} events", skipped),
            Err(RecvError::Closed) => break,
        }
    }
}
