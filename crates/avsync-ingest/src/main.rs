//! avsync Ingest - command-line entry point

mod env;

use anyhow::{Context, Result};
use avsync_common::logging::{init_logging, LogConfig, LogLevel};
use avsync_ingest::source::HttpSourceClient;
use avsync_ingest::{
    CheckpointCommand, Cli, Command, Commands, OperatorConfig, OperatorId, PgStore, RunController,
    RunStatus,
};
use clap::Parser;
use std::path::Path;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match execute(&cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {e:#}");
            RunStatus::Failed.exit_code()
        },
    };
    process::exit(code);
}

async fn execute(cli: &Cli) -> Result<i32> {
    let operator = match &cli.command {
        Commands::Run { operator, .. } => operator,
        Commands::Checkpoints { command } => match command {
            CheckpointCommand::List { operator } | CheckpointCommand::Reset { operator, .. } => {
                operator
            },
        },
    };

    let mut log_config = LogConfig::for_operator(operator.as_str());
    if cli.verbose {
        log_config.level = LogLevel::Debug;
    }
    // Environment variables take precedence
    let log_config = log_config.with_env_overrides()?;
    let _guard = init_logging(&log_config)?;

    let config = load_config(&cli.env_dir, operator)?;

    match &cli.command {
        Commands::Run { command, .. } => run(config, *command).await,
        Commands::Checkpoints { command } => {
            checkpoints(config, command).await?;
            Ok(0)
        },
    }
}

fn load_config(env_dir: &Path, operator: &OperatorId) -> Result<OperatorConfig> {
    match env::load_operator_env(env_dir, operator)? {
        Some(path) => info!(path = %path.display(), "Using operator environment file"),
        None => warn!(dir = %env_dir.display(), "No .env file found, using process environment"),
    }
    env::operator_config(operator.clone(), |key| std::env::var(key).ok())
}

async fn connect(config: &OperatorConfig) -> Result<Arc<PgStore>> {
    let store = PgStore::connect(&config.store).await?;
    store
        .ensure_schema()
        .await
        .context("Failed to prepare target schema")?;
    Ok(Arc::new(store))
}

async fn run(config: OperatorConfig, command: Command) -> Result<i32> {
    let store = connect(&config).await?;
    let source = Arc::new(HttpSourceClient::new(&config.source)?);
    let controller =
        RunController::new(source, store.clone(), store, config.pipeline.clone())?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            return;
        }
        warn!("Interrupt received, finishing the current batch");
        on_signal.cancel();
    });

    let result = controller.run(&config.operator, command, cancel).await;
    println!(
        "{}",
        serde_json::to_string_pretty(&result).context("Failed to serialise run result")?
    );
    Ok(result.status.exit_code())
}

async fn checkpoints(config: OperatorConfig, command: &CheckpointCommand) -> Result<()> {
    use avsync_ingest::CheckpointStore;

    let store = connect(&config).await?;
    match command {
        CheckpointCommand::List { operator } => {
            let checkpoints = store.list(operator).await?;
            println!("{}", serde_json::to_string_pretty(&checkpoints)?);
        },
        CheckpointCommand::Reset { operator, stage, to } => {
            let checkpoint = store.reset(operator, *stage, *to).await?;
            match &checkpoint {
                Some(c) => info!(stage = %stage, watermark = %c.watermark, "Checkpoint moved"),
                None => info!(stage = %stage, "Checkpoint deleted"),
            }
            println!("{}", serde_json::to_string_pretty(&checkpoint)?);
        },
    }
    Ok(())
}
