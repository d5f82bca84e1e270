//! avsync Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Multi-tenant synchronisation of flight operations data from an operator's
//! operational system into a relational target store.
//!
//! # Overview
//!
//! A run executes dependency-ordered stages, one per entity type:
//!
//! - **Reference data**: aircraft categories, aircraft types, aircraft (`setup`)
//! - **Crew**: personnel, incremental by checkpoint
//! - **Operations**: flight legs, aircraft events, crew assignments, personnel events
//!
//! Every stage extracts pages from the [`source::SourceClient`], normalises
//! and reference-resolves them ([`transform`]), upserts them idempotently
//! ([`load`]) and advances a per-(operator, stage) checkpoint. The
//! [`runner::RunController`] aggregates the outcome into a [`RunResult`].
//!
//! # Example
//!
//! ```no_run
//! use avsync_ingest::{run_pipeline, Command, MemoryStore, OperatorId, PipelineConfig};
//! use avsync_ingest::config::SourceConfig;
//! use avsync_ingest::source::HttpSourceClient;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let source = Arc::new(HttpSourceClient::new(&SourceConfig {
//!         base_url: "https://ops.example.com".into(),
//!         client_id: "id".into(),
//!         client_secret: "secret".into(),
//!         timeout_secs: 20,
//!     })?);
//!     let store = Arc::new(MemoryStore::new());
//!     let operator = OperatorId::new("acme")?;
//!
//!     let result = run_pipeline(
//!         source,
//!         store.clone(),
//!         store,
//!         PipelineConfig::default(),
//!         &operator,
//!         Command::Setup,
//!         CancellationToken::new(),
//!     )
//!     .await;
//!     println!("{}", serde_json::to_string_pretty(&result)?);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod extract;
pub mod load;
pub mod lookup;
pub mod runner;
pub mod source;
pub mod stage;
pub mod store;
pub mod transform;
pub mod types;

// Re-export commonly used types
pub use config::{OperatorConfig, PipelineConfig, PrerequisitePolicy};
pub use error::{ErrorKind, PipelineError, RecordError, SourceError, StoreError};
pub use runner::{run_pipeline, RunController};
pub use stage::{Command, Stage, StageGraph};
pub use store::{CheckpointStore, MemoryStore, PgStore, TargetStore};
pub use types::{OperatorId, RunResult, RunStatus, StageResult, StageStatus};

use avsync_common::time::parse_timestamp;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// avsync - flight operations data synchronisation
#[derive(Parser, Debug)]
#[command(name = "avsync-ingest")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Directory holding the `.env.<operator>` files
    #[arg(long, env = "AVSYNC_ENV_DIR", default_value = ".", global = true)]
    pub env_dir: PathBuf,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Synchronise an operator
    Run {
        /// Operator to synchronise
        #[arg(short, long)]
        operator: OperatorId,

        /// Stage group or single stage (e.g. "setup", "crew-only", "flight-legs")
        #[arg(default_value = "full")]
        command: Command,
    },

    /// Inspect or override stage checkpoints
    Checkpoints {
        #[command(subcommand)]
        command: CheckpointCommand,
    },
}

/// Checkpoint administration subcommands
#[derive(Subcommand, Debug)]
pub enum CheckpointCommand {
    /// List the checkpoints of an operator
    List {
        #[arg(short, long)]
        operator: OperatorId,
    },

    /// Move or delete a stage checkpoint
    Reset {
        #[arg(short, long)]
        operator: OperatorId,

        #[arg(short, long)]
        stage: Stage,

        /// New watermark; the checkpoint is deleted when omitted
        #[arg(long, value_parser = parse_watermark)]
        to: Option<DateTime<Utc>>,
    },
}

fn parse_watermark(value: &str) -> Result<DateTime<Utc>, String> {
    parse_timestamp(value).map_err(|err| err.to_string())
}
