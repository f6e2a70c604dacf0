//! # Main: CLI Entry Point
//!
//! Routes subcommands to the discovery coordinator. Handles the shared
//! concerns: `.env` loading, structured logging, configuration layering,
//! and the choice of store backend.
//!
//! ## Subcommands
//!
//! - `migrate`: create the PostgreSQL schema.
//! - `hunt`: simulate many concurrent requesters against the coordinator.
//!   Uses PostgreSQL when a database URL is configured, otherwise an
//!   in-process store.
//! - `list`: largest discovered primes with their owners.
//! - `mine`: primes owned by one identity.
//!
//! ## Global Options
//!
//! - `--database-url` / `DATABASE_URL`: PostgreSQL connection URL.
//! - `--config`: TOML file with discovery settings.
//! - `--chunk-size`, `--time-limit-ms`, `--max-attempts`: override the file.

mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "primeshare", about = "Hand out freshly discovered primes to concurrent requesters")]
pub struct Cli {
    /// PostgreSQL connection URL (or set DATABASE_URL env var)
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// TOML file with discovery settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Initial pool range and growth cap per step
    #[arg(long)]
    chunk_size: Option<u64>,

    /// Soft time budget for one discovery request, in milliseconds
    #[arg(long)]
    time_limit_ms: Option<u64>,

    /// Attempt ceiling for optimistic-concurrency operations
    #[arg(long)]
    max_attempts: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema
    Migrate,
    /// Run concurrent discovery requests and report what was handed out
    Hunt {
        /// Total number of discovery requests
        #[arg(long, default_value_t = 100)]
        requests: u64,
        /// Concurrent callers (rayon threads)
        #[arg(long, default_value_t = 8)]
        callers: usize,
        /// Owner assigned to every discovered prime (defaults to one identity per caller)
        #[arg(long)]
        owner: Option<String>,
        /// Print Prometheus metrics after the run
        #[arg(long)]
        print_metrics: bool,
    },
    /// List the largest discovered primes
    List {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// List the primes owned by one identity
    Mine {
        #[arg(long)]
        owner: String,
    },
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    // Structured logging: LOG_FORMAT=json for log shippers, human-readable otherwise
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }

    let cli = Cli::parse();
    let config = cli::load_config(&cli)?;

    match &cli.command {
        Commands::Migrate => cli::run_migrate(&cli),
        Commands::Hunt {
            requests,
            callers,
            owner,
            print_metrics,
        } => cli::run_hunt(&cli, config, *requests, *callers, owner.as_deref(), *print_metrics),
        Commands::List { limit } => cli::run_list(&cli, config, *limit),
        Commands::Mine { owner } => cli::run_mine(&cli, config, owner),
    }
}
