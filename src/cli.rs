//! # CLI Execution Functions
//!
//! Extracted from `main.rs` to keep the entry point slim. Contains the
//! execution logic for each subcommand: configuration layering, store
//! selection, the concurrent hunt, and the listing commands.

use anyhow::Result;
use primeshare::config::{self, DiscoveryConfig};
use primeshare::progress::Progress;
use primeshare::prom_metrics::Metrics;
use primeshare::store::memory::MemoryStore;
use primeshare::store::postgres::PgStore;
use primeshare::store::Store;
use primeshare::DiscoveryCoordinator;
use rayon::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::Cli;

/// Shown in listings for primes nobody has claimed ownership of.
const ANONYMOUS: &str = "ANONYMOUS";

const REPORT_INTERVAL: Duration = Duration::from_secs(10);

// ── Configuration ───────────────────────────────────────────────

/// Defaults, then the `--config` file, then individual flag overrides.
pub fn load_config(cli: &Cli) -> Result<DiscoveryConfig> {
    let mut config = match &cli.config {
        Some(path) => config::parse_toml_file(path)?,
        None => DiscoveryConfig::default(),
    };
    if let Some(chunk_size) = cli.chunk_size {
        config.chunk_size = chunk_size;
    }
    if let Some(time_limit_ms) = cli.time_limit_ms {
        config.time_limit_ms = time_limit_ms;
    }
    if let Some(max_attempts) = cli.max_attempts {
        config.max_attempts = max_attempts;
    }
    config.validate()?;
    Ok(config)
}

fn connect(cli: &Cli, max_connections: u32) -> Result<(tokio::runtime::Runtime, PgStore)> {
    let database_url = cli.database_url.as_deref().ok_or_else(|| {
        anyhow::anyhow!("DATABASE_URL is required (set via --database-url or env)")
    })?;
    let rt = tokio::runtime::Runtime::new()?;
    let store = rt.block_on(PgStore::connect(database_url, max_connections, rt.handle().clone()))?;
    Ok((rt, store))
}

// ── Subcommands ─────────────────────────────────────────────────

pub fn run_migrate(cli: &Cli) -> Result<()> {
    let (rt, store) = connect(cli, 1)?;
    rt.block_on(store.migrate())?;
    info!("schema ready");
    Ok(())
}

pub fn run_hunt(
    cli: &Cli,
    config: DiscoveryConfig,
    requests: u64,
    callers: usize,
    owner: Option<&str>,
    print_metrics: bool,
) -> Result<()> {
    let metrics = Arc::new(Metrics::new());
    let callers = callers.max(1);
    if cli.database_url.is_some() {
        let (rt, store) = connect(cli, callers as u32 + 2)?;
        rt.block_on(store.migrate())?;
        hunt(store, config, metrics, requests, callers, owner, print_metrics)
    } else {
        info!("no DATABASE_URL configured, using the in-process store");
        hunt(Arc::new(MemoryStore::new()), config, metrics, requests, callers, owner, print_metrics)
    }
}

pub fn run_list(cli: &Cli, config: DiscoveryConfig, limit: usize) -> Result<()> {
    let (_rt, store) = connect(cli, 1)?;
    let coordinator = DiscoveryCoordinator::new(store, config, Arc::new(Metrics::new()))?;
    print_primes(&coordinator.list_top_primes(limit)?);
    Ok(())
}

pub fn run_mine(cli: &Cli, config: DiscoveryConfig, owner: &str) -> Result<()> {
    let (_rt, store) = connect(cli, 1)?;
    let coordinator = DiscoveryCoordinator::new(store, config, Arc::new(Metrics::new()))?;
    let numbers = coordinator.list_primes_for_owner(owner)?;
    if numbers.is_empty() {
        println!("{} owns no primes", owner);
    }
    for number in numbers {
        println!("{}", number);
    }
    Ok(())
}

// ── Hunt ────────────────────────────────────────────────────────

/// Fire `requests` discovery calls from `callers` threads. Each discovered
/// prime is assigned to `owner`, or to the calling thread's identity.
fn hunt<S: Store + Clone>(
    store: S,
    config: DiscoveryConfig,
    metrics: Arc<Metrics>,
    requests: u64,
    callers: usize,
    owner: Option<&str>,
    print_metrics: bool,
) -> Result<()> {
    let coordinator = DiscoveryCoordinator::new(store, config, metrics.clone())?;
    let progress = Progress::new();
    let reporter = progress.start_reporter(REPORT_INTERVAL);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(callers)
        .thread_name(|i| format!("caller-{}", i))
        .build()?;

    info!(requests, callers, chunk_size = coordinator.config().chunk_size, "hunt starting");
    pool.install(|| {
        (0..requests).into_par_iter().for_each(|request| {
            let identity = owner.map(str::to_string).unwrap_or_else(|| {
                format!("caller-{}", rayon::current_thread_index().unwrap_or(0))
            });
            match coordinator.discover_prime() {
                Ok(Some(record)) => {
                    if let Err(e) = coordinator.assign_owner(&record, &identity) {
                        warn!(request, number = record.number, error = %e, "owner assignment failed");
                    }
                    progress.record_discovery(record.number);
                }
                Ok(None) => progress.record_timeout(),
                Err(e) => {
                    warn!(request, error = %e, "discovery request failed");
                    progress.record_fault();
                }
            }
        });
    });

    progress.stop();
    reporter
        .join()
        .map_err(|_| anyhow::anyhow!("progress reporter panicked"))?;
    progress.print_status();

    let snap = progress.snapshot();
    println!(
        "requests={} discovered={} timed_out={} faults={} largest={}",
        snap.requests, snap.discovered, snap.timed_out, snap.faults, snap.largest
    );
    print_primes(&coordinator.list_top_primes(10)?);
    if print_metrics {
        print!("{}", metrics.encode()?);
    }
    Ok(())
}

fn print_primes(rows: &[(u64, Option<String>)]) {
    if rows.is_empty() {
        println!("no primes discovered yet");
        return;
    }
    for (number, owner) in rows {
        println!("{:>12}  {}", number, owner.as_deref().unwrap_or(ANONYMOUS));
    }
}
