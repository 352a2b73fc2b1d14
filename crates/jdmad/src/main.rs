//! `jdmad`: the JDMA daemon.
//!
//! Opens the orchestrator store, registers the configured storage backends
//! and runs the scheduler until interrupted.
//!
//! # Usage
//!
//! ```text
//! jdmad start                               # run the scheduler
//! jdmad start -c jdma.toml                  # with a config file
//! jdmad status                              # request and batch counts
//! jdmad requests --batch 4                  # requests on one batch
//! jdmad quota set gws-climate objectstore 10TB
//! jdmad quota show gws-climate
//! jdmad backends                            # configured backends
//! ```

mod config;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jdma_engine::{LogNotifier, Orchestrator, QuotaLedger, RequestFilter};
use jdma_meta::MetaStore;
use jdma_scheduler::Scheduler;
use jdma_store::{
    BackendRegistry, DiskBackend, ObjectStoreBackend, RetryPolicy, StorageBackend, TapeBackend,
};
use jdma_types::{BackendId, BackendKind, BatchId, RequestState};
use tokio::sync::watch;
use tracing::{error, info};

use config::{BackendSection, CliConfig, parse_duration, parse_size};

// -----------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "jdmad", version, about = "JDMA batch transfer daemon")]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true, env = "JDMA_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until Ctrl-C.
    Start {
        /// Override data directory.
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Override staging directory.
        #[arg(short, long)]
        staging_dir: Option<PathBuf>,
    },

    /// Show request and batch counts from the local store.
    Status,

    /// List requests.
    Requests {
        /// Only requests on this batch.
        #[arg(short, long)]
        batch: Option<u64>,

        /// Include completed and failed requests.
        #[arg(short, long)]
        all: bool,
    },

    /// Workspace quota operations.
    Quota {
        #[command(subcommand)]
        action: QuotaCommands,
    },

    /// List configured storage backends.
    Backends,
}

#[derive(Subcommand)]
enum QuotaCommands {
    /// Set the allocation for a workspace on a backend.
    Set {
        workspace: String,
        backend: String,
        /// Size such as "10TB" or "500GB".
        size: String,
    },
    /// Show allocations, optionally for one workspace.
    Show { workspace: Option<String> },
}

// -----------------------------------------------------------------------
// Entrypoint
// -----------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = CliConfig::load(cli.config.as_deref()).context("failed to load config")?;

    setup_tracing(&config.log.level);

    match cli.command {
        Commands::Start {
            data_dir,
            staging_dir,
        } => {
            // CLI args override config file values.
            if let Some(dir) = data_dir {
                config.node.data_dir = dir;
            }
            if let Some(dir) = staging_dir {
                config.node.staging_dir = Some(dir);
            }
            cmd_start(config).await
        }
        Commands::Status => cmd_status(&config),
        Commands::Requests { batch, all } => cmd_requests(&config, batch, all),
        Commands::Quota { action } => match action {
            QuotaCommands::Set {
                workspace,
                backend,
                size,
            } => cmd_quota_set(&config, &workspace, &backend, &size),
            QuotaCommands::Show { workspace } => cmd_quota_show(&config, workspace.as_deref()),
        },
        Commands::Backends => cmd_backends(&config),
    }
}

/// Initialize the `tracing` subscriber with the given level filter.
///
/// Respects `RUST_LOG` env var if set, otherwise uses the config value.
fn setup_tracing(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

// -----------------------------------------------------------------------
// jdmad start
// -----------------------------------------------------------------------

async fn cmd_start(config: CliConfig) -> Result<()> {
    let orch_config = config.orchestrator_config()?;
    info!(
        data_dir = %config.node.data_dir.display(),
        staging_dir = %orch_config.staging_dir.display(),
        part_ceiling = orch_config.part_ceiling,
        staleness_window = ?orch_config.staleness_window,
        "starting jdmad"
    );

    std::fs::create_dir_all(&config.node.data_dir).context("failed to create data directory")?;
    std::fs::create_dir_all(&orch_config.staging_dir)
        .context("failed to create staging directory")?;

    let meta = Arc::new(MetaStore::open(config.meta_dir()).context("failed to open metadata store")?);
    let registry = build_registry(&config)?;
    let orch = Orchestrator::new(meta, registry, Arc::new(LogNotifier), orch_config);

    let active = orch.meta().active_requests()?.len();
    info!(active, "resuming active requests");

    let scheduler = Arc::new(Scheduler::new(orch));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run(shutdown_rx).await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    if let Err(e) = runner.await {
        error!(error = %e, "scheduler task failed");
    }
    let stats = scheduler.stats();
    info!(
        dispatched = stats.dispatched,
        advanced = stats.advanced,
        failed = stats.failed,
        stalled = stats.stalled,
        "jdmad stopped"
    );
    Ok(())
}

/// Build the backend registry from `[[backend]]` tables.
fn build_registry(config: &CliConfig) -> Result<BackendRegistry> {
    let mut registry = BackendRegistry::new();
    for section in config.backend_sections() {
        let backend = open_backend(&section, &config.node.data_dir)
            .with_context(|| format!("failed to open backend {:?}", section.name))?;
        let policy = retry_policy(&section)
            .with_context(|| format!("invalid retry settings for backend {:?}", section.name))?;
        let concurrency = section
            .concurrency
            .unwrap_or_else(|| BackendRegistry::default_concurrency(section.kind));
        registry.register_with(section.name.as_str(), backend, policy, concurrency);
    }
    Ok(registry)
}

fn open_backend(section: &BackendSection, data_dir: &Path) -> Result<Arc<dyn StorageBackend>> {
    let backend: Arc<dyn StorageBackend> = match section.kind {
        BackendKind::ObjectStore => {
            let capacity = match &section.capacity {
                Some(s) => parse_size(s)?,
                None => u64::MAX,
            };
            let bucket = section.bucket.clone().unwrap_or_else(|| section.name.clone());
            Arc::new(ObjectStoreBackend::new(bucket, capacity))
        }
        BackendKind::Disk => Arc::new(DiskBackend::new(section.root_in(data_dir))?),
        BackendKind::Tape => {
            let volume = section.volume.clone().unwrap_or_else(|| section.name.clone());
            let mut tape = TapeBackend::new(section.root_in(data_dir), volume)?;
            if let Some(drives) = section.drives {
                tape = tape.drives(drives);
            }
            if let Some(latency) = &section.recall_latency {
                tape = tape.recall_latency(parse_duration(latency)?);
            }
            Arc::new(tape)
        }
    };
    Ok(backend)
}

/// Kind defaults with any per-backend overrides applied.
fn retry_policy(section: &BackendSection) -> Result<RetryPolicy> {
    let mut policy = RetryPolicy::for_kind(section.kind);
    if let Some(attempts) = section.max_attempts {
        policy.max_attempts = attempts.max(1);
    }
    if let Some(s) = &section.min_backoff {
        policy.min_backoff = parse_duration(s)?;
    }
    if let Some(s) = &section.max_backoff {
        policy.max_backoff = parse_duration(s)?;
    }
    Ok(policy)
}

// -----------------------------------------------------------------------
// Inspection commands
// -----------------------------------------------------------------------

fn open_meta(config: &CliConfig) -> Result<Arc<MetaStore>> {
    let meta_path = config.meta_dir();
    let meta = MetaStore::open(&meta_path).map_err(|e| {
        error!(path = %meta_path.display(), %e, "failed to open metadata store");
        anyhow::anyhow!(
            "cannot open metadata at {}. Is the daemon running? ({e})",
            meta_path.display(),
        )
    })?;
    Ok(Arc::new(meta))
}

fn cmd_status(config: &CliConfig) -> Result<()> {
    let meta = open_meta(config)?;

    let mut by_state: BTreeMap<String, usize> = BTreeMap::new();
    for state in RequestState::ALL {
        let count = meta.requests_in_state(state)?.len();
        if count > 0 {
            by_state.insert(state.to_string(), count);
        }
    }
    println!("Requests:");
    if by_state.is_empty() {
        println!("  none");
    }
    for (state, count) in &by_state {
        println!("  {state:<14} {count}");
    }

    let mut by_stage: BTreeMap<String, usize> = BTreeMap::new();
    for batch in meta.list_batches()? {
        *by_stage.entry(batch.stage.to_string()).or_default() += 1;
    }
    println!("Batches:");
    if by_stage.is_empty() {
        println!("  none");
    }
    for (stage, count) in &by_stage {
        println!("  {stage:<14} {count}");
    }

    Ok(())
}

fn cmd_requests(config: &CliConfig, batch: Option<u64>, all: bool) -> Result<()> {
    let meta = open_meta(config)?;
    let filter = RequestFilter {
        batch_id: batch.map(BatchId::new),
        active_only: !all,
        ..RequestFilter::default()
    };

    let mut requests: Vec<_> = meta
        .list_requests()?
        .into_iter()
        .filter(|r| filter.matches(r))
        .collect();
    requests.sort_by_key(|r| r.id);

    if requests.is_empty() {
        println!("No requests.");
    }
    for request in &requests {
        let failure = request
            .failure
            .as_ref()
            .map(|f| format!(" failure={}", f.code()))
            .unwrap_or_default();
        println!(
            "  {} {} batch={} state={} requester={}{failure}",
            request.id, request.kind, request.batch_id, request.state, request.params.requester,
        );
    }
    Ok(())
}

fn cmd_quota_set(config: &CliConfig, workspace: &str, backend: &str, size: &str) -> Result<()> {
    let bytes = parse_size(size).context("invalid quota size")?;
    let backend = BackendId::from(backend);
    if !config.backend_sections().iter().any(|b| b.name == backend.as_str()) {
        anyhow::bail!("backend {backend} is not configured");
    }

    let ledger = QuotaLedger::new(open_meta(config)?);
    let record = ledger.set_allocation(workspace, &backend, bytes)?;
    println!(
        "{} on {}: allocated={} consumed={} reserved={}",
        record.workspace,
        record.backend,
        record.allocated,
        record.consumed,
        record.reserved(),
    );
    Ok(())
}

fn cmd_quota_show(config: &CliConfig, workspace: Option<&str>) -> Result<()> {
    let ledger = QuotaLedger::new(open_meta(config)?);
    let records: Vec<_> = ledger
        .all()?
        .into_iter()
        .filter(|r| workspace.is_none_or(|w| r.workspace == w))
        .collect();

    if records.is_empty() {
        println!("No quota allocations.");
    }
    for record in &records {
        println!(
            "  {} on {}: allocated={} consumed={} reserved={} available={}",
            record.workspace,
            record.backend,
            record.allocated,
            record.consumed,
            record.reserved(),
            record.available(),
        );
    }
    Ok(())
}

fn cmd_backends(config: &CliConfig) -> Result<()> {
    for section in config.backend_sections() {
        let concurrency = section
            .concurrency
            .unwrap_or_else(|| BackendRegistry::default_concurrency(section.kind));
        let policy = retry_policy(&section)?;
        println!(
            "  {} kind={} concurrency={} attempts={} backoff={:?}..{:?}",
            section.name,
            section.kind,
            concurrency,
            policy.max_attempts,
            policy.min_backoff,
            policy.max_backoff,
        );
    }
    Ok(())
}
