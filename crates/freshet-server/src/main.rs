//! Freshet standalone server.
//!
//! Runs the built-in demo pipeline (commit-message length totals per
//! author) against an in-process log and serves interactive queries over
//! HTTP. Ctrl-C stops record intake, drains the in-flight batch, commits
//! offsets, and shuts the query endpoint down gracefully.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use freshet_core::executor::{ExecutorConfig, ShutdownSignal, StreamExecutor};
use freshet_core::source::{InMemoryLog, LogSource, OffsetTracker};
use freshet_core::state::{SharedStore, StoreRegistry};
use freshet_query::{http, InstanceAddr, QueryService, StaticDirectory};
use freshet_storage::{merge_committed_offsets, DurableStore};

mod config;
mod demo;

use config::ServerConfig;

/// Freshet - stream-processing runtime with interactive queries
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "freshet.toml")]
    config: PathBuf,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Bind address for the query endpoint (overrides the config file)
    #[arg(long)]
    listen: Option<String>,

    /// Keep and recover local state instead of starting clean.
    ///
    /// Only meaningful when the backing log outlives the process; the
    /// built-in demo log does not, so the default wipes state on start.
    #[arg(long)]
    keep_state: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("freshet={}", args.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting freshet server");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut server_config = ServerConfig::load(&args.config)?;
    if let Some(listen) = args.listen {
        server_config.listen_addr = listen;
    }
    let runtime = server_config.runtime.clone();
    info!(application_id = %runtime.application_id, listen = %server_config.listen_addr, "configured");

    let app_dir = runtime.application_state_dir();
    if !args.keep_state && app_dir.exists() {
        std::fs::remove_dir_all(&app_dir)
            .with_context(|| format!("failed to clean state dir {}", app_dir.display()))?;
        info!(dir = %app_dir.display(), "cleaned local state");
    }

    // Demo log and topology.
    let log = InMemoryLog::new();
    demo::create_topics(&log);
    demo::seed_records(&log)?;
    let topology = Arc::new(demo::build_topology(&runtime)?);
    info!(
        stores = ?topology.store_names(),
        topics = ?topology.source_topics(),
        "topology built"
    );

    // Open and recover durable stores before serving queries.
    let mut registry = StoreRegistry::new();
    let mut reports = Vec::new();
    for name in topology.store_names() {
        let mut store = DurableStore::open(
            &name,
            &app_dir.join(&name),
            runtime.changelog_sync_interval(),
        )?;
        store.enable_checkpointing(runtime.checkpoint_interval(), runtime.checkpoint_retained)?;
        let report = store.recover()?;
        reports.push(report);
        registry.register(SharedStore::new(name, Box::new(store)));
    }
    let registry = Arc::new(registry);

    // Resume the consumer group from recovered commit markers. The merge
    // takes the per-partition minimum, so a crash between store commits
    // re-processes at most one batch.
    if args.keep_state {
        let merged = merge_committed_offsets(&reports);
        if !merged.is_empty() {
            let tracker = OffsetTracker::from_string_map(&merged);
            let topics = topology.source_topics();
            let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            let mut consumer = log.consumer(&runtime.application_id);
            consumer.subscribe(&topic_refs)?;
            consumer.commit(&tracker.to_commit_map())?;
            info!(partitions = merged.len(), "seeded consumer offsets from commit markers");
        }
    }

    // Executor on its own worker thread.
    let shutdown = ShutdownSignal::new();
    let executor = StreamExecutor::new(
        Arc::clone(&topology),
        Box::new(log.consumer(&runtime.application_id)),
        Arc::clone(&registry),
        Some(Arc::new(log.clone())),
        ExecutorConfig::from(&runtime),
        shutdown.clone(),
    )?;
    let executor_handle = executor.spawn();

    // Query service over the same stores, with peer routing.
    let local = InstanceAddr::from(server_config.listen_addr.as_str());
    let mut instances: Vec<InstanceAddr> = server_config
        .peers
        .iter()
        .map(|peer| InstanceAddr::from(peer.as_str()))
        .collect();
    instances.push(local.clone());
    // All instances must agree on the order for ownership to line up.
    instances.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    instances.dedup();
    let directory = StaticDirectory::new(instances);
    let service = QueryService::new(
        Arc::clone(&registry),
        Arc::new(directory),
        local,
        runtime.replay_policy,
    );

    http::serve(&server_config.listen_addr, service, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    })
    .await?;

    // Query endpoint is down; stop the stream side: no new records, drain
    // the in-flight batch, commit, release store handles.
    shutdown.trigger();
    match executor_handle.join() {
        Ok(result) => result?,
        Err(_) => bail!("executor thread panicked"),
    }

    info!("freshet server stopped");
    Ok(())
}
