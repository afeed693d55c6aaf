//! Exam sync operator tool
//!
//! Inspects and drains the local exam queue on a proctoring workstation:
//! queue statistics, a deadline-bounded flush, dead-letter inspection and
//! requeue, and a backend liveness probe.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use exam_sync::{
    Backend, Collection, ConnectivityMonitor, DurableStore, ExamSyncConfig, HttpBackend, HttpProbe,
    Probe, StoreStats, SyncEngine,
};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{
    fmt::{self, time::ChronoUtc},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Local exam queue management
#[derive(Parser, Debug)]
#[command(name = "exam-sync")]
#[command(about = "Inspect, flush and repair the offline exam submission queue")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "EXAM_SYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show per-collection queue counters
    Status {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },
    /// Deliver everything stored locally before the deadline
    Flush {
        /// Overall deadline in milliseconds
        #[arg(long, default_value = "30000")]
        deadline_ms: u64,
    },
    /// List records that are no longer retried automatically
    DeadLetters {
        /// Restrict to one collection
        #[arg(long)]
        collection: Option<Collection>,
    },
    /// Put dead-lettered records back in the queue
    Requeue {
        /// Restrict to one collection
        collection: Option<Collection>,
    },
    /// Delete every stored record
    Purge {
        /// Confirm that undelivered data may be lost
        #[arg(long)]
        yes: bool,
    },
    /// Check whether the backend answers its liveness endpoint
    Probe,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    init_tracing(cli.verbose);

    let config = ExamSyncConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Status { json } => status(&config, json).await,
        Command::Flush { deadline_ms } => flush(&config, Duration::from_millis(deadline_ms)).await,
        Command::DeadLetters { collection } => dead_letters(&config, collection).await,
        Command::Requeue { collection } => requeue(&config, collection).await,
        Command::Purge { yes } => purge(&config, yes).await,
        Command::Probe => probe(&config).await,
    }
}

fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let is_production = env::var("EXAM_SYNC_ENV").map(|v| v == "production").unwrap_or(false);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("exam_sync={},sqlx=warn,reqwest=info", level).into());

    if is_production {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(false)
                    .json(),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

async fn open_store(config: &ExamSyncConfig) -> Result<Arc<DurableStore>> {
    let store = DurableStore::open(&config.store)
        .await
        .with_context(|| format!("Failed to open queue at {}", config.store.db_path))?;
    Ok(Arc::new(store))
}

fn selected(collection: Option<Collection>) -> Vec<Collection> {
    match collection {
        Some(c) => vec![c],
        None => Collection::DRAIN_ORDER.to_vec(),
    }
}

async fn status(config: &ExamSyncConfig, json: bool) -> Result<()> {
    let store = open_store(config).await?;
    let stats = store.stats().await?;
    store.check_retention(chrono::Utc::now()).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        print_stats(store.node_id().to_string().as_str(), &stats);
    }
    Ok(())
}

fn print_stats(node_id: &str, stats: &StoreStats) {
    println!("{} {}", "Node:".bright_cyan(), node_id.bright_white());
    println!(
        "{:<14} {:>8} {:>9} {:>6} {:>12}  {}",
        "collection", "pending", "in_flight", "dead", "bytes", "oldest"
    );
    for (collection, entry) in &stats.collections {
        let oldest = entry
            .oldest_saved_at
            .map_or_else(|| "-".to_string(), |ts| ts.to_rfc3339());
        let dead = if entry.dead_lettered > 0 {
            entry.dead_lettered.to_string().bright_red()
        } else {
            entry.dead_lettered.to_string().normal()
        };
        println!(
            "{:<14} {:>8} {:>9} {:>6} {:>12}  {}",
            collection.as_str(),
            entry.pending,
            entry.in_flight,
            dead,
            entry.bytes,
            oldest
        );
    }
    println!(
        "{} {} records, {} bytes",
        "Total:".bright_cyan(),
        stats.total_records(),
        stats.total_bytes()
    );
}

async fn flush(config: &ExamSyncConfig, deadline: Duration) -> Result<()> {
    let store = open_store(config).await?;
    let backend: Arc<dyn Backend> =
        Arc::new(HttpBackend::new(&config.sync).context("Failed to build HTTP backend")?);
    let probe: Arc<dyn Probe> = Arc::new(
        HttpProbe::new(&config.sync, &config.connectivity).context("Failed to build liveness probe")?,
    );
    let monitor = Arc::new(ConnectivityMonitor::new(probe, config.connectivity.clone()));
    let engine = SyncEngine::new(Arc::clone(&store), backend, monitor, config.sync.clone());

    info!(deadline_ms = %deadline.as_millis(), "Flushing local queue");
    let report = engine.flush_all(deadline).await?;

    println!(
        "{} delivered={} remaining={} dead_lettered={} rounds={}",
        "Flush:".bright_cyan(),
        report.delivered,
        report.remaining,
        report.dead_lettered,
        report.rounds
    );

    if report.is_complete() {
        println!("{}", "All records acknowledged by the backend".bright_green());
        Ok(())
    } else if report.deadline_reached {
        bail!("Deadline reached with {} records still stored", report.remaining)
    } else {
        bail!("{} records still stored, {} dead-lettered", report.remaining, report.dead_lettered)
    }
}

async fn dead_letters(config: &ExamSyncConfig, collection: Option<Collection>) -> Result<()> {
    let store = open_store(config).await?;
    let mut total = 0usize;

    for collection in selected(collection) {
        for record in store.list_dead_lettered(collection).await? {
            total += 1;
            println!(
                "{:<14} {:>8}  attempts={}  saved_at={}  error={}",
                collection.as_str(),
                record.local_id,
                record.attempts,
                record.saved_at.to_rfc3339(),
                record.last_error.as_deref().unwrap_or("-").bright_red()
            );
        }
    }

    if total == 0 {
        println!("{}", "No dead-lettered records".bright_green());
    }
    Ok(())
}

async fn requeue(config: &ExamSyncConfig, collection: Option<Collection>) -> Result<()> {
    let store = open_store(config).await?;
    let mut requeued = 0;

    for collection in selected(collection) {
        requeued += store.requeue_dead_lettered(collection).await?;
    }

    println!("{} {} records", "Requeued:".bright_cyan(), requeued);
    Ok(())
}

async fn purge(config: &ExamSyncConfig, yes: bool) -> Result<()> {
    if !yes {
        bail!("Refusing to delete undelivered exam data without --yes");
    }

    let store = open_store(config).await?;
    let remaining = store.count_remaining().await?;
    if remaining > 0 {
        tracing::warn!(remaining, "Purging records that were never acknowledged");
    }

    let mut cleared = 0;
    for collection in Collection::DRAIN_ORDER {
        cleared += store.clear(collection).await?;
    }
    store.vacuum().await?;

    println!("{} {} records", "Purged:".bright_yellow(), cleared);
    Ok(())
}

async fn probe(config: &ExamSyncConfig) -> Result<()> {
    let probe = HttpProbe::new(&config.sync, &config.connectivity).context("Failed to build liveness probe")?;
    let started = std::time::Instant::now();
    let up = tokio::time::timeout(config.connectivity.probe_timeout, probe.check())
        .await
        .unwrap_or(false);

    if up {
        println!(
            "{} {} ({} ms)",
            "Reachable:".bright_green(),
            probe.url(),
            started.elapsed().as_millis()
        );
        Ok(())
    } else {
        bail!("Backend liveness endpoint {} did not answer", probe.url())
    }
}
