//! Browsession - Main entry point
//!
//! Browser session safekeeper daemon and its maintenance commands.

use anyhow::{Context, Result};
use browsession::daemon::shutdown::ShutdownCoordinator;
use browsession::detect;
use browsession::scheduler::events::TracingSink;
use browsession::scheduler::job::{BackupJob, JobOutcome, ProfileBackup};
use browsession::scheduler::Scheduler;
use browsession::snapshot::Trigger;
use browsession::{utils, Config};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (a template is written if it is missing)
    #[arg(short, long, value_name = "FILE", default_value = "browsession.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch the browser and keep snapshots (default)
    Run,
    /// Take one snapshot now, then apply retention
    Snapshot,
    /// Apply retention to the backup root
    Prune,
    /// List the snapshots in the backup root
    List,
    /// Print the browser state as the configured detector sees it
    State,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    let _log_guard = utils::logger::init(log_level, config.log.directory.as_deref())?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run_daemon(config).await,
        Command::Snapshot => snapshot_now(config).await,
        Command::Prune => prune(config).await,
        Command::List => list(&config),
        Command::State => state(&config),
    }
}

async fn run_daemon(config: Config) -> Result<()> {
    config.check_profile()?;
    std::fs::create_dir_all(&config.paths.backup_dirs_root).with_context(|| {
        format!(
            "Cannot create backup root {}",
            config.paths.backup_dirs_root.display()
        )
    })?;

    tracing::info!(
        "Starting browsession v{} ({} -> {})",
        env!("CARGO_PKG_VERSION"),
        config.paths.browser_profile.display(),
        config.paths.backup_dirs_root.display()
    );

    let probe = detect::build_probe(&config)?;
    let job = ProfileBackup::from_config(&config);
    let shutdown_coordinator = ShutdownCoordinator::new();

    let scheduler = Scheduler::new(
        probe,
        job,
        Arc::new(TracingSink),
        config.scheduler_settings(),
    );
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_coordinator.subscribe()));

    // Wait for shutdown signal
    shutdown_coordinator.wait_for_signal().await?;

    match scheduler_handle.await {
        Ok(()) => tracing::info!("Shutdown complete"),
        Err(e) => tracing::error!("Scheduler task panicked: {}", e),
    }

    Ok(())
}

async fn snapshot_now(config: Config) -> Result<()> {
    config.check_profile()?;
    let job = ProfileBackup::from_config(&config);

    let report = tokio::task::spawn_blocking(move || {
        job.run(Trigger::Manual, &CancellationToken::new())
    })
    .await??;

    match report.outcome {
        JobOutcome::Completed(result) => {
            println!("{} {} {}", result.id, result.status, result.path.display());
            for record in &result.per_file {
                println!(
                    "  {:<5} {:<40} {}",
                    format!("{:?}", record.category).to_lowercase(),
                    record.source,
                    serde_json::to_string(&record.outcome)?
                );
            }
        }
        JobOutcome::Skipped(reason) => println!("skipped: {}", reason),
    }
    if let Some(prune) = report.prune {
        println!("pruned: {}", serde_json::to_string(&prune)?);
    }
    Ok(())
}

async fn prune(config: Config) -> Result<()> {
    let job = ProfileBackup::from_config(&config);
    let report = tokio::task::spawn_blocking(move || job.prune()).await??;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn list(config: &Config) -> Result<()> {
    let job = ProfileBackup::from_config(config);
    let set = job.retention().scan()?;

    for entry in &set.snapshots {
        let status = entry
            .status
            .map_or_else(|| "unknown".to_string(), |s| s.to_string());
        println!(
            "{}  {:<9}  {:<8}  {}  {}{}",
            entry.id,
            format!("{:?}", entry.kind).to_lowercase(),
            status,
            entry.created_at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S"),
            entry.path.display(),
            if entry.compressed { "  [zst]" } else { "" }
        );
    }
    for orphan in &set.orphans {
        println!("unfinished  {}", orphan.display());
    }
    println!("{} snapshot(s) in {}", set.len(), set.root.display());
    Ok(())
}

fn state(config: &Config) -> Result<()> {
    let mut probe = detect::build_probe(config)?;
    println!("{} ({})", probe.observe(), probe.name());
    Ok(())
}
