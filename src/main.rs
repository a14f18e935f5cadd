//! Statemig - Main entry point
//!
//! Read-only front end over a data directory managed by the migration
//! engine: status, history, audit trail and lock maintenance.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use statemig::cli::{Cli, Commands};
use statemig::{
    AuditEntry, AuditLogger, EngineConfig, HistoryEntry, HistoryStatus, LockManager, LockState,
    MigrationManager, Notifier,
};

/// Initialize the subscriber; RUST_LOG overrides the default `info` level.
/// Logs go to stderr so stdout stays parseable.
fn init_logger() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    init_logger();

    let cli = Cli::parse_args();
    debug!("CLI arguments parsed");

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = cli.engine_config()?;
    debug!(data_dir = %config.data_dir.display(), "Using engine configuration");

    match &cli.command {
        Commands::Status => print_status(&config),
        Commands::History { json } => print_history(&config, *json),
        Commands::Audit { json, .. } => {
            let query = cli.command.audit_query().unwrap_or_default();
            let entries = AuditLogger::read_file(&config.audit_path(), &query);
            if *json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                print_audit(&entries);
            }
            Ok(())
        }
        Commands::Unlock { force } => unlock(&config, *force),
    }
}

fn print_status(config: &EngineConfig) -> Result<()> {
    let manager = MigrationManager::new(config.clone());
    let status = manager
        .status()
        .context("Failed to read migration status")?;

    match status.current_version {
        Some(version) => println!("Current version: {}", version),
        None => println!("Current version: none"),
    }

    let applied: Vec<String> = status.applied.iter().map(|v| v.to_string()).collect();
    if applied.is_empty() {
        println!("Applied:         none");
    } else {
        println!("Applied:         {}", applied.join(", "));
    }

    let failed = manager
        .history()
        .iter()
        .filter(|e| e.status == HistoryStatus::Failed)
        .count();
    println!("Failed attempts: {}", failed);
    println!("Lock:            {}", describe_lock(&status.lock));
    Ok(())
}

fn print_history(config: &EngineConfig, json: bool) -> Result<()> {
    let manager = MigrationManager::new(config.clone());
    let entries = manager.history();

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No migrations recorded in {}", config.history_path().display());
        return Ok(());
    }

    println!(
        "{:<10} {:<12} {:>8}  {:<25} NAME",
        "VERSION", "STATUS", "MS", "APPLIED AT"
    );
    for entry in &entries {
        print_history_row(entry);
    }
    Ok(())
}

fn print_history_row(entry: &HistoryEntry) {
    println!(
        "{:<10} {:<12} {:>8}  {:<25} {}",
        entry.version.to_string(),
        entry.status.to_string(),
        entry.duration_ms,
        entry.applied_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        entry.name
    );
    if let Some(err) = &entry.error {
        println!("           error: {}", err);
    }
}

fn print_audit(entries: &[AuditEntry]) {
    if entries.is_empty() {
        println!("No matching audit entries");
        return;
    }

    for entry in entries {
        let version = entry
            .version
            .map(|v| v.to_string())
            .unwrap_or_else(|| "-".to_string());
        let dry_run = entry
            .details
            .as_ref()
            .and_then(|d| d.get("dryRun"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        println!(
            "{}  {:<14} {:<9} {:<10}{}{}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.operation.to_string(),
            entry.status.to_string(),
            version,
            entry.migration_name.as_deref().unwrap_or(""),
            if dry_run { " (dry run)" } else { "" }
        );
    }
}

fn describe_lock(state: &LockState) -> String {
    match state {
        LockState::Free => "free".to_string(),
        LockState::Held(p) => format!(
            "held by pid {} on {} since {}",
            p.pid,
            p.hostname,
            p.acquired_at.format("%Y-%m-%d %H:%M:%S UTC")
        ),
        LockState::Stale(p) => format!(
            "stale (pid {} on {}, {}s old)",
            p.pid,
            p.hostname,
            p.age().as_secs()
        ),
        LockState::Orphaned(p) => format!("orphaned (pid {} is gone)", p.pid),
        LockState::Corrupted { age: Some(age) } => {
            format!("corrupted ({}s old)", age.as_secs())
        }
        LockState::Corrupted { age: None } => "corrupted".to_string(),
    }
}

fn unlock(config: &EngineConfig, force: bool) -> Result<()> {
    let notifier = Arc::new(Notifier::new());
    let audit = AuditLogger::open(config.audit_path(), notifier.clone());
    let mut lock = LockManager::new(config, audit, notifier);

    let state = lock.inspect().context("Failed to inspect lock")?;
    if state == LockState::Free {
        println!("No lock file at {}", lock.path().display());
        return Ok(());
    }

    if !force && !state.is_reclaimable(config.stale_lock_threshold) {
        anyhow::bail!(
            "Lock is {}; refusing to remove it without --force",
            describe_lock(&state)
        );
    }

    info!(state = %describe_lock(&state), force, "Removing lock file");
    lock.force_unlock()
        .with_context(|| format!("Failed to remove {}", lock.path().display()))?;
    println!("Removed lock file ({})", describe_lock(&state));
    Ok(())
}
