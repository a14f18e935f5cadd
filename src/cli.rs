use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::audit::{AuditOperation, AuditQuery, AuditStatus};
use crate::config::EngineConfig;
use crate::version::MigrationVersion;

/// Statemig - inspect and maintain migration state on disk
///
/// Migrations themselves are code registered by the host application; this
/// tool only reads the history and audit files and manages the lock.
#[derive(Parser, Debug)]
#[command(name = "statemig")]
#[command(about = "Inspect migration history, audit trail and lock state")]
#[command(version)]
pub struct Cli {
    /// Data directory holding the lock, history and audit files
    #[arg(long, global = true, default_value = ".")]
    pub data_dir: PathBuf,

    /// Engine configuration file (JSON); takes precedence over --data-dir
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show the current version, applied versions and lock state
    Status,
    /// Print the migration history ledger
    History {
        /// Emit raw JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Print audit trail entries
    Audit {
        /// Only entries for this migration version
        #[arg(short, long)]
        migration: Option<MigrationVersion>,
        /// Only this operation (migrate, rollback, lock_acquired, ...)
        #[arg(short, long)]
        operation: Option<AuditOperation>,
        /// Only this status (started, completed, failed)
        #[arg(short, long)]
        status: Option<AuditStatus>,
        /// Keep only the most recent N entries
        #[arg(short, long)]
        limit: Option<usize>,
        /// Emit raw JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Remove an abandoned lock file
    Unlock {
        /// Remove the lock even if its owner looks alive
        #[arg(long)]
        force: bool,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Engine configuration selected by --config or --data-dir
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let config = match &self.config {
            Some(path) => EngineConfig::load_from_file(path)?,
            None => EngineConfig::new(&self.data_dir),
        };
        config
            .validate()
            .context("Invalid engine configuration")?;
        // The CLI never holds a lock long enough to need signal cleanup
        Ok(config.with_crash_handlers(false))
    }
}

impl Commands {
    /// Audit filter described by an `audit` subcommand
    pub fn audit_query(&self) -> Option<AuditQuery> {
        match self {
            Self::Audit {
                migration,
                operation,
                status,
                limit,
                ..
            } => Some(AuditQuery {
                version: *migration,
                operation: *operation,
                status: *status,
                limit: *limit,
                ..Default::default()
            }),
            _ => None,
        }
    }
}
