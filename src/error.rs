//! Error handling for the migration engine
//!
//! Provides the crate-wide error type using thiserror. Step failures never
//! escape `migrate`/`rollback` as errors; they are folded into a
//! `MigrationResult`. Only lock acquisition problems and malformed targets
//! abort an operation.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::lock::LockPayload;
use crate::version::MigrationVersion;

/// Main error type for the migration engine
#[derive(Error, Debug)]
pub enum MigrationError {
    /// The lock could not be acquired within the configured window
    #[error("Lock timeout: could not acquire {} within {:?}{}", path.display(), waited, describe_holder(holder))]
    LockTimeout {
        path: PathBuf,
        waited: Duration,
        holder: Option<LockPayload>,
    },

    /// Malformed version string (registration or target)
    #[error("Invalid version '{0}': expected MAJOR.MINOR.PATCH")]
    InvalidVersion(String),

    /// A migration with this version is already registered
    #[error("Duplicate migration: version {0} is already registered")]
    DuplicateMigration(MigrationVersion),

    /// A version referenced by the history has no registered descriptor
    #[error("Unknown migration version {0}: no migration registered")]
    UnknownVersion(MigrationVersion),

    /// A forward or backward step reported failure
    #[error("Migration {version} ({name}) failed: {message}")]
    StepFailed {
        version: MigrationVersion,
        name: String,
        message: String,
    },

    /// Non-fatal post-commit inconsistency
    #[error("Integrity warning: {0}")]
    Integrity(String),

    /// Transaction misuse (no open transaction, bad path)
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Lock file handling errors other than timeouts
    #[error("Lock error: {0}")]
    Lock(String),

    /// IO errors (lock, history, audit and backed-up files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn describe_holder(holder: &Option<LockPayload>) -> String {
    match holder {
        Some(payload) => format!(
            " (held by pid {} on {} since {})",
            payload.pid, payload.hostname, payload.acquired_at
        ),
        None => String::new(),
    }
}

/// Result type alias for migration engine operations
pub type Result<T> = std::result::Result<T, MigrationError>;

impl MigrationError {
    /// Create an invalid version error
    pub fn invalid_version(raw: impl Into<String>) -> Self {
        Self::InvalidVersion(raw.into())
    }

    /// Create a transaction error
    pub fn transaction(msg: impl Into<String>) -> Self {
        Self::Transaction(msg.into())
    }

    /// Create a lock error
    pub fn lock(msg: impl Into<String>) -> Self {
        Self::Lock(msg.into())
    }

    /// Create an integrity warning
    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::Integrity(msg.into())
    }

    /// Returns true for the only error that aborts before any mutation
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }
}
