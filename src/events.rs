//! Lifecycle notifications
//!
//! The engine publishes an enumerated set of events to registered observers
//! (a command-line front end, a progress bar, a test). Notifications are
//! informational only; nothing in the engine depends on an observer.
//!
//! Observers are snapshotted before each dispatch, so an observer that
//! registers another observer never mutates the list being iterated.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use strum::Display;
use uuid::Uuid;

use crate::audit::AuditEntry;
use crate::version::MigrationVersion;

/// Severity of a `MigrationEvent::Log` notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Everything the engine announces while it works
#[derive(Debug, Clone, PartialEq)]
pub enum MigrationEvent {
    /// `migrate:start` with the versions about to run
    MigrateStart { pending: Vec<MigrationVersion> },
    /// `migration:start`
    MigrationStart {
        version: MigrationVersion,
        name: String,
    },
    /// `migration:complete`
    MigrationComplete {
        version: MigrationVersion,
        name: String,
        duration: Duration,
    },
    /// `migration:error`
    MigrationError {
        version: MigrationVersion,
        name: String,
        error: String,
    },
    /// `rollback:start`
    RollbackStart {
        version: MigrationVersion,
        name: String,
    },
    /// `rollback:complete`
    RollbackComplete {
        version: MigrationVersion,
        name: String,
        duration: Duration,
    },
    /// `rollback:error`
    RollbackError {
        version: MigrationVersion,
        name: String,
        error: String,
    },
    /// `lock:acquired`
    LockAcquired { pid: u32, hostname: String },
    /// `lock:released`
    LockReleased { pid: u32 },
    /// `transaction:begin`
    TransactionBegin {
        transaction_id: Uuid,
        version: MigrationVersion,
    },
    /// `transaction:commit`
    TransactionCommit {
        transaction_id: Uuid,
        files: usize,
    },
    /// `transaction:rollback`
    TransactionRollback {
        transaction_id: Uuid,
        restored: usize,
        errors: usize,
    },
    /// `audit:entry`
    Audit(AuditEntry),
    /// generic `log`
    Log { level: LogLevel, message: String },
}

impl MigrationEvent {
    /// The dotted event name used by front ends
    pub fn name(&self) -> &'static str {
        match self {
            Self::MigrateStart { .. } => "migrate:start",
            Self::MigrationStart { .. } => "migration:start",
            Self::MigrationComplete { .. } => "migration:complete",
            Self::MigrationError { .. } => "migration:error",
            Self::RollbackStart { .. } => "rollback:start",
            Self::RollbackComplete { .. } => "rollback:complete",
            Self::RollbackError { .. } => "rollback:error",
            Self::LockAcquired { .. } => "lock:acquired",
            Self::LockReleased { .. } => "lock:released",
            Self::TransactionBegin { .. } => "transaction:begin",
            Self::TransactionCommit { .. } => "transaction:commit",
            Self::TransactionRollback { .. } => "transaction:rollback",
            Self::Audit(_) => "audit:entry",
            Self::Log { .. } => "log",
        }
    }
}

/// Receives engine notifications
pub trait MigrationObserver: Send + Sync {
    fn on_event(&self, event: &MigrationEvent);
}

impl<F> MigrationObserver for F
where
    F: Fn(&MigrationEvent) + Send + Sync,
{
    fn on_event(&self, event: &MigrationEvent) {
        self(event)
    }
}

/// Owned list of observers shared by the engine components
#[derive(Default)]
pub struct Notifier {
    observers: RwLock<Vec<Arc<dyn MigrationObserver>>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer
    pub fn subscribe(&self, observer: Arc<dyn MigrationObserver>) {
        if let Ok(mut observers) = self.observers.write() {
            observers.push(observer);
        }
    }

    /// Number of registered observers
    pub fn len(&self) -> usize {
        self.observers.read().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every observer registered at the time of the call
    pub fn emit(&self, event: MigrationEvent) {
        let snapshot: Vec<Arc<dyn MigrationObserver>> = match self.observers.read() {
            Ok(observers) => observers.clone(),
            Err(_) => return,
        };
        for observer in snapshot {
            observer.on_event(&event);
        }
    }

    /// Shorthand for a `MigrationEvent::Log`
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(MigrationEvent::Log {
            level,
            message: message.into(),
        });
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("observers", &self.len())
            .finish()
    }
}
