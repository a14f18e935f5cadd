//! Statemig Library
//!
//! Crash-safe, versioned migrations for a directory tree of configuration
//! and data files. A host application registers `Migration` descriptors and
//! calls `MigrationManager::migrate`; the engine serializes runs with a lock
//! file, protects every step with a file-level transaction and keeps a
//! history ledger plus an audit trail on disk.

pub mod audit;
pub mod cli;
pub mod config;
pub mod crash_guard;
pub mod error;
pub mod events;
pub mod history;
pub mod lock;
pub mod manager;
pub mod migration;
pub mod store;
pub mod transaction;
pub mod version;

// Re-export main types for convenience
pub use audit::{AuditEntry, AuditLogger, AuditOperation, AuditQuery, AuditStatus};
pub use config::EngineConfig;
pub use crash_guard::{LockRegistry, install_crash_handlers};
pub use error::{MigrationError, Result};
pub use events::{LogLevel, MigrationEvent, MigrationObserver, Notifier};
pub use history::{HistoryEntry, HistoryStatus, HistoryStore};
pub use lock::{LockManager, LockPayload, LockState};
pub use manager::{ChecksumMismatch, MigrationManager, MigrationResult, MigrationStatus};
pub use migration::{ContextLogger, Migration, MigrationContext, MigrationRegistry};
pub use transaction::{CommitReport, FileImage, RollbackReport, StateBackup, TransactionManager};
pub use version::MigrationVersion;
