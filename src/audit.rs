//! Append-only audit trail
//!
//! Every lifecycle operation (lock acquire/release, migrate, rollback,
//! state backup/restore) is recorded as an immutable `AuditEntry`. The full
//! list is rewritten to disk after each append so the file is always a valid
//! JSON array.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{MigrationError, Result};
use crate::events::{MigrationEvent, Notifier};
use crate::lock::local_hostname;
use crate::store;
use crate::version::MigrationVersion;

/// Kind of lifecycle operation being audited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AuditOperation {
    Migrate,
    Rollback,
    LockAcquired,
    LockReleased,
    StateBackup,
    StateRestored,
}

/// Phase of the audited operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AuditStatus {
    Started,
    Completed,
    Failed,
}

/// One immutable audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub operation: AuditOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<MigrationVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_name: Option<String>,
    pub status: AuditStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub hostname: String,
}

impl AuditEntry {
    /// Start a new entry stamped with a fresh id, the current time and the
    /// local hostname
    pub fn new(operation: AuditOperation, status: AuditStatus) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            operation,
            version: None,
            migration_name: None,
            status,
            details: None,
            duration_ms: None,
            hostname: local_hostname(),
        }
    }

    pub fn with_version(mut self, version: MigrationVersion) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_migration_name(mut self, name: impl Into<String>) -> Self {
        self.migration_name = Some(name.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = Some(duration.as_millis() as u64);
        self
    }
}

/// Filter for `AuditLogger::query`
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub version: Option<MigrationVersion>,
    pub operation: Option<AuditOperation>,
    pub status: Option<AuditStatus>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Keep only the most recent `limit` matches
    pub limit: Option<usize>,
}

impl AuditQuery {
    fn matches(&self, entry: &AuditEntry) -> bool {
        self.version.is_none_or(|v| entry.version == Some(v))
            && self.operation.is_none_or(|op| entry.operation == op)
            && self.status.is_none_or(|s| entry.status == s)
            && self.since.is_none_or(|t| entry.timestamp >= t)
            && self.until.is_none_or(|t| entry.timestamp <= t)
    }
}

struct AuditInner {
    path: PathBuf,
    entries: Vec<AuditEntry>,
}

/// Shared handle to the audit trail
///
/// Cloning is cheap; all clones append to the same file.
#[derive(Clone)]
pub struct AuditLogger {
    inner: Arc<Mutex<AuditInner>>,
    notifier: Arc<Notifier>,
}

impl AuditLogger {
    /// Open the audit trail at `path`. A missing or corrupted file starts an
    /// empty trail.
    pub fn open(path: impl Into<PathBuf>, notifier: Arc<Notifier>) -> Self {
        let path = path.into();
        let entries: Vec<AuditEntry> = store::load_json_or_default(&path);
        debug!(path = %path.display(), entries = entries.len(), "Loaded audit trail");
        Self {
            inner: Arc::new(Mutex::new(AuditInner { path, entries })),
            notifier,
        }
    }

    /// Append an entry and persist the whole trail
    pub fn try_record(&self, entry: AuditEntry) -> Result<()> {
        {
            let mut inner = self
                .inner
                .lock()
                .map_err(|_| MigrationError::lock("audit trail mutex poisoned"))?;
            // Another process may have appended since we last looked
            inner.entries = store::load_json_or_default(&inner.path);
            inner.entries.push(entry.clone());
            store::write_json_atomic(&inner.path, &inner.entries)?;
        }
        self.notifier.emit(MigrationEvent::Audit(entry));
        Ok(())
    }

    /// Append an entry; a persistence failure is logged, not returned
    pub fn record(&self, entry: AuditEntry) {
        let operation = entry.operation;
        if let Err(e) = self.try_record(entry) {
            warn!(%operation, error = %e, "Failed to persist audit entry");
        }
    }

    /// Snapshot of every entry in chronological order, as last seen by this
    /// handle
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.inner
            .lock()
            .map(|inner| inner.entries.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path(&self) -> PathBuf {
        self.inner
            .lock()
            .map(|i| i.path.clone())
            .unwrap_or_default()
    }

    /// Entries on disk matching `query`, oldest first
    pub fn query(&self, query: &AuditQuery) -> Vec<AuditEntry> {
        Self::read_file(&self.path(), query)
    }

    /// Read and filter a trail without opening a logger
    pub fn read_file(path: &Path, query: &AuditQuery) -> Vec<AuditEntry> {
        let entries: Vec<AuditEntry> = store::load_json_or_default(path);
        filter_entries(entries, query)
    }
}

fn filter_entries(entries: Vec<AuditEntry>, query: &AuditQuery) -> Vec<AuditEntry> {
    let mut matched: Vec<AuditEntry> = entries.into_iter().filter(|e| query.matches(e)).collect();
    if let Some(limit) = query.limit {
        if matched.len() > limit {
            matched.drain(..matched.len() - limit);
        }
    }
    matched
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger")
            .field("path", &self.path())
            .field("entries", &self.len())
            .finish()
    }
}
