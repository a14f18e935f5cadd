//! File-level transactions
//!
//! A transaction captures the pre-image of every file a migration declares
//! it will touch. Committing discards the pre-images; rolling back writes
//! them back (or deletes files that did not exist before).
//!
//! At most one transaction is open at a time. Beginning a new one while
//! another is still open rolls the old one back first.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditLogger, AuditOperation, AuditStatus};
use crate::error::{MigrationError, Result};
use crate::events::{LogLevel, MigrationEvent, Notifier};
use crate::version::MigrationVersion;

/// Captured state of one path before modification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileImage {
    /// The path did not exist
    Absent,
    /// Regular file contents plus unix mode bits when available
    Present { bytes: Vec<u8>, mode: Option<u32> },
}

impl FileImage {
    fn capture(path: &Path) -> Result<Self> {
        let metadata = match fs::symlink_metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::Absent),
            Err(e) => return Err(e.into()),
        };
        // Reads and writes go through a symlink, so its target's mode is the one to keep
        let metadata = if metadata.file_type().is_symlink() {
            fs::metadata(path)?
        } else {
            metadata
        };
        if metadata.is_dir() {
            return Err(MigrationError::transaction(format!(
                "cannot back up directory {}",
                path.display()
            )));
        }

        let bytes = fs::read(path)?;
        Ok(Self::Present {
            bytes,
            mode: mode_of(&metadata),
        })
    }

    fn restore(&self, path: &Path) -> Result<()> {
        match self {
            Self::Absent => match fs::symlink_metadata(path) {
                Ok(metadata) if metadata.is_dir() => Err(MigrationError::transaction(format!(
                    "{} was created as a directory; not removing it",
                    path.display()
                ))),
                Ok(_) => Ok(fs::remove_file(path)?),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
            Self::Present { bytes, mode } => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        fs::create_dir_all(parent)?;
                    }
                }
                fs::write(path, bytes)?;
                if let Some(mode) = mode {
                    set_mode(path, *mode)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(unix)]
fn mode_of(metadata: &fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(metadata.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn mode_of(_metadata: &fs::Metadata) -> Option<u32> {
    None
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

/// In-memory state of the open transaction
#[derive(Debug)]
pub struct StateBackup {
    pub transaction_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub version: MigrationVersion,
    pub files: BTreeMap<PathBuf, FileImage>,
    started: Instant,
}

impl StateBackup {
    fn new(version: MigrationVersion) -> Self {
        Self {
            transaction_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            version,
            files: BTreeMap::new(),
            started: Instant::now(),
        }
    }
}

/// Outcome of `commit_transaction`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReport {
    pub transaction_id: Uuid,
    pub files: usize,
    pub integrity_issues: Vec<String>,
    pub duration: Duration,
}

/// Outcome of `rollback_transaction`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackReport {
    pub transaction_id: Uuid,
    pub restored: usize,
    pub errors: Vec<String>,
    pub duration: Duration,
}

impl RollbackReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Owns the single open transaction
pub struct TransactionManager {
    current: Option<StateBackup>,
    audit: AuditLogger,
    notifier: Arc<Notifier>,
}

impl TransactionManager {
    pub fn new(audit: AuditLogger, notifier: Arc<Notifier>) -> Self {
        Self {
            current: None,
            audit,
            notifier,
        }
    }

    pub fn is_active(&self) -> bool {
        self.current.is_some()
    }

    pub fn active(&self) -> Option<&StateBackup> {
        self.current.as_ref()
    }

    /// Open a transaction for `version`, rolling back any unfinished one
    pub fn begin_transaction(&mut self, version: MigrationVersion) -> Uuid {
        if let Some(open) = &self.current {
            warn!(
                transaction_id = %open.transaction_id,
                version = %open.version,
                "Transaction still open; rolling it back before starting a new one"
            );
            self.notifier.log(
                LogLevel::Warn,
                format!("Rolling back unfinished transaction {}", open.transaction_id),
            );
            if let Err(e) = self.rollback_transaction() {
                warn!(error = %e, "Forced rollback failed");
            }
        }

        let backup = StateBackup::new(version);
        let id = backup.transaction_id;
        debug!(transaction_id = %id, %version, "Transaction started");
        self.current = Some(backup);
        self.notifier.emit(MigrationEvent::TransactionBegin {
            transaction_id: id,
            version,
        });
        id
    }

    /// Record the pre-image of `path`. Only the first call per path counts.
    pub fn backup_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let backup = self
            .current
            .as_mut()
            .ok_or_else(|| MigrationError::transaction("no open transaction"))?;

        if backup.files.contains_key(path) {
            return Ok(());
        }
        let image = FileImage::capture(path)?;
        debug!(
            path = %path.display(),
            existed = matches!(image, FileImage::Present { .. }),
            "Captured pre-image"
        );
        backup.files.insert(path.to_path_buf(), image);
        Ok(())
    }

    /// Close the transaction, keeping all changes
    pub fn commit_transaction(&mut self) -> Result<CommitReport> {
        let backup = self
            .current
            .take()
            .ok_or_else(|| MigrationError::transaction("no open transaction to commit"))?;

        let integrity_issues = verify_integrity(&backup);
        for issue in &integrity_issues {
            let warning = MigrationError::integrity(issue.clone());
            warn!(transaction_id = %backup.transaction_id, "{}", warning);
            self.notifier.log(LogLevel::Warn, warning.to_string());
        }

        let report = CommitReport {
            transaction_id: backup.transaction_id,
            files: backup.files.len(),
            integrity_issues,
            duration: backup.started.elapsed(),
        };

        debug!(transaction_id = %report.transaction_id, files = report.files, "Transaction committed");
        self.audit.record(
            AuditEntry::new(AuditOperation::StateBackup, AuditStatus::Completed)
                .with_version(backup.version)
                .with_duration(report.duration)
                .with_details(json!({
                    "transactionId": report.transaction_id,
                    "files": report.files,
                    "integrityIssues": report.integrity_issues,
                })),
        );
        self.notifier.emit(MigrationEvent::TransactionCommit {
            transaction_id: report.transaction_id,
            files: report.files,
        });
        Ok(report)
    }

    /// Close the transaction, restoring every captured pre-image
    pub fn rollback_transaction(&mut self) -> Result<RollbackReport> {
        let backup = self
            .current
            .take()
            .ok_or_else(|| MigrationError::transaction("no open transaction to roll back"))?;

        let mut restored = 0;
        let mut errors = Vec::new();
        for (path, image) in &backup.files {
            match image.restore(path) {
                Ok(()) => restored += 1,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to restore pre-image");
                    errors.push(format!("{}: {}", path.display(), e));
                }
            }
        }

        let report = RollbackReport {
            transaction_id: backup.transaction_id,
            restored,
            errors,
            duration: backup.started.elapsed(),
        };

        info!(
            transaction_id = %report.transaction_id,
            restored = report.restored,
            errors = report.errors.len(),
            "Transaction rolled back"
        );
        let status = if report.is_clean() {
            AuditStatus::Completed
        } else {
            AuditStatus::Failed
        };
        self.audit.record(
            AuditEntry::new(AuditOperation::StateRestored, status)
                .with_version(backup.version)
                .with_duration(report.duration)
                .with_details(json!({
                    "transactionId": report.transaction_id,
                    "restored": report.restored,
                    "errors": report.errors.len(),
                })),
        );
        self.notifier.emit(MigrationEvent::TransactionRollback {
            transaction_id: report.transaction_id,
            restored: report.restored,
            errors: report.errors.len(),
        });
        Ok(report)
    }
}

/// Best-effort check that each backed-up path is still reachable.
/// A missing path counts as intentionally removed.
fn verify_integrity(backup: &StateBackup) -> Vec<String> {
    let mut issues = Vec::new();
    for (path, image) in &backup.files {
        match fs::symlink_metadata(path) {
            Ok(metadata) if metadata.is_dir() => {
                issues.push(format!("{} is now a directory", path.display()));
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if matches!(image, FileImage::Present { .. }) {
                    debug!(path = %path.display(), "Backed-up file removed by migration");
                }
            }
            Err(e) => issues.push(format!("{} is unreachable: {}", path.display(), e)),
        }
    }
    issues
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("current", &self.current.as_ref().map(|b| b.transaction_id))
            .finish()
    }
}
