//! Migration orchestrator
//!
//! `MigrationManager` drives a batch end to end:
//!
//! ```text
//! acquire lock
//!   for each pending version (ascending):
//!     begin transaction -> forward step -> commit   -> history `success`
//!                                      \-> rollback -> history `failed`, stop
//! release lock
//! ```
//!
//! The lock is released on every exit path. Step failures, including
//! panics, are folded into `MigrationResult::errors`; only a lock that
//! cannot be acquired aborts the call with an error, before anything is
//! touched.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{error, info, warn};

use crate::audit::{AuditEntry, AuditLogger, AuditOperation, AuditQuery, AuditStatus};
use crate::config::EngineConfig;
use crate::crash_guard;
use crate::error::{MigrationError, Result};
use crate::events::{LogLevel, MigrationEvent, MigrationObserver, Notifier};
use crate::history::{HistoryEntry, HistoryStore};
use crate::lock::{LockManager, LockState};
use crate::migration::{Migration, MigrationContext, MigrationRegistry};
use crate::transaction::TransactionManager;
use crate::version::MigrationVersion;

/// Outcome of `migrate`, `rollback` or `migrate_to`
#[derive(Debug)]
pub struct MigrationResult {
    /// True when no step failed
    pub success: bool,
    /// Number of steps that ran successfully (forward or backward)
    pub migrations_applied: usize,
    /// Versions whose step ran successfully, in execution order
    pub versions: Vec<MigrationVersion>,
    /// Highest successfully applied version after the call
    pub current_version: Option<MigrationVersion>,
    /// At most one error per call: the batch stops at the first failure
    pub errors: Vec<MigrationError>,
    pub duration: Duration,
    pub dry_run: bool,
}

impl MigrationResult {
    fn empty(dry_run: bool) -> Self {
        Self {
            success: true,
            migrations_applied: 0,
            versions: Vec::new(),
            current_version: None,
            errors: Vec::new(),
            duration: Duration::ZERO,
            dry_run,
        }
    }

    fn record_success(&mut self, version: MigrationVersion) {
        self.versions.push(version);
        self.migrations_applied += 1;
    }

    fn record_failure(&mut self, error: MigrationError) {
        self.errors.push(error);
        self.success = false;
    }

    fn absorb(&mut self, other: MigrationResult) {
        self.success &= other.success;
        self.migrations_applied += other.migrations_applied;
        self.versions.extend(other.versions);
        self.errors.extend(other.errors);
    }
}

/// Read-only snapshot for front ends
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    pub current_version: Option<MigrationVersion>,
    pub latest_version: Option<MigrationVersion>,
    pub pending: Vec<MigrationVersion>,
    pub applied: Vec<MigrationVersion>,
    pub lock: LockState,
}

impl MigrationStatus {
    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty()
    }
}

/// An applied migration whose registered descriptor changed since it ran
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumMismatch {
    pub version: MigrationVersion,
    pub recorded: String,
    pub expected: String,
}

#[derive(Clone, Copy)]
enum Direction {
    Forward,
    Backward,
}

/// Drives migrations under the lock with transactional rollback
pub struct MigrationManager {
    config: EngineConfig,
    registry: MigrationRegistry,
    history: HistoryStore,
    audit: AuditLogger,
    lock: LockManager,
    transactions: TransactionManager,
    notifier: Arc<Notifier>,
}

impl MigrationManager {
    pub fn new(config: EngineConfig) -> Self {
        let notifier = Arc::new(Notifier::new());
        let audit = AuditLogger::open(config.audit_path(), notifier.clone());
        let history = HistoryStore::open(config.history_path());
        let lock = LockManager::new(&config, audit.clone(), notifier.clone());
        let transactions = TransactionManager::new(audit.clone(), notifier.clone());

        Self {
            config,
            registry: MigrationRegistry::new(),
            history,
            audit,
            lock,
            transactions,
            notifier,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register an observer for lifecycle notifications
    pub fn subscribe(&self, observer: Arc<dyn MigrationObserver>) {
        self.notifier.subscribe(observer);
    }

    pub fn register_migration(&mut self, migration: Migration) -> Result<MigrationVersion> {
        self.registry.register(migration)
    }

    pub fn register_migrations(
        &mut self,
        migrations: impl IntoIterator<Item = Migration>,
    ) -> Result<Vec<MigrationVersion>> {
        self.registry.register_all(migrations)
    }

    // ------------------------------------------------------------------
    // Read-only accessors. None of these touch the lock; they read the
    // ledger from disk and may observe a concurrent holder's progress.
    // ------------------------------------------------------------------

    fn history_snapshot(&self) -> HistoryStore {
        HistoryStore::open(self.history.path())
    }

    pub fn current_version(&self) -> Option<MigrationVersion> {
        self.history_snapshot().current_version()
    }

    pub fn pending_migrations(&self) -> Vec<MigrationVersion> {
        self.history_snapshot().pending(self.registry.versions())
    }

    /// Latest `success` entry of every applied version, ascending
    pub fn applied_migrations(&self) -> Vec<HistoryEntry> {
        let history = self.history_snapshot();
        history
            .applied()
            .into_iter()
            .filter_map(|v| history.success_entry(v).cloned())
            .collect()
    }

    /// Full ledger, oldest first
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history_snapshot().entries().to_vec()
    }

    pub fn audit_log(&self, query: &AuditQuery) -> Vec<AuditEntry> {
        self.audit.query(query)
    }

    pub fn status(&self) -> Result<MigrationStatus> {
        let history = self.history_snapshot();
        Ok(MigrationStatus {
            current_version: history.current_version(),
            latest_version: self.registry.latest(),
            pending: history.pending(self.registry.versions()),
            applied: history.applied().into_iter().collect(),
            lock: self.lock.inspect()?,
        })
    }

    /// Applied versions whose registered descriptor no longer matches the
    /// checksum recorded when they ran
    pub fn verify_checksums(&self) -> Vec<ChecksumMismatch> {
        let history = self.history_snapshot();
        history
            .applied()
            .into_iter()
            .filter_map(|version| {
                let migration = self.registry.get(version)?;
                let entry = history.success_entry(version)?;
                let expected = migration.checksum(version);
                (entry.checksum != expected).then(|| ChecksumMismatch {
                    version,
                    recorded: entry.checksum.clone(),
                    expected,
                })
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Mutating operations
    // ------------------------------------------------------------------

    /// Apply every pending migration in ascending order, stopping at the
    /// first failure
    pub fn migrate(&mut self) -> Result<MigrationResult> {
        self.run_forward(None)
    }

    /// Revert the most recently applied version
    pub fn rollback(&mut self) -> Result<MigrationResult> {
        let started = Instant::now();
        self.history.reload();
        match self.history.current_version() {
            Some(version) => self.rollback_version(version, started),
            None => {
                info!("Nothing to roll back");
                self.notifier.log(LogLevel::Info, "Nothing to roll back");
                Ok(self.finish(MigrationResult::empty(self.config.dry_run), started))
            }
        }
    }

    /// Move forward or backward until the current version is `target`
    pub fn migrate_to(&mut self, target: &str) -> Result<MigrationResult> {
        let target = MigrationVersion::parse(target)?;
        let started = Instant::now();
        self.history.reload();
        let current = self.history.current_version().unwrap_or(MigrationVersion::ZERO);

        if target >= current {
            return self.run_forward(Some(target));
        }

        // One lock for the whole descent, so a busy lock can only stop the
        // call before anything is reverted
        let result = self.with_lock(|this| {
            this.history.reload();
            let to_revert: Vec<MigrationVersion> = this
                .history
                .applied()
                .into_iter()
                .rev()
                .filter(|v| *v > target)
                .collect();
            info!(%target, count = to_revert.len(), "Rolling back to target version");

            let mut total = MigrationResult::empty(this.config.dry_run);
            for version in to_revert {
                let step = this.revert_locked(version);
                let failed = !step.success;
                total.absorb(step);
                if failed {
                    break;
                }
            }
            total
        })?;
        Ok(self.finish(result, started))
    }

    fn run_forward(&mut self, target: Option<MigrationVersion>) -> Result<MigrationResult> {
        let started = Instant::now();
        self.history.reload();
        if self.pending_up_to(target).is_empty() {
            info!("No pending migrations");
            self.notifier.log(LogLevel::Info, "No pending migrations");
            return Ok(self.finish(MigrationResult::empty(self.config.dry_run), started));
        }

        let result = self.with_lock(|this| {
            // Another process may have applied some of these while we waited
            this.history.reload();
            let pending = this.pending_up_to(target);
            info!(count = pending.len(), "Starting migration batch");
            this.notifier.emit(MigrationEvent::MigrateStart {
                pending: pending.clone(),
            });

            let mut result = MigrationResult::empty(this.config.dry_run);
            for version in pending {
                match this.run_step(version, Direction::Forward) {
                    Ok(()) => result.record_success(version),
                    Err(e) => {
                        result.record_failure(e);
                        break;
                    }
                }
            }
            result
        })?;
        Ok(self.finish(result, started))
    }

    fn rollback_version(
        &mut self,
        version: MigrationVersion,
        started: Instant,
    ) -> Result<MigrationResult> {
        if !self.registry.contains(version) {
            let mut result = MigrationResult::empty(self.config.dry_run);
            result.record_failure(MigrationError::UnknownVersion(version));
            return Ok(self.finish(result, started));
        }

        let result = self.with_lock(|this| this.revert_locked(version))?;
        Ok(self.finish(result, started))
    }

    /// Run the backward step of `version`. The caller holds the lock.
    fn revert_locked(&mut self, version: MigrationVersion) -> MigrationResult {
        let mut result = MigrationResult::empty(self.config.dry_run);
        if !self.registry.contains(version) {
            result.record_failure(MigrationError::UnknownVersion(version));
            return result;
        }
        self.history.reload();
        if self.history.success_entry(version).is_none() {
            info!(%version, "Version no longer applied; nothing to roll back");
            return result;
        }
        match self.run_step(version, Direction::Backward) {
            Ok(()) => result.record_success(version),
            Err(e) => result.record_failure(e),
        }
        result
    }

    fn pending_up_to(&self, target: Option<MigrationVersion>) -> Vec<MigrationVersion> {
        let mut pending = self.history.pending(self.registry.versions());
        if let Some(target) = target {
            pending.retain(|v| *v <= target);
        }
        pending
    }

    fn finish(&self, mut result: MigrationResult, started: Instant) -> MigrationResult {
        result.current_version = self.history.current_version();
        result.duration = started.elapsed();
        result
    }

    /// Run `body` while holding the lock; the lock is released whatever
    /// `body` does, including panicking.
    fn with_lock<F>(&mut self, body: F) -> Result<MigrationResult>
    where
        F: FnOnce(&mut Self) -> MigrationResult,
    {
        self.lock.acquire(self.config.lock_timeout)?;

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(self)));

        if self.transactions.is_active() {
            warn!("Transaction left open by an aborted batch; rolling back");
            match self.transactions.rollback_transaction() {
                Ok(report) if !report.is_clean() => warn!(
                    transaction_id = %report.transaction_id,
                    errors = %report.errors.join("; "),
                    "Restore of aborted transaction incomplete"
                ),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Failed to roll back aborted transaction"),
            }
        }
        if let Err(e) = self.lock.release() {
            warn!(error = %e, "Failed to release lock cleanly");
        }

        match outcome {
            Ok(result) => Ok(result),
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// One transactional attempt of one migration in one direction
    fn run_step(&mut self, version: MigrationVersion, direction: Direction) -> Result<()> {
        let migration = self
            .registry
            .get(version)
            .ok_or(MigrationError::UnknownVersion(version))?;
        let name = migration.name().to_string();
        let checksum = migration.checksum(version);
        let dry_run = self.config.dry_run;
        let operation = match direction {
            Direction::Forward => AuditOperation::Migrate,
            Direction::Backward => AuditOperation::Rollback,
        };

        info!(%version, name = %name, ?operation, dry_run, "Running migration step");
        self.notifier.emit(match direction {
            Direction::Forward => MigrationEvent::MigrationStart {
                version,
                name: name.clone(),
            },
            Direction::Backward => MigrationEvent::RollbackStart {
                version,
                name: name.clone(),
            },
        });
        self.audit.record(
            AuditEntry::new(operation, AuditStatus::Started)
                .with_version(version)
                .with_migration_name(&name)
                .with_details(json!({ "dryRun": dry_run })),
        );

        let transaction_id = self.transactions.begin_transaction(version);
        let step_started = Instant::now();
        let outcome = {
            let mut ctx = MigrationContext::new(
                version,
                &self.config.data_dir,
                &self.config.config_dir,
                dry_run,
                &self.notifier,
                &mut self.transactions,
            );
            crash_guard::catch_step_panic(|| match direction {
                Direction::Forward => migration.run_up(&mut ctx),
                Direction::Backward => migration.run_down(&mut ctx),
            })
        };
        let duration = step_started.elapsed();

        let mut failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{e:#}")),
            Err(panic_message) => Some(format!("unexpected fault: {panic_message}")),
        };

        // Record the outcome while the pre-images are still held, so a
        // ledger write failure can still revert the step
        if failure.is_none() && !dry_run {
            let recorded = match direction {
                Direction::Forward => self.history.append(HistoryEntry::success(
                    version,
                    &name,
                    duration,
                    transaction_id,
                    checksum.clone(),
                )),
                Direction::Backward => self.history.mark_rolled_back(version),
            };
            if let Err(e) = recorded {
                failure = Some(format!("failed to record history: {e}"));
            }
        }

        match failure {
            None => {
                if dry_run {
                    self.transactions.rollback_transaction()?;
                } else {
                    self.transactions.commit_transaction()?;
                }

                info!(%version, name = %name, ?duration, "Migration step completed");
                self.audit.record(
                    AuditEntry::new(operation, AuditStatus::Completed)
                        .with_version(version)
                        .with_migration_name(&name)
                        .with_duration(duration)
                        .with_details(json!({
                            "transactionId": transaction_id,
                            "dryRun": dry_run,
                        })),
                );
                self.notifier.emit(match direction {
                    Direction::Forward => MigrationEvent::MigrationComplete {
                        version,
                        name,
                        duration,
                    },
                    Direction::Backward => MigrationEvent::RollbackComplete {
                        version,
                        name,
                        duration,
                    },
                });
                Ok(())
            }
            Some(mut message) => {
                error!(%version, name = %name, error = %message, "Migration step failed");
                let report = self.transactions.rollback_transaction()?;
                if !report.is_clean() {
                    message = format!(
                        "{message} (restore incomplete: {})",
                        report.errors.join("; ")
                    );
                }

                if !dry_run && matches!(direction, Direction::Forward) {
                    if let Err(e) = self.history.append(HistoryEntry::failed(
                        version,
                        &name,
                        duration,
                        transaction_id,
                        checksum,
                        &message,
                    )) {
                        warn!(%version, error = %e, "Failed to record failed attempt in history");
                    }
                }

                self.audit.record(
                    AuditEntry::new(operation, AuditStatus::Failed)
                        .with_version(version)
                        .with_migration_name(&name)
                        .with_duration(duration)
                        .with_details(json!({
                            "transactionId": transaction_id,
                            "error": message,
                            "restored": report.restored,
                            "dryRun": dry_run,
                        })),
                );
                self.notifier.emit(match direction {
                    Direction::Forward => MigrationEvent::MigrationError {
                        version,
                        name: name.clone(),
                        error: message.clone(),
                    },
                    Direction::Backward => MigrationEvent::RollbackError {
                        version,
                        name: name.clone(),
                        error: message.clone(),
                    },
                });

                Err(MigrationError::StepFailed {
                    version,
                    name,
                    message,
                })
            }
        }
    }
}

impl std::fmt::Debug for MigrationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationManager")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}
