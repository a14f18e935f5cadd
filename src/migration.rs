//! Migration descriptors, the step context and the registry
//!
//! A `Migration` pairs a version with caller-supplied forward and backward
//! steps. The engine never looks inside a step; it only hands the step a
//! `MigrationContext` bound to the open transaction and records the outcome.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::error::{MigrationError, Result};
use crate::events::{LogLevel, Notifier};
use crate::transaction::TransactionManager;
use crate::version::MigrationVersion;

/// A forward or backward step
pub type MigrationStep =
    Box<dyn Fn(&mut MigrationContext<'_>) -> anyhow::Result<()> + Send + Sync>;

/// One versioned, reversible transformation
pub struct Migration {
    version: String,
    name: String,
    description: Option<String>,
    up: MigrationStep,
    down: MigrationStep,
}

impl Migration {
    /// Create a migration. The version string is validated on registration.
    pub fn new<U, D>(version: impl Into<String>, name: impl Into<String>, up: U, down: D) -> Self
    where
        U: Fn(&mut MigrationContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
        D: Fn(&mut MigrationContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            version: version.into(),
            name: name.into(),
            description: None,
            up: Box::new(up),
            down: Box::new(down),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// The version string as supplied by the caller
    pub fn raw_version(&self) -> &str {
        &self.version
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// SHA-256 over version, name and description, hex encoded
    pub fn checksum(&self, version: MigrationVersion) -> String {
        let mut hasher = Sha256::new();
        hasher.update(version.to_string().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.name.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.description.as_deref().unwrap_or("").as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub(crate) fn run_up(&self, ctx: &mut MigrationContext<'_>) -> anyhow::Result<()> {
        (self.up)(ctx)
    }

    pub(crate) fn run_down(&self, ctx: &mut MigrationContext<'_>) -> anyhow::Result<()> {
        (self.down)(ctx)
    }
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("version", &self.version)
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Four-level logger handed to steps.
///
/// Messages go to `tracing` tagged with the migration version and are also
/// published as `log` notifications.
#[derive(Clone, Copy)]
pub struct ContextLogger<'a> {
    version: MigrationVersion,
    notifier: &'a Notifier,
}

impl<'a> ContextLogger<'a> {
    pub(crate) fn new(version: MigrationVersion, notifier: &'a Notifier) -> Self {
        Self { version, notifier }
    }

    pub fn info(&self, message: impl fmt::Display) {
        info!(version = %self.version, "{}", message);
        self.publish(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl fmt::Display) {
        warn!(version = %self.version, "{}", message);
        self.publish(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl fmt::Display) {
        error!(version = %self.version, "{}", message);
        self.publish(LogLevel::Error, message);
    }

    pub fn debug(&self, message: impl fmt::Display) {
        debug!(version = %self.version, "{}", message);
        self.publish(LogLevel::Debug, message);
    }

    fn publish(&self, level: LogLevel, message: impl fmt::Display) {
        self.notifier
            .log(level, format!("[{}] {}", self.version, message));
    }
}

/// Everything a step may use. Created fresh for each attempt.
pub struct MigrationContext<'a> {
    pub version: MigrationVersion,
    pub data_dir: &'a Path,
    pub config_dir: &'a Path,
    pub dry_run: bool,
    pub logger: ContextLogger<'a>,
    transaction: &'a mut TransactionManager,
}

impl<'a> MigrationContext<'a> {
    pub(crate) fn new(
        version: MigrationVersion,
        data_dir: &'a Path,
        config_dir: &'a Path,
        dry_run: bool,
        notifier: &'a Notifier,
        transaction: &'a mut TransactionManager,
    ) -> Self {
        Self {
            version,
            data_dir,
            config_dir,
            dry_run,
            logger: ContextLogger::new(version, notifier),
            transaction,
        }
    }

    /// Capture `path` so it is restored if this migration fails.
    /// Call before the first modification; later calls are no-ops.
    pub fn backup_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.transaction.backup_file(path)
    }

    /// `data_dir` joined with `relative`
    pub fn data_path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.data_dir.join(relative)
    }

    /// `config_dir` joined with `relative`
    pub fn config_path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.config_dir.join(relative)
    }
}

/// Registered migrations keyed and ordered by version
#[derive(Debug, Default)]
pub struct MigrationRegistry {
    migrations: BTreeMap<MigrationVersion, Migration>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and add one migration
    pub fn register(&mut self, migration: Migration) -> Result<MigrationVersion> {
        let version = MigrationVersion::parse(migration.raw_version())?;
        if self.migrations.contains_key(&version) {
            return Err(MigrationError::DuplicateMigration(version));
        }
        debug!(%version, name = migration.name(), "Registered migration");
        self.migrations.insert(version, migration);
        Ok(version)
    }

    /// Validate a batch, then add all of it. Nothing is added if any
    /// migration is invalid or duplicated.
    pub fn register_all(
        &mut self,
        migrations: impl IntoIterator<Item = Migration>,
    ) -> Result<Vec<MigrationVersion>> {
        let mut staged = BTreeMap::new();
        for migration in migrations {
            let version = MigrationVersion::parse(migration.raw_version())?;
            if self.migrations.contains_key(&version) || staged.contains_key(&version) {
                return Err(MigrationError::DuplicateMigration(version));
            }
            staged.insert(version, migration);
        }

        let versions: Vec<MigrationVersion> = staged.keys().copied().collect();
        for (version, migration) in staged {
            debug!(%version, name = migration.name(), "Registered migration");
            self.migrations.insert(version, migration);
        }
        Ok(versions)
    }

    pub fn get(&self, version: MigrationVersion) -> Option<&Migration> {
        self.migrations.get(&version)
    }

    pub fn contains(&self, version: MigrationVersion) -> bool {
        self.migrations.contains_key(&version)
    }

    /// Registered versions, ascending
    pub fn versions(&self) -> impl Iterator<Item = &MigrationVersion> {
        self.migrations.keys()
    }

    /// Highest registered version
    pub fn latest(&self) -> Option<MigrationVersion> {
        self.migrations.keys().next_back().copied()
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(version: &str) -> Migration {
        Migration::new(version, format!("m{version}"), |_| Ok(()), |_| Ok(()))
    }

    #[test]
    fn test_register_orders_by_version() {
        let mut registry = MigrationRegistry::new();
        registry.register(noop("1.10.0")).unwrap();
        registry.register(noop("1.2.0")).unwrap();
        registry.register(noop("0.9.1")).unwrap();

        let versions: Vec<String> = registry.versions().map(|v| v.to_string()).collect();
        assert_eq!(versions, vec!["0.9.1", "1.2.0", "1.10.0"]);
        assert_eq!(registry.latest(), Some(MigrationVersion::new(1, 10, 0)));
    }

    #[test]
    fn test_register_rejects_invalid_and_duplicate() {
        let mut registry = MigrationRegistry::new();
        assert!(matches!(
            registry.register(noop("1.0")),
            Err(MigrationError::InvalidVersion(_))
        ));

        registry.register(noop("1.0.0")).unwrap();
        assert!(matches!(
            registry.register(noop("1.0.0")),
            Err(MigrationError::DuplicateMigration(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_all_is_all_or_nothing() {
        let mut registry = MigrationRegistry::new();
        let result = registry.register_all(vec![noop("1.0.0"), noop("2.0.0"), noop("1.0.0")]);
        assert!(matches!(result, Err(MigrationError::DuplicateMigration(_))));
        assert!(registry.is_empty());

        let added = registry.register_all(vec![noop("2.0.0"), noop("1.0.0")]).unwrap();
        assert_eq!(added.len(), 2);
        assert_eq!(added[0], MigrationVersion::new(1, 0, 0));
    }

    #[test]
    fn test_checksum_tracks_descriptor() {
        let v = MigrationVersion::new(1, 0, 0);
        let a = noop("1.0.0");
        let b = noop("1.0.0").with_description("adds cache dir");
        assert_eq!(a.checksum(v), noop("1.0.0").checksum(v));
        assert_ne!(a.checksum(v), b.checksum(v));
        assert_eq!(a.checksum(v).len(), 64);
    }
}
