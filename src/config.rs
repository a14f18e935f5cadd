//! Engine configuration
//!
//! Holds the directory roots handed to migrations, the artifact file names
//! and the lock timing knobs. Configurations can be saved to and loaded from
//! JSON files; durations are stored as milliseconds.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default lock file name
pub const DEFAULT_LOCK_FILE: &str = ".migration.lock";
/// Default history ledger file name
pub const DEFAULT_HISTORY_FILE: &str = "migration-history.json";
/// Default audit trail file name
pub const DEFAULT_AUDIT_FILE: &str = "migration-audit.json";

/// Configuration for a `MigrationManager`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Root of the data tree; artifacts live here
    pub data_dir: PathBuf,
    /// Root of the configuration tree handed to migrations
    pub config_dir: PathBuf,

    // Artifact names, relative to data_dir unless absolute
    pub lock_file: PathBuf,
    pub history_file: PathBuf,
    pub audit_file: PathBuf,

    #[serde(with = "duration_ms", rename = "lockTimeoutMs")]
    pub lock_timeout: Duration,
    #[serde(with = "duration_ms", rename = "staleLockThresholdMs")]
    pub stale_lock_threshold: Duration,
    #[serde(with = "duration_ms", rename = "lockRetryIntervalMs")]
    pub lock_retry_interval: Duration,
    #[serde(with = "duration_ms", rename = "lockMaxRetryIntervalMs")]
    pub lock_max_retry_interval: Duration,

    /// Run steps without recording history; transactions always roll back
    pub dry_run: bool,
    /// Install signal/panic handlers that remove held locks on crash
    pub crash_handlers: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            config_dir: PathBuf::from("."),
            lock_file: PathBuf::from(DEFAULT_LOCK_FILE),
            history_file: PathBuf::from(DEFAULT_HISTORY_FILE),
            audit_file: PathBuf::from(DEFAULT_AUDIT_FILE),
            lock_timeout: Duration::from_secs(30),
            stale_lock_threshold: Duration::from_secs(10 * 60),
            lock_retry_interval: Duration::from_millis(100),
            lock_max_retry_interval: Duration::from_secs(2),
            dry_run: false,
            crash_handlers: true,
        }
    }
}

impl EngineConfig {
    /// Configuration rooted at `data_dir` for both data and config trees
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            config_dir: data_dir.clone(),
            data_dir,
            ..Self::default()
        }
    }

    pub fn with_config_dir(mut self, config_dir: impl Into<PathBuf>) -> Self {
        self.config_dir = config_dir.into();
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_stale_lock_threshold(mut self, threshold: Duration) -> Self {
        self.stale_lock_threshold = threshold;
        self
    }

    pub fn with_retry_intervals(mut self, initial: Duration, max: Duration) -> Self {
        self.lock_retry_interval = initial;
        self.lock_max_retry_interval = max;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_crash_handlers(mut self, enabled: bool) -> Self {
        self.crash_handlers = enabled;
        self
    }

    fn resolve(&self, name: &Path) -> PathBuf {
        if name.is_absolute() {
            name.to_path_buf()
        } else {
            self.data_dir.join(name)
        }
    }

    pub fn lock_path(&self) -> PathBuf {
        self.resolve(&self.lock_file)
    }

    pub fn history_path(&self) -> PathBuf {
        self.resolve(&self.history_file)
    }

    pub fn audit_path(&self) -> PathBuf {
        self.resolve(&self.audit_file)
    }

    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize engine configuration to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Load configuration from a JSON file; missing keys take defaults
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        for (label, name) in [
            ("lock file", &self.lock_file),
            ("history file", &self.history_file),
            ("audit file", &self.audit_file),
        ] {
            if name.as_os_str().is_empty() {
                anyhow::bail!("The {} name must not be empty", label);
            }
        }

        let paths = [self.lock_path(), self.history_path(), self.audit_path()];
        if paths[0] == paths[1] || paths[0] == paths[2] || paths[1] == paths[2] {
            anyhow::bail!("Lock, history and audit files must be distinct");
        }

        if self.lock_timeout.is_zero() {
            anyhow::bail!("Lock timeout must be greater than zero");
        }
        if self.stale_lock_threshold.is_zero() {
            anyhow::bail!("Stale lock threshold must be greater than zero");
        }
        if self.lock_retry_interval.is_zero() {
            anyhow::bail!("Lock retry interval must be greater than zero");
        }

        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
