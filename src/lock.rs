//! Cross-process lock file
//!
//! The lock is a marker file created with `O_CREAT | O_EXCL`; its existence
//! means "held". The file carries a small JSON payload naming the owner so
//! later callers can decide whether an unreleased lock is abandoned.
//!
//! # Reclaim rules
//!
//! - **Stale**: the payload is older than the staleness threshold
//! - **Orphaned**: the payload's host is this host and the pid is not running
//! - **Corrupted**: the payload does not parse; reclaimed only once the
//!   file's modification age exceeds the staleness threshold
//!
//! Liveness is host-local. A lock written by another host is only ever
//! reclaimed by age.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::audit::{AuditEntry, AuditLogger, AuditOperation, AuditStatus};
use crate::config::EngineConfig;
use crate::crash_guard::{self, LockRegistry};
use crate::error::{MigrationError, Result};
use crate::events::{LogLevel, MigrationEvent, Notifier};

static HOSTNAME: OnceLock<String> = OnceLock::new();

/// Name of the local host, or `"unknown"` if it cannot be determined
pub fn local_hostname() -> String {
    HOSTNAME
        .get_or_init(|| {
            nix::unistd::gethostname()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string())
        })
        .clone()
}

/// Contents of a held lock file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockPayload {
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
    pub format_version: u32,
}

impl LockPayload {
    pub const FORMAT_VERSION: u32 = 1;

    /// Payload describing the calling process, stamped now
    pub fn current() -> Self {
        Self {
            pid: std::process::id(),
            hostname: local_hostname(),
            acquired_at: Utc::now(),
            format_version: Self::FORMAT_VERSION,
        }
    }

    /// Read the payload at `path`. `Ok(None)` when no lock file exists.
    pub fn read(path: &Path) -> Result<Option<Self>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Time since the lock was taken; zero if the clock moved backwards
    pub fn age(&self) -> Duration {
        Utc::now()
            .signed_duration_since(self.acquired_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    pub fn is_local(&self) -> bool {
        self.hostname == local_hostname()
    }
}

/// What a lock file currently says about its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    /// No lock file
    Free,
    /// Owner looks alive and the lock is fresh
    Held(LockPayload),
    /// Older than the staleness threshold
    Stale(LockPayload),
    /// Owner confirmed dead on this host
    Orphaned(LockPayload),
    /// Unparseable payload; `age` is the file's modification age
    Corrupted { age: Option<Duration> },
}

impl LockState {
    /// True when a new caller may remove the file
    pub fn is_reclaimable(&self, stale_threshold: Duration) -> bool {
        match self {
            Self::Stale(_) | Self::Orphaned(_) => true,
            Self::Corrupted { age } => age.is_some_and(|a| a > stale_threshold),
            Self::Free | Self::Held(_) => false,
        }
    }
}

/// Acquires and releases the engine's lock file
pub struct LockManager {
    path: PathBuf,
    stale_threshold: Duration,
    retry_interval: Duration,
    max_retry_interval: Duration,
    crash_handlers: bool,
    held: Option<LockPayload>,
    audit: AuditLogger,
    notifier: Arc<Notifier>,
}

impl LockManager {
    pub fn new(config: &EngineConfig, audit: AuditLogger, notifier: Arc<Notifier>) -> Self {
        Self {
            path: config.lock_path(),
            stale_threshold: config.stale_lock_threshold,
            retry_interval: config.lock_retry_interval,
            max_retry_interval: config.lock_max_retry_interval.max(config.lock_retry_interval),
            crash_handlers: config.crash_handlers,
            held: None,
            audit,
            notifier,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }

    /// Payload written by this manager, while held
    pub fn payload(&self) -> Option<&LockPayload> {
        self.held.as_ref()
    }

    /// Classify the lock file without touching it
    pub fn inspect(&self) -> Result<LockState> {
        match fs::read(&self.path) {
            Ok(raw) => Ok(self.classify(&raw)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(LockState::Free),
            Err(e) => Err(e.into()),
        }
    }

    fn classify(&self, raw: &[u8]) -> LockState {
        let payload: LockPayload = match serde_json::from_slice(raw) {
            Ok(payload) => payload,
            Err(_) => {
                return LockState::Corrupted {
                    age: self.file_age(),
                };
            }
        };

        if payload.age() > self.stale_threshold {
            LockState::Stale(payload)
        } else if payload.is_local() && !crash_guard::is_process_alive(payload.pid) {
            LockState::Orphaned(payload)
        } else {
            LockState::Held(payload)
        }
    }

    fn file_age(&self) -> Option<Duration> {
        let modified = fs::metadata(&self.path).and_then(|m| m.modified()).ok()?;
        Some(
            SystemTime::now()
                .duration_since(modified)
                .unwrap_or(Duration::ZERO),
        )
    }

    /// Acquire the lock, waiting up to `timeout` for the current holder.
    ///
    /// Stale, orphaned and old corrupted locks are removed and creation is
    /// retried immediately. Otherwise the caller sleeps with jittered
    /// exponential backoff.
    pub fn acquire(&mut self, timeout: Duration) -> Result<()> {
        if self.held.is_some() {
            debug!(path = %self.path.display(), "Lock already held by this manager");
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let start = Instant::now();
        let mut backoff = self.retry_interval;
        let mut last_holder = None;
        let mut warned_corrupt = false;

        loop {
            match self.try_create() {
                Ok(payload) => {
                    self.on_acquired(payload, start.elapsed());
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }

            let raw = match fs::read(&self.path) {
                Ok(raw) => raw,
                // Released between our create and read
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            let state = self.classify(&raw);
            if state.is_reclaimable(self.stale_threshold) {
                warn!(path = %self.path.display(), state = ?state, "Reclaiming abandoned lock");
                self.remove_if_unchanged(&raw)?;
                continue;
            }

            match state {
                LockState::Held(payload) => last_holder = Some(payload),
                LockState::Corrupted { .. } if !warned_corrupt => {
                    warn!(path = %self.path.display(), "Lock file is corrupted; waiting for it to age out");
                    warned_corrupt = true;
                }
                _ => {}
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                let holder_pid = last_holder.as_ref().map(|h| h.pid);
                warn!(path = %self.path.display(), waited = ?elapsed, holder_pid = ?holder_pid, "Timed out waiting for lock");
                // The audit trail belongs to the holder; a waiter only reports
                self.notifier.log(
                    LogLevel::Warn,
                    format!(
                        "Timed out after {:?} waiting for lock {}",
                        elapsed,
                        self.path.display()
                    ),
                );
                return Err(MigrationError::LockTimeout {
                    path: self.path.clone(),
                    waited: elapsed,
                    holder: last_holder,
                });
            }

            let pause = jittered(backoff).min(timeout - elapsed);
            debug!(pause = ?pause, "Lock busy, backing off");
            thread::sleep(pause);
            backoff = (backoff * 2).min(self.max_retry_interval);
        }
    }

    fn try_create(&self) -> io::Result<LockPayload> {
        let payload = LockPayload::current();
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)?;

        let written = serde_json::to_vec_pretty(&payload)
            .map_err(io::Error::from)
            .and_then(|json| file.write_all(&json))
            .and_then(|_| file.sync_all());
        if let Err(e) = written {
            let _ = fs::remove_file(&self.path);
            return Err(e);
        }
        Ok(payload)
    }

    /// Delete the lock file only if it still holds `expected`
    fn remove_if_unchanged(&self, expected: &[u8]) -> Result<bool> {
        match fs::read(&self.path) {
            Ok(current) if current == expected => match fs::remove_file(&self.path) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(true),
                Err(e) => Err(e.into()),
            },
            Ok(_) => Ok(false),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    fn on_acquired(&mut self, payload: LockPayload, waited: Duration) {
        if self.crash_handlers {
            if let Err(e) = crash_guard::install_crash_handlers() {
                warn!(error = %e, "Failed to install crash handlers");
            }
            if let Ok(mut registry) = LockRegistry::global().lock() {
                registry.arm(&self.path);
            }
        }

        info!(path = %self.path.display(), pid = payload.pid, "Lock acquired");
        self.audit.record(
            AuditEntry::new(AuditOperation::LockAcquired, AuditStatus::Completed)
                .with_duration(waited)
                .with_details(json!({
                    "path": self.path.display().to_string(),
                    "pid": payload.pid,
                })),
        );
        self.notifier.emit(MigrationEvent::LockAcquired {
            pid: payload.pid,
            hostname: payload.hostname.clone(),
        });
        self.held = Some(payload);
    }

    /// Release the lock. Calling this when nothing is held is a no-op.
    pub fn release(&mut self) -> Result<()> {
        let Some(payload) = self.held.take() else {
            debug!(path = %self.path.display(), "Lock already released");
            return Ok(());
        };

        let result = match LockPayload::read(&self.path) {
            Ok(Some(current)) if current == payload => match fs::remove_file(&self.path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(MigrationError::from(e)),
            },
            Ok(Some(other)) => {
                warn!(path = %self.path.display(), pid = other.pid, "Lock was reclaimed by another process; leaving it");
                Ok(())
            }
            Ok(None) => {
                warn!(path = %self.path.display(), "Lock file vanished before release");
                Ok(())
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Lock file unreadable at release; leaving it");
                Ok(())
            }
        };

        if self.crash_handlers {
            if let Ok(mut registry) = LockRegistry::global().lock() {
                registry.disarm(&self.path);
            }
        }

        let status = if result.is_ok() {
            AuditStatus::Completed
        } else {
            AuditStatus::Failed
        };
        info!(path = %self.path.display(), "Lock released");
        self.audit.record(
            AuditEntry::new(AuditOperation::LockReleased, status)
                .with_duration(payload.age())
                .with_details(json!({
                    "path": self.path.display().to_string(),
                    "pid": payload.pid,
                })),
        );
        self.notifier
            .emit(MigrationEvent::LockReleased { pid: payload.pid });
        result
    }

    /// Remove the lock file whoever owns it. Returns the previous holder, if
    /// the file existed and was readable.
    pub fn force_unlock(&mut self) -> Result<Option<LockPayload>> {
        let previous = LockPayload::read(&self.path).unwrap_or(None);
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        self.held = None;

        warn!(path = %self.path.display(), holder = ?previous, "Lock forcibly removed");
        self.audit.record(
            AuditEntry::new(AuditOperation::LockReleased, AuditStatus::Completed).with_details(
                json!({
                    "path": self.path.display().to_string(),
                    "forced": true,
                    "previousPid": previous.as_ref().map(|p| p.pid),
                }),
            ),
        );
        Ok(previous)
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        if self.held.is_some() {
            debug!("LockManager dropped while holding lock, releasing");
            let _ = self.release();
        }
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("path", &self.path)
            .field("held", &self.held)
            .finish()
    }
}

/// Scale `base` by a random factor in [0.5, 1.5)
fn jittered(base: Duration) -> Duration {
    let factor: f64 = rand::rng().random_range(0.5..1.5);
    base.mul_f64(factor)
}
