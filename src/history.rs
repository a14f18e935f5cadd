//! Migration history ledger
//!
//! Records every migration attempt. The ledger is append-only except for one
//! permitted mutation: a `success` entry may later be flipped to
//! `rolled_back`. The current version is derived from the ledger by version
//! ordering, never by insertion order.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tracing::debug;
use uuid::Uuid;

use crate::error::{MigrationError, Result};
use crate::store;
use crate::version::MigrationVersion;

/// Outcome of one migration attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HistoryStatus {
    Success,
    Failed,
    RolledBack,
}

/// One ledger row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub version: MigrationVersion,
    pub name: String,
    pub applied_at: DateTime<Utc>,
    pub status: HistoryStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub transaction_id: Uuid,
    pub checksum: String,
}

impl HistoryEntry {
    pub fn success(
        version: MigrationVersion,
        name: impl Into<String>,
        duration: Duration,
        transaction_id: Uuid,
        checksum: impl Into<String>,
    ) -> Self {
        Self {
            version,
            name: name.into(),
            applied_at: Utc::now(),
            status: HistoryStatus::Success,
            duration_ms: duration.as_millis() as u64,
            error: None,
            transaction_id,
            checksum: checksum.into(),
        }
    }

    pub fn failed(
        version: MigrationVersion,
        name: impl Into<String>,
        duration: Duration,
        transaction_id: Uuid,
        checksum: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            status: HistoryStatus::Failed,
            error: Some(error.into()),
            ..Self::success(version, name, duration, transaction_id, checksum)
        }
    }
}

/// Durable list of `HistoryEntry`, rewritten in full on every change
#[derive(Debug)]
pub struct HistoryStore {
    path: PathBuf,
    entries: Vec<HistoryEntry>,
}

impl HistoryStore {
    /// Load the ledger at `path`; a missing or corrupted file starts empty
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries: Vec<HistoryEntry> = store::load_json_or_default(&path);
        debug!(path = %path.display(), entries = entries.len(), "Loaded migration history");
        Self { path, entries }
    }

    /// Re-read the file, picking up changes made by another lock holder
    pub fn reload(&mut self) {
        self.entries = store::load_json_or_default(&self.path);
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    /// Append an entry and persist. The in-memory ledger is unchanged if
    /// the write fails.
    pub fn append(&mut self, entry: HistoryEntry) -> Result<()> {
        self.entries.push(entry);
        let saved = self.save();
        if saved.is_err() {
            self.entries.pop();
        }
        saved
    }

    /// Flip the most recent `success` entry for `version` to `rolled_back`.
    /// The in-memory ledger is unchanged if the write fails.
    pub fn mark_rolled_back(&mut self, version: MigrationVersion) -> Result<()> {
        let index = self
            .entries
            .iter()
            .rposition(|e| e.version == version && e.status == HistoryStatus::Success)
            .ok_or(MigrationError::UnknownVersion(version))?;
        self.entries[index].status = HistoryStatus::RolledBack;
        let saved = self.save();
        if saved.is_err() {
            self.entries[index].status = HistoryStatus::Success;
        }
        saved
    }

    fn save(&self) -> Result<()> {
        store::write_json_atomic(&self.path, &self.entries)
    }

    /// Versions that currently have a `success` entry, ascending
    pub fn applied(&self) -> BTreeSet<MigrationVersion> {
        self.entries
            .iter()
            .filter(|e| e.status == HistoryStatus::Success)
            .map(|e| e.version)
            .collect()
    }

    /// Highest successfully applied version
    pub fn current_version(&self) -> Option<MigrationVersion> {
        self.applied().into_iter().next_back()
    }

    /// Most recent entry of any status for `version`
    pub fn latest_entry(&self, version: MigrationVersion) -> Option<&HistoryEntry> {
        self.entries.iter().rev().find(|e| e.version == version)
    }

    /// Most recent `success` entry for `version`
    pub fn success_entry(&self, version: MigrationVersion) -> Option<&HistoryEntry> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.version == version && e.status == HistoryStatus::Success)
    }

    /// All failed attempts, oldest first
    pub fn failed(&self) -> Vec<&HistoryEntry> {
        self.entries
            .iter()
            .filter(|e| e.status == HistoryStatus::Failed)
            .collect()
    }

    /// Registered versions without a `success` entry, ascending
    pub fn pending<'a>(
        &self,
        registered: impl IntoIterator<Item = &'a MigrationVersion>,
    ) -> Vec<MigrationVersion> {
        let applied = self.applied();
        let mut pending: Vec<MigrationVersion> = registered
            .into_iter()
            .filter(|v| !applied.contains(v))
            .copied()
            .collect();
        pending.sort();
        pending.dedup();
        pending
    }
}
