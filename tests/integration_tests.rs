//! End-to-end migration scenarios against a real data directory
//!
//! Each test drives `MigrationManager` through the public API only and then
//! inspects the files it left behind: the migrated state, the history ledger,
//! the audit trail and the lock file.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use statemig::{
    AuditLogger, AuditOperation, AuditQuery, AuditStatus, EngineConfig, HistoryStatus,
    HistoryStore, LockPayload, Migration, MigrationError, MigrationManager, MigrationVersion,
};
use tempfile::TempDir;

fn config_for(dir: &Path) -> EngineConfig {
    EngineConfig::new(dir)
        .with_crash_handlers(false)
        .with_lock_timeout(Duration::from_secs(10))
        .with_retry_intervals(Duration::from_millis(10), Duration::from_millis(50))
}

fn v(s: &str) -> MigrationVersion {
    s.parse().unwrap()
}

fn history_of(config: &EngineConfig) -> HistoryStore {
    HistoryStore::open(config.history_path())
}

fn audit_len(config: &EngineConfig) -> usize {
    AuditLogger::read_file(&config.audit_path(), &AuditQuery::default()).len()
}

/// Bytes of every file under `root`, keyed by relative path
fn snapshot(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    let mut files = BTreeMap::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                stack.push(path);
            } else {
                let rel = path.strip_prefix(root).unwrap().to_path_buf();
                files.insert(rel, fs::read(&path).unwrap());
            }
        }
    }
    files
}

/// Migration that writes `content` to `file` under the data dir and
/// deletes it again on the way down
fn write_file_migration(version: &str, file: &'static str, content: &'static str) -> Migration {
    Migration::new(
        version,
        format!("write {file}"),
        move |ctx| {
            let path = ctx.data_path(file);
            ctx.backup_file(&path)?;
            fs::write(&path, content)?;
            Ok(())
        },
        move |ctx| {
            let path = ctx.data_path(file);
            ctx.backup_file(&path)?;
            fs::remove_file(&path)?;
            Ok(())
        },
    )
}

// =============================================================================
// Failure containment
// =============================================================================

#[test]
fn test_failed_step_restores_prior_state_and_stops_batch() {
    let dir = TempDir::new().unwrap();
    let config = config_for(dir.path());
    let mut manager = MigrationManager::new(config.clone());

    manager
        .register_migration(write_file_migration("1.0.0", "fileA", "created by 1.0.0"))
        .unwrap();
    manager
        .register_migration(Migration::new(
            "1.1.0",
            "modify A then fail on B",
            |ctx| {
                let a = ctx.data_path("fileA");
                ctx.backup_file(&a)?;
                fs::write(&a, "modified by 1.1.0")?;

                let b = ctx.data_path("fileB");
                ctx.backup_file(&b)?;
                fs::write(&b, "partial")?;
                anyhow::bail!("disk full while writing fileB")
            },
            |_| Ok(()),
        ))
        .unwrap();
    manager
        .register_migration(write_file_migration("1.2.0", "fileC", "never written"))
        .unwrap();

    let result = manager.migrate().unwrap();

    assert!(!result.success);
    assert_eq!(result.migrations_applied, 1);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].to_string().contains("1.1.0"));
    assert_eq!(result.current_version, Some(v("1.0.0")));

    assert_eq!(
        fs::read_to_string(dir.path().join("fileA")).unwrap(),
        "created by 1.0.0"
    );
    assert!(!dir.path().join("fileB").exists());
    assert!(!dir.path().join("fileC").exists());
    assert!(!config.lock_path().exists());

    let history = history_of(&config);
    assert_eq!(history.current_version(), Some(v("1.0.0")));
    let failed = history.latest_entry(v("1.1.0")).unwrap();
    assert_eq!(failed.status, HistoryStatus::Failed);
    assert!(failed.error.as_deref().unwrap().contains("disk full"));
    assert!(history.latest_entry(v("1.2.0")).is_none());
}

#[test]
fn test_failed_step_leaves_tree_byte_identical() {
    let dir = TempDir::new().unwrap();
    let state = dir.path().join("state");
    fs::create_dir_all(state.join("nested")).unwrap();
    fs::write(state.join("settings.toml"), "theme = \"dark\"\n").unwrap();
    fs::write(state.join("nested/cache.bin"), [0u8, 159, 146, 150, 255]).unwrap();
    fs::write(state.join("obsolete.txt"), "remove me").unwrap();
    let before = snapshot(&state);

    let mut manager = MigrationManager::new(config_for(dir.path()));
    manager
        .register_migration(Migration::new(
            "2.0.0",
            "rewrite everything then fail",
            |ctx| {
                let settings = ctx.data_path("state/settings.toml");
                let cache = ctx.data_path("state/nested/cache.bin");
                let obsolete = ctx.data_path("state/obsolete.txt");
                let fresh = ctx.data_path("state/nested/fresh.json");
                for path in [&settings, &cache, &obsolete, &fresh] {
                    ctx.backup_file(path)?;
                }

                fs::write(&settings, "theme = \"light\"\nversion = 2\n")?;
                fs::write(&cache, b"")?;
                fs::remove_file(&obsolete)?;
                fs::write(&fresh, "{}")?;
                anyhow::bail!("validation of new settings failed")
            },
            |_| Ok(()),
        ))
        .unwrap();

    let result = manager.migrate().unwrap();
    assert!(!result.success);
    assert_eq!(snapshot(&state), before);
}

#[test]
fn test_panicking_step_is_reported_and_reverted() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("data.txt"), "original").unwrap();
    let config = config_for(dir.path());

    let mut manager = MigrationManager::new(config.clone());
    manager
        .register_migration(Migration::new(
            "1.0.0",
            "explodes",
            |ctx| {
                let path = ctx.data_path("data.txt");
                ctx.backup_file(&path)?;
                fs::write(&path, "half written")?;
                panic!("index out of bounds");
            },
            |_| Ok(()),
        ))
        .unwrap();

    let result = manager.migrate().unwrap();
    assert_eq!(result.migrations_applied, 0);
    let message = result.errors[0].to_string();
    assert!(message.contains("unexpected fault"));
    assert!(message.contains("index out of bounds"));
    assert_eq!(
        fs::read_to_string(dir.path().join("data.txt")).unwrap(),
        "original"
    );
    assert!(!config.lock_path().exists());
}

// =============================================================================
// Idempotence
// =============================================================================

#[test]
fn test_second_migrate_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let config = config_for(dir.path());
    let mut manager = MigrationManager::new(config.clone());
    manager
        .register_migrations(vec![
            write_file_migration("1.0.0", "a.txt", "a"),
            write_file_migration("1.1.0", "b.txt", "b"),
        ])
        .unwrap();

    let first = manager.migrate().unwrap();
    assert_eq!(first.migrations_applied, 2);
    let history_len = history_of(&config).entries().len();
    let audit_entries = audit_len(&config);

    let second = manager.migrate().unwrap();
    assert!(second.success);
    assert_eq!(second.migrations_applied, 0);
    assert!(second.errors.is_empty());
    assert_eq!(second.current_version, Some(v("1.1.0")));
    assert_eq!(history_of(&config).entries().len(), history_len);
    assert_eq!(audit_len(&config), audit_entries);
}

#[test]
fn test_migrate_with_nothing_registered() {
    let dir = TempDir::new().unwrap();
    let config = config_for(dir.path());
    let mut manager = MigrationManager::new(config.clone());

    let result = manager.migrate().unwrap();
    assert!(result.success);
    assert_eq!(result.migrations_applied, 0);
    assert_eq!(result.current_version, None);
    assert!(!config.lock_path().exists());
    assert!(!config.history_path().exists());
}

#[test]
fn test_fresh_manager_resumes_from_ledger() {
    let dir = TempDir::new().unwrap();
    let config = config_for(dir.path());

    let mut first = MigrationManager::new(config.clone());
    first
        .register_migration(write_file_migration("1.0.0", "a.txt", "a"))
        .unwrap();
    first.migrate().unwrap();
    drop(first);

    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    let mut second = MigrationManager::new(config);
    second
        .register_migration(Migration::new(
            "1.0.0",
            "write a.txt",
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            |_| Ok(()),
        ))
        .unwrap();
    second
        .register_migration(write_file_migration("1.1.0", "b.txt", "b"))
        .unwrap();

    let result = second.migrate().unwrap();
    assert_eq!(result.versions, vec![v("1.1.0")]);
    assert_eq!(runs.load(Ordering::SeqCst), 0);
}

// =============================================================================
// Rollback and migrate_to
// =============================================================================

#[test]
fn test_migrate_to_lower_target_rolls_back_in_descending_order() {
    let dir = TempDir::new().unwrap();
    let config = config_for(dir.path());
    let mut manager = MigrationManager::new(config.clone());
    manager
        .register_migrations(vec![
            write_file_migration("1.0.0", "one", "1"),
            write_file_migration("1.1.0", "two", "2"),
            write_file_migration("2.0.0", "three", "3"),
        ])
        .unwrap();
    manager.migrate().unwrap();

    let result = manager.migrate_to("1.0.0").unwrap();
    assert!(result.success);
    assert_eq!(result.migrations_applied, 2);
    assert_eq!(result.versions, vec![v("2.0.0"), v("1.1.0")]);
    assert_eq!(result.current_version, Some(v("1.0.0")));

    assert!(dir.path().join("one").exists());
    assert!(!dir.path().join("two").exists());
    assert!(!dir.path().join("three").exists());

    let history = history_of(&config);
    for version in ["1.1.0", "2.0.0"] {
        assert_eq!(
            history.latest_entry(v(version)).unwrap().status,
            HistoryStatus::RolledBack
        );
    }
    assert_eq!(
        history.latest_entry(v("1.0.0")).unwrap().status,
        HistoryStatus::Success
    );

    // And forward again to a middle version
    let forward = manager.migrate_to("1.1.0").unwrap();
    assert_eq!(forward.versions, vec![v("1.1.0")]);
    assert_eq!(forward.current_version, Some(v("1.1.0")));
    assert!(dir.path().join("two").exists());
    assert!(!dir.path().join("three").exists());
}

#[test]
fn test_migrate_to_rejects_malformed_target() {
    let dir = TempDir::new().unwrap();
    let mut manager = MigrationManager::new(config_for(dir.path()));
    let err = manager.migrate_to("v2").unwrap_err();
    assert!(matches!(err, MigrationError::InvalidVersion(_)));
}

#[test]
fn test_failed_rollback_keeps_version_applied() {
    let dir = TempDir::new().unwrap();
    let config = config_for(dir.path());
    let mut manager = MigrationManager::new(config.clone());
    manager
        .register_migration(Migration::new(
            "1.0.0",
            "irreversible",
            |ctx| {
                let path = ctx.data_path("kept.txt");
                ctx.backup_file(&path)?;
                fs::write(&path, "kept")?;
                Ok(())
            },
            |ctx| {
                let path = ctx.data_path("kept.txt");
                ctx.backup_file(&path)?;
                fs::write(&path, "clobbered")?;
                anyhow::bail!("cannot downgrade")
            },
        ))
        .unwrap();
    manager.migrate().unwrap();

    let result = manager.rollback().unwrap();
    assert!(!result.success);
    assert_eq!(result.migrations_applied, 0);
    assert_eq!(result.current_version, Some(v("1.0.0")));
    assert_eq!(
        fs::read_to_string(dir.path().join("kept.txt")).unwrap(),
        "kept"
    );

    let failures = AuditLogger::read_file(
        &config.audit_path(),
        &AuditQuery {
            operation: Some(AuditOperation::Rollback),
            status: Some(AuditStatus::Failed),
            ..Default::default()
        },
    );
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].version, Some(v("1.0.0")));
}

// =============================================================================
// Dry run
// =============================================================================

#[test]
fn test_dry_run_reports_without_persisting() {
    let dir = TempDir::new().unwrap();
    let config = config_for(dir.path()).with_dry_run(true);
    let mut manager = MigrationManager::new(config.clone());
    manager
        .register_migration(write_file_migration("1.0.0", "a.txt", "a"))
        .unwrap();

    let result = manager.migrate().unwrap();
    assert!(result.dry_run);
    assert_eq!(result.migrations_applied, 1);
    assert!(!dir.path().join("a.txt").exists());
    assert!(history_of(&config).entries().is_empty());
    assert_eq!(manager.pending_migrations(), vec![v("1.0.0")]);

    let completed = AuditLogger::read_file(
        &config.audit_path(),
        &AuditQuery {
            operation: Some(AuditOperation::Migrate),
            status: Some(AuditStatus::Completed),
            ..Default::default()
        },
    );
    assert_eq!(completed.len(), 1);
    let details = completed[0].details.as_ref().unwrap();
    assert_eq!(details["dryRun"], serde_json::Value::Bool(true));
}

// =============================================================================
// Locking across managers
// =============================================================================

#[test]
fn test_concurrent_managers_never_overlap() {
    let dir = TempDir::new().unwrap();
    let in_critical = Arc::new(AtomicBool::new(false));
    let overlaps = Arc::new(AtomicUsize::new(0));

    let spawn = |version: &'static str| {
        let config = config_for(dir.path());
        let in_critical = in_critical.clone();
        let overlaps = overlaps.clone();
        thread::spawn(move || {
            let mut manager = MigrationManager::new(config);
            manager
                .register_migration(Migration::new(
                    version,
                    format!("slow {version}"),
                    move |_| {
                        if in_critical.swap(true, Ordering::SeqCst) {
                            overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        thread::sleep(Duration::from_millis(150));
                        in_critical.store(false, Ordering::SeqCst);
                        Ok(())
                    },
                    |_| Ok(()),
                ))
                .unwrap();
            manager.migrate().unwrap()
        })
    };

    let first = spawn("1.0.0");
    let second = spawn("2.0.0");
    let a = first.join().unwrap();
    let b = second.join().unwrap();

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(a.migrations_applied + b.migrations_applied, 2);

    let history = history_of(&config_for(dir.path()));
    assert_eq!(history.current_version(), Some(v("2.0.0")));
    assert!(!config_for(dir.path()).lock_path().exists());
}

#[test]
fn test_live_foreign_lock_times_out_without_touching_state() {
    let dir = TempDir::new().unwrap();
    let config = config_for(dir.path()).with_lock_timeout(Duration::from_millis(200));
    let foreign = LockPayload {
        pid: 4242,
        hostname: "some-other-host".to_string(),
        acquired_at: Utc::now(),
        format_version: LockPayload::FORMAT_VERSION,
    };
    fs::write(config.lock_path(), serde_json::to_vec(&foreign).unwrap()).unwrap();

    let mut manager = MigrationManager::new(config.clone());
    manager
        .register_migration(write_file_migration("1.0.0", "a.txt", "a"))
        .unwrap();

    let err = manager.migrate().unwrap_err();
    assert!(err.is_lock_timeout());
    assert!(!dir.path().join("a.txt").exists());
    assert_eq!(LockPayload::read(&config.lock_path()).unwrap(), Some(foreign));
    assert!(history_of(&config).entries().is_empty());
    assert!(!config.audit_path().exists());
}

#[test]
fn test_stale_lock_is_reclaimed_by_migrate() {
    let dir = TempDir::new().unwrap();
    let config = config_for(dir.path());
    let stale = LockPayload {
        pid: 4242,
        hostname: "some-other-host".to_string(),
        acquired_at: Utc::now() - chrono::Duration::hours(2),
        format_version: LockPayload::FORMAT_VERSION,
    };
    fs::write(config.lock_path(), serde_json::to_vec(&stale).unwrap()).unwrap();

    let mut manager = MigrationManager::new(config.clone());
    manager
        .register_migration(write_file_migration("1.0.0", "a.txt", "a"))
        .unwrap();

    let result = manager.migrate().unwrap();
    assert_eq!(result.migrations_applied, 1);
    assert!(!config.lock_path().exists());
}

#[test]
fn test_orphaned_lock_is_reclaimed_by_migrate() {
    let dir = TempDir::new().unwrap();
    let config = config_for(dir.path());

    let mut child = std::process::Command::new("true").spawn().unwrap();
    let dead_pid = child.id();
    child.wait().unwrap();

    let orphan = LockPayload {
        pid: dead_pid,
        hostname: statemig::lock::local_hostname(),
        acquired_at: Utc::now(),
        format_version: LockPayload::FORMAT_VERSION,
    };
    fs::write(config.lock_path(), serde_json::to_vec(&orphan).unwrap()).unwrap();

    let mut manager = MigrationManager::new(config.clone());
    manager
        .register_migration(write_file_migration("1.0.0", "a.txt", "a"))
        .unwrap();

    let result = manager.migrate().unwrap();
    assert!(result.success);
    assert_eq!(result.migrations_applied, 1);
    assert!(!config.lock_path().exists());
}

// =============================================================================
// Inspection
// =============================================================================

#[test]
fn test_status_and_checksums_after_descriptor_change() {
    let dir = TempDir::new().unwrap();
    let config = config_for(dir.path());

    let mut manager = MigrationManager::new(config.clone());
    manager
        .register_migration(write_file_migration("1.0.0", "a.txt", "a"))
        .unwrap();
    manager.migrate().unwrap();

    let mut edited = MigrationManager::new(config);
    edited
        .register_migration(
            write_file_migration("1.0.0", "a.txt", "a").with_description("now documented"),
        )
        .unwrap();
    edited
        .register_migration(write_file_migration("1.1.0", "b.txt", "b"))
        .unwrap();

    let status = edited.status().unwrap();
    assert_eq!(status.current_version, Some(v("1.0.0")));
    assert_eq!(status.latest_version, Some(v("1.1.0")));
    assert_eq!(status.pending, vec![v("1.1.0")]);
    assert!(!status.is_up_to_date());

    let mismatches = edited.verify_checksums();
    assert_eq!(mismatches.len(), 1);
    assert_eq!(mismatches[0].version, v("1.0.0"));
}
