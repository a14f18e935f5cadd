//! Test helper binary for lock crash-safety integration tests
//!
//! Acquires the engine lock with crash handlers installed, prints READY and
//! then either waits to be killed or panics. The test harness checks that
//! the lock file is gone afterwards.
//!
//! Usage:
//!   lock_crash_helper --mode <mode> --data-dir <path>
//!
//! Modes:
//!   hold: acquire the lock, then wait forever
//!   panic: acquire the lock, then panic outside any migration step
//!   step-panic: run a migration whose step panics, then hold the lock

use std::env;
use std::io::Write;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use statemig::{EngineConfig, Migration, MigrationManager};

fn main() {
    let args: Vec<String> = env::args().collect();

    let mut mode = "hold".to_string();
    let mut data_dir = env::temp_dir().join("statemig-crash-helper");

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--mode" => {
                if let Some(m) = args.get(i + 1) {
                    mode = m.clone();
                }
                i += 2;
            }
            "--data-dir" => {
                if let Some(d) = args.get(i + 1) {
                    data_dir = PathBuf::from(d);
                }
                i += 2;
            }
            _ => {
                i += 1;
            }
        }
    }

    let config = EngineConfig::new(&data_dir)
        .with_crash_handlers(true)
        .with_lock_timeout(Duration::from_secs(5));

    match mode.as_str() {
        "hold" => hold(config),
        "panic" => panic_while_holding(config),
        "step-panic" => step_panic_then_hold(config),
        _ => {
            eprintln!("Unknown mode: {}", mode);
            std::process::exit(1);
        }
    }
}

/// Run a migration that blocks forever inside its step, so the lock stays held
fn hold(config: EngineConfig) {
    let mut manager = MigrationManager::new(config);
    manager
        .register_migration(Migration::new(
            "1.0.0",
            "block forever",
            |_| {
                ready();
                loop {
                    thread::sleep(Duration::from_secs(3600));
                }
            },
            |_| Ok(()),
        ))
        .expect("Failed to register migration");
    let _ = manager.migrate();
}

/// Panic while the lock is held but no step is running
fn panic_while_holding(config: EngineConfig) {
    let mut manager = MigrationManager::new(config);
    manager
        .register_migration(Migration::new(
            "1.0.0",
            "observe then panic",
            |_| Ok(()),
            |_| Ok(()),
        ))
        .expect("Failed to register migration");
    manager.subscribe(std::sync::Arc::new(|event: &statemig::MigrationEvent| {
        if matches!(event, statemig::MigrationEvent::MigrationComplete { .. }) {
            ready();
            thread::sleep(Duration::from_millis(100));
            panic!("Intentional panic for lock crash test");
        }
    }));
    let _ = manager.migrate();
}

/// A panicking step is contained by the engine; the process keeps running
fn step_panic_then_hold(config: EngineConfig) {
    let mut manager = MigrationManager::new(config);
    manager
        .register_migration(Migration::new(
            "1.0.0",
            "explodes",
            |_| panic!("step exploded"),
            |_| Ok(()),
        ))
        .expect("Failed to register migration");
    let result = manager.migrate().expect("Lock should be acquired");
    println!("ERRORS {}", result.errors.len());
    ready();
    loop {
        thread::sleep(Duration::from_secs(3600));
    }
}

fn ready() {
    println!("READY");
    let _ = std::io::stdout().flush();
}
