//! Crash safety for held lock files
//!
//! This module makes sure a lock file does not outlive the process that
//! holds it when the process is interrupted, terminated or panics.
//!
//! # Problem Solved
//! A migration run killed by Ctrl+C or a service manager leaves its lock
//! file behind. Every later run then waits for the staleness threshold
//! before it can reclaim the lock.
//!
//! # Solution
//! - Track every lock path this process currently holds in a global registry
//! - A signal thread handles SIGINT, SIGTERM and SIGHUP: while a lock is
//!   armed it removes the lock files and exits with `128 + signo`; with
//!   nothing armed it falls back to the default disposition
//! - A chained panic hook removes armed lock files before the previous hook
//!   runs

use std::cell::Cell;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use nix::errno::Errno;
use nix::sys::signal;
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::lock::LockPayload;

/// Global registry of held lock paths
static LOCK_REGISTRY: OnceLock<Arc<Mutex<LockRegistry>>> = OnceLock::new();

/// Set once the signal thread and panic hook are in place
static HANDLERS_INSTALLED: OnceLock<()> = OnceLock::new();

thread_local! {
    /// True while a panic on this thread will be caught and handled by the engine
    static PANIC_IS_CAUGHT: Cell<bool> = const { Cell::new(false) };
}

/// Run a migration step, turning a panic into `Err(message)`.
///
/// The panic hook leaves held locks alone while this is on the stack; the
/// engine rolls back and releases through its normal path instead.
pub fn catch_step_panic<R>(f: impl FnOnce() -> R) -> Result<R, String> {
    let outer = PANIC_IS_CAUGHT.with(|flag| flag.replace(true));
    let result = std::panic::catch_unwind(AssertUnwindSafe(f));
    PANIC_IS_CAUGHT.with(|flag| flag.set(outer));

    result.map_err(|payload| {
        if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        }
    })
}

/// Registry tracking the lock files this process holds
#[derive(Debug, Default)]
pub struct LockRegistry {
    /// Lock path -> number of holders in this process
    armed: HashMap<PathBuf, usize>,
}

impl LockRegistry {
    /// Get or create the global lock registry
    pub fn global() -> Arc<Mutex<LockRegistry>> {
        LOCK_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(LockRegistry::default())))
            .clone()
    }

    /// Start protecting a lock path
    pub fn arm(&mut self, path: &Path) {
        *self.armed.entry(path.to_path_buf()).or_insert(0) += 1;
        debug!(path = %path.display(), "Armed crash guard for lock");
    }

    /// Stop protecting a lock path (called after a normal release)
    pub fn disarm(&mut self, path: &Path) {
        if let Some(count) = self.armed.get_mut(path) {
            *count -= 1;
            if *count == 0 {
                self.armed.remove(path);
            }
            debug!(path = %path.display(), "Disarmed crash guard for lock");
        }
    }

    pub fn is_armed(&self, path: &Path) -> bool {
        self.armed.contains_key(path)
    }

    /// Number of armed lock paths
    pub fn count(&self) -> usize {
        self.armed.len()
    }

    /// Remove every armed lock file owned by this process.
    /// Returns the number of files removed.
    pub fn release_all(&mut self) -> usize {
        let own_pid = std::process::id();
        let mut removed = 0;
        for path in self.armed.keys() {
            match LockPayload::read(path) {
                Ok(Some(payload)) if payload.pid == own_pid => match std::fs::remove_file(path) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove lock during crash cleanup"),
                },
                Ok(Some(payload)) => {
                    warn!(path = %path.display(), pid = payload.pid, "Lock now owned by another process, leaving it")
                }
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Unreadable lock during crash cleanup"),
            }
        }
        self.armed.clear();
        removed
    }
}

/// Check if a process is still alive (not dead or zombie)
///
/// `ESRCH` is the only answer treated as dead; permission errors mean the
/// process exists but belongs to someone else.
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }

    match signal::kill(Pid::from_raw(raw), None) {
        Err(Errno::ESRCH) => return false,
        Ok(()) | Err(_) => {}
    }

    // Zombies still answer signals but are not running
    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        // The comm field may contain spaces, so the state follows the last ')'
        if let Some(state) = stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
        {
            return !matches!(state, "Z" | "X");
        }
    }

    // If we can't read /proc, assume alive (safe default)
    true
}

/// Install the process-wide signal thread and panic hook.
/// Safe to call repeatedly; only the first call installs anything.
pub fn install_crash_handlers() -> Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;
    use std::thread;

    if HANDLERS_INSTALLED.get().is_some() {
        return Ok(());
    }

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;
    if HANDLERS_INSTALLED.set(()).is_err() {
        // Lost a race with another caller; its thread is already running
        signals.handle().close();
        return Ok(());
    }

    thread::Builder::new()
        .name("statemig-crash-guard".to_string())
        .spawn(move || {
            for sig in signals.forever() {
                let signal_name = match sig {
                    SIGINT => "SIGINT",
                    SIGTERM => "SIGTERM",
                    SIGHUP => "SIGHUP",
                    _ => "UNKNOWN",
                };

                let removed = match LockRegistry::global().lock() {
                    Ok(mut registry) if registry.count() > 0 => Some(registry.release_all()),
                    _ => None,
                };

                match removed {
                    Some(count) => {
                        info!(signal = signal_name, removed = count, "Released held locks on signal, exiting");
                        std::process::exit(128 + sig);
                    }
                    None => {
                        // No lock held: behave as if we never hooked the signal
                        if let Err(e) = signal_hook::low_level::emulate_default_handler(sig) {
                            warn!(signal = signal_name, error = %e, "Failed to emulate default signal action");
                            std::process::exit(128 + sig);
                        }
                    }
                }
            }
        })?;

    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let caught = PANIC_IS_CAUGHT.with(|flag| flag.get());
        // try_lock below: the panicking thread may already hold the registry
        if caught {
            debug!("Panic inside a migration step; lock stays with the engine");
        } else if let Ok(mut registry) = LockRegistry::global().try_lock() {
            if registry.count() > 0 {
                registry.release_all();
            }
        }
        previous(info);
    }));

    debug!("Crash handlers installed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn write_lock(path: &Path, pid: u32) {
        let payload = LockPayload {
            pid,
            hostname: crate::lock::local_hostname(),
            acquired_at: Utc::now(),
            format_version: LockPayload::FORMAT_VERSION,
        };
        std::fs::write(path, serde_json::to_vec(&payload).unwrap()).unwrap();
    }

    #[test]
    fn test_registry_arm_disarm_counts() {
        let mut registry = LockRegistry::default();
        let path = Path::new("/tmp/statemig-registry-test.lock");

        registry.arm(path);
        registry.arm(path);
        assert_eq!(registry.count(), 1);

        registry.disarm(path);
        assert!(registry.is_armed(path));

        registry.disarm(path);
        assert!(!registry.is_armed(path));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_release_all_removes_only_own_locks() {
        let dir = TempDir::new().unwrap();
        let mine = dir.path().join("mine.lock");
        let theirs = dir.path().join("theirs.lock");
        write_lock(&mine, std::process::id());
        write_lock(&theirs, std::process::id().wrapping_add(1));

        let mut registry = LockRegistry::default();
        registry.arm(&mine);
        registry.arm(&theirs);

        assert_eq!(registry.release_all(), 1);
        assert!(!mine.exists());
        assert!(theirs.exists());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_is_process_alive_self() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn test_is_process_alive_nonexistent() {
        // Beyond the default pid_max, so never a live process
        assert!(!is_process_alive(999_999_999));
        assert!(!is_process_alive(0));
    }

    #[test]
    fn test_is_process_alive_reaped_child() {
        let mut child = std::process::Command::new("true")
            .spawn()
            .expect("Failed to spawn true");
        let pid = child.id();
        let _ = child.wait();
        assert!(!is_process_alive(pid));
    }

    #[test]
    fn test_catch_step_panic_returns_message() {
        let caught = catch_step_panic(|| -> u32 { panic!("step exploded") });
        assert_eq!(caught.unwrap_err(), "step exploded");

        let formatted = catch_step_panic(|| -> u32 { panic!("code {}", 7) });
        assert_eq!(formatted.unwrap_err(), "code 7");

        assert_eq!(catch_step_panic(|| 5), Ok(5));
        assert!(!PANIC_IS_CAUGHT.with(|flag| flag.get()));
    }

    #[test]
    fn test_install_is_idempotent() {
        install_crash_handlers().unwrap();
        install_crash_handlers().unwrap();
    }
}
