//! Host-side watcher lifecycle: an instrumented process spawns `vigil watch
//! <its own pid>` as a child, grants it tracer access, and forgets about it.
//!
//! One watcher per process. `start` is idempotent while the child lives;
//! `stop` asks nicely with SIGTERM before killing. [`bootstrap`] is the
//! convenience entry point for hosts that just want monitoring turned on.

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use once_cell::sync::Lazy;
use thiserror::Error;
use tracing::{debug, warn};
use wait_timeout::ChildExt;
use which::which;

use crate::attach;
use crate::registry::{CounterKind, CounterRegistry};
use crate::watcher::WatcherConfig;

#[derive(Debug, Error)]
pub enum SuperviseError {
    #[error("could not spawn a watcher: {reason}")]
    SpawnFailed { reason: String },
}

/// Finds the watcher binary: `VIGIL_BIN` override first, then this very
/// executable when the host *is* vigil, then `PATH`.
fn resolve_watcher_binary() -> Result<PathBuf, SuperviseError> {
    if let Ok(path) = std::env::var("VIGIL_BIN") {
        if !path.is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    if let Ok(exe) = std::env::current_exe() {
        let is_vigil = exe
            .file_stem()
            .map(|stem| stem == "vigil")
            .unwrap_or(false);
        if is_vigil {
            return Ok(exe);
        }
    }
    which("vigil").map_err(|e| SuperviseError::SpawnFailed {
        reason: format!("no vigil binary found: {e} (set VIGIL_BIN or install vigil on PATH)"),
    })
}

fn seconds_arg(duration: Duration) -> String {
    format!("{}", duration.as_secs_f64())
}

/// Owns at most one watcher child for this process.
pub struct WatcherSupervisor {
    child: Mutex<Option<Child>>,
}

impl WatcherSupervisor {
    pub fn new() -> WatcherSupervisor {
        WatcherSupervisor {
            child: Mutex::new(None),
        }
    }

    /// The process-wide supervisor.
    pub fn global() -> &'static WatcherSupervisor {
        static GLOBAL: Lazy<WatcherSupervisor> = Lazy::new(WatcherSupervisor::new);
        &GLOBAL
    }

    /// Spawns a watcher for this process unless one is already running.
    /// Returns true when a new watcher was started. After the spawn the
    /// child is granted ptrace access to us; a failed grant is only a
    /// warning since the kernel may allow the attach anyway.
    pub fn start(&self, config: &WatcherConfig) -> Result<bool, SuperviseError> {
        let mut guard = self.lock();
        if let Some(child) = guard.as_mut() {
            match child.try_wait() {
                Ok(None) => return Ok(false),
                // Exited or unknowable: reap and start over.
                _ => *guard = None,
            }
        }

        let binary = resolve_watcher_binary()?;
        let mut command = Command::new(&binary);
        command
            .arg("watch")
            .arg(std::process::id().to_string())
            .arg("--poll-interval")
            .arg(seconds_arg(config.poll_interval))
            .arg("--alert-interval")
            .arg(seconds_arg(config.alert_interval))
            .arg("--traceback-suppress")
            .arg(seconds_arg(config.suppress_window))
            .stdin(Stdio::null());
        if !config.print_locals {
            command.arg("--no-print-locals");
        }
        if config.json_mode {
            command.arg("--json-mode");
        }

        let child = command.spawn().map_err(|e| SuperviseError::SpawnFailed {
            reason: format!("{} failed to start: {e}", binary.display()),
        })?;
        if let Err(e) = attach::grant_ptrace_access(child.id() as i32) {
            warn!(error = %e, "ptrace grant failed, the watcher may run timing-only");
        }
        debug!(watcher_pid = child.id(), "watcher started");
        *guard = Some(child);
        Ok(true)
    }

    /// Stops the watcher if one is running. Returns true when something was
    /// actually stopped.
    pub fn stop(&self) -> bool {
        let mut guard = self.lock();
        let Some(mut child) = guard.take() else {
            return false;
        };
        // The watcher exits cleanly on SIGTERM between poll iterations.
        let _ = kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM);
        match child.wait_timeout(Duration::from_secs(2)) {
            Ok(Some(_)) => {}
            _ => {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
        true
    }

    /// Whether a previously started watcher is still alive.
    pub fn running(&self) -> bool {
        let mut guard = self.lock();
        match guard.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(None) => true,
                _ => {
                    *guard = None;
                    false
                }
            },
            None => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Child>> {
        self.child.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for WatcherSupervisor {
    fn default() -> Self {
        WatcherSupervisor::new()
    }
}

/// Starts the process-wide watcher. Idempotent; see
/// [`WatcherSupervisor::start`].
pub fn start_watcher(config: &WatcherConfig) -> Result<bool, SuperviseError> {
    WatcherSupervisor::global().start(config)
}

/// Stops the process-wide watcher if it is running.
pub fn stop_watcher() -> bool {
    WatcherSupervisor::global().stop()
}

/// Turnkey monitoring: instrument every counter the runtime supports, and if
/// anything got instrumented, start a watcher. Returns the actions taken, an
/// empty list when the runtime supports nothing.
pub fn bootstrap(config: &WatcherConfig) -> Result<Vec<String>, SuperviseError> {
    let mut actions = Vec::new();
    match CounterRegistry::global() {
        Ok(registry) => match registry.instrument(CounterKind::GlobalLock) {
            Ok(()) => actions.push("instrumented global lock".to_owned()),
            Err(e) => debug!(error = %e, "global lock not instrumented"),
        },
        Err(e) => debug!(error = %e, "export page unavailable"),
    }
    if actions.is_empty() {
        return Ok(actions);
    }
    if WatcherSupervisor::global().start(config)? {
        actions.push("started watcher".to_owned());
    }
    Ok(actions)
}
