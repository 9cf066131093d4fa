//! The watcher: an external process that polls a target's export page and
//! raises diagnostics when a tracker has been Active past the alert
//! threshold.
//!
//! Explicit state machine: Starting (validate the target), Attaching (open
//! its memory, probe what we are allowed to do), Polling (sample slots every
//! poll interval), Alerting (capture and report, then back to Polling), and
//! Exiting. The target dying at any point is a clean exit, never an alert.

pub mod capture;
pub mod remote;
pub mod report;
pub mod session;

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::attach;
use crate::page::monotonic_now_ns;
use crate::process::{self, Liveness};

pub use remote::{PageSearch, RemoteTarget};
pub use report::{Reporter, Severity, StallReport};
pub use session::{StallObservation, WatcherConfig, WatcherSession};

#[derive(Debug, Error)]
pub enum WatchError {
    /// The target exists but its memory is closed to us, or it never
    /// existed. Fatal: the watch exits nonzero.
    #[error("could not attach to process {pid}: {reason}")]
    AttachFailed { pid: i32, reason: String },

    /// The target went away. Not an error for the exit code; the watcher
    /// turns this into a clean shutdown.
    #[error("target process {pid} exited")]
    TargetExited { pid: i32 },

    /// The target speaks a newer page format than this watcher.
    #[error("target export page has format {found}, this watcher supports {supported}")]
    VersionMismatch { found: u64, supported: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Starting,
    Attaching,
    Polling,
    Alerting,
    Exiting,
}

/// Drives one watch of one target until the target exits, the watcher is
/// interrupted, or attachment proves impossible.
pub struct Watcher {
    session: WatcherSession,
    reporter: Reporter,
    state: WatcherState,
    target: Option<RemoteTarget>,
    shutdown: Arc<AtomicBool>,
    capture_enabled: bool,
    pending: Vec<StallObservation>,
    announced_missing_page: bool,
}

impl Watcher {
    pub fn new(target_pid: i32, config: WatcherConfig) -> Watcher {
        Watcher {
            reporter: Reporter::new(config.json_mode),
            session: WatcherSession::new(target_pid, config),
            state: WatcherState::Starting,
            target: None,
            shutdown: Arc::new(AtomicBool::new(false)),
            capture_enabled: false,
            pending: Vec::new(),
            announced_missing_page: false,
        }
    }

    /// Flag checked between poll iterations; setting it makes `run` return
    /// promptly. Wire it to a signal handler.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn state(&self) -> WatcherState {
        self.state
    }

    pub fn session(&self) -> &WatcherSession {
        &self.session
    }

    fn pid(&self) -> i32 {
        self.session.target_pid()
    }

    /// Runs the state machine to completion. Target exit and interruption
    /// are `Ok`; attach failures and format mismatches are `Err`.
    pub fn run(&mut self) -> Result<(), WatchError> {
        let outcome = self.drive();
        self.state = WatcherState::Exiting;
        self.target = None;
        match outcome {
            Ok(()) => {
                self.reporter.event(Severity::Info, "watcher exiting");
                Ok(())
            }
            Err(WatchError::TargetExited { pid }) => {
                self.reporter
                    .event(Severity::Info, &format!("target {pid} exited, watch complete"));
                Ok(())
            }
            Err(e) => {
                self.reporter.event(Severity::Error, &e.to_string());
                Err(e)
            }
        }
    }

    fn drive(&mut self) -> Result<(), WatchError> {
        while !self.shutdown.load(Ordering::Relaxed) {
            match self.state {
                WatcherState::Starting => self.start()?,
                WatcherState::Attaching => self.attach()?,
                WatcherState::Polling => self.poll()?,
                WatcherState::Alerting => self.alert(),
                WatcherState::Exiting => break,
            }
        }
        Ok(())
    }

    fn start(&mut self) -> Result<(), WatchError> {
        let pid = self.pid();
        match process::probe(pid) {
            Liveness::Dead => {
                return Err(WatchError::AttachFailed {
                    pid,
                    reason: "no such process".to_owned(),
                })
            }
            Liveness::Denied => {
                self.reporter.event(
                    Severity::Warning,
                    &format!("process {pid} is not signalable by us; reads may be denied too"),
                );
            }
            Liveness::Alive => {}
        }
        let config = self.session.config();
        self.reporter.event(
            Severity::Info,
            &format!(
                "watching pid {pid} (poll {:?}, alert after {:?})",
                config.poll_interval, config.alert_interval
            ),
        );
        self.state = WatcherState::Attaching;
        Ok(())
    }

    fn attach(&mut self) -> Result<(), WatchError> {
        let pid = self.pid();
        let mut target = match RemoteTarget::open(pid) {
            Ok(target) => target,
            Err(_) if !process::is_alive(pid) => return Err(WatchError::TargetExited { pid }),
            Err(e) => return Err(e),
        };

        match target.locate_page()? {
            PageSearch::Found => {
                self.announce_page(&target);
            }
            PageSearch::Absent {
                candidates,
                unreadable,
            } => {
                if candidates > 0 && unreadable == candidates {
                    // Every candidate mapping refused our read: the kernel is
                    // blocking us, not the page missing.
                    return Err(WatchError::AttachFailed {
                        pid,
                        reason: format!(
                            "could not read target memory ({unreadable} candidate pages unreadable); \
                             have the target grant ptrace access to this watcher"
                        ),
                    });
                }
                self.reporter.event(
                    Severity::Info,
                    "target has no export page yet, waiting for it to instrument itself",
                );
                self.announced_missing_page = true;
            }
        }

        match attach::probe(pid) {
            Ok(()) => {
                self.capture_enabled = true;
                debug!(pid, "thread capture available");
            }
            Err(e) => {
                self.capture_enabled = false;
                self.reporter.event(
                    Severity::Warning,
                    &format!("thread capture unavailable, running timing-only: {e}"),
                );
            }
        }

        self.session.mark_attached(true);
        self.target = Some(target);
        self.state = WatcherState::Polling;
        Ok(())
    }

    fn poll(&mut self) -> Result<(), WatchError> {
        let pid = self.pid();
        if !process::is_alive(pid) {
            return Err(WatchError::TargetExited { pid });
        }
        if self.target.is_none() {
            self.state = WatcherState::Attaching;
            return Ok(());
        }
        self.refresh_page_binding()?;
        if self.sample()? {
            self.state = WatcherState::Alerting;
            return Ok(());
        }
        let poll_interval = self.session.config().poll_interval;
        self.interruptible_sleep(poll_interval);
        Ok(())
    }

    fn announce_page(&mut self, target: &RemoteTarget) {
        let address = target.page_address().unwrap_or_default();
        self.announced_missing_page = false;
        self.reporter
            .event(Severity::Info, &format!("found export page at {address:#x}"));
    }

    /// Retries page discovery while the target has not instrumented itself
    /// yet. The page cannot move or disappear once found, so a bound page is
    /// left alone.
    fn refresh_page_binding(&mut self) -> Result<(), WatchError> {
        let Some(target) = self.target.as_mut() else {
            return Ok(());
        };
        if target.has_page() {
            return Ok(());
        }
        match target.locate_page()? {
            PageSearch::Found => {
                let address = target.page_address().unwrap_or_default();
                self.announced_missing_page = false;
                self.reporter
                    .event(Severity::Info, &format!("found export page at {address:#x}"));
            }
            PageSearch::Absent { .. } => {
                if !self.announced_missing_page {
                    self.reporter
                        .event(Severity::Info, "still waiting for an export page");
                    self.announced_missing_page = true;
                }
            }
        }
        Ok(())
    }

    /// Takes one snapshot and runs the session over it. True means stalls
    /// were queued and the Alerting state should run.
    fn sample(&mut self) -> Result<bool, WatchError> {
        let pid = self.pid();
        let Some(target) = self.target.as_ref() else {
            return Ok(false);
        };
        if !target.has_page() {
            return Ok(false);
        }
        let slots = match target.snapshot() {
            Ok(slots) => slots,
            Err(e) => {
                if !process::is_alive(pid) {
                    return Err(WatchError::TargetExited { pid });
                }
                warn!(pid, error = %e, "snapshot failed, retrying next poll");
                return Ok(false);
            }
        };
        let stalls = self.session.observe(&slots, monotonic_now_ns());
        if stalls.is_empty() {
            return Ok(false);
        }
        self.pending = stalls;
        Ok(true)
    }

    fn alert(&mut self) {
        let pending = mem::take(&mut self.pending);
        let Some(target) = self.target.as_ref() else {
            self.state = WatcherState::Polling;
            return;
        };
        let config = *self.session.config();
        for observed in pending {
            let label = target.read_label(&observed.record);
            let threads = if self.capture_enabled {
                capture::capture_threads(
                    self.pid(),
                    observed.owner_id,
                    config.print_locals,
                    true,
                )
            } else {
                Vec::new()
            };
            let (relevant_threads, other_threads): (Vec<_>, Vec<_>) =
                threads.into_iter().partition(|dump| dump.relevant);
            let report = StallReport {
                pid: self.pid(),
                label,
                owner_id: observed.owner_id,
                generation: observed.generation,
                slot_address: observed.slot_address as u64,
                stalled_ms: observed.stalled_for.as_millis() as u64,
                degraded: !self.capture_enabled,
                cmdline: target.read_cmdline(),
                relevant_threads,
                other_threads,
            };
            self.reporter.stall(&report);
        }
        self.state = WatcherState::Polling;
    }

    fn interruptible_sleep(&self, total: Duration) {
        let mut remaining = total;
        while remaining > Duration::ZERO && !self.shutdown.load(Ordering::Relaxed) {
            let step = remaining.min(Duration::from_millis(50));
            std::thread::sleep(step);
            remaining = remaining.saturating_sub(step);
        }
    }
}
