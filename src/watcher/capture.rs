//! Per-thread diagnostics gathered when a stall alerts: names, scheduler
//! states and wait channels from procfs, plus an instruction pointer and
//! registers via a short ptrace stop when the watcher is allowed to.
//!
//! Everything here is best-effort. A thread that exits mid-capture or a
//! denied ptrace just thins out the report; the alert itself never fails.

use proc_maps::{get_process_maps, MapRange};
use serde::Serialize;
use tracing::debug;

use crate::attach::{AttachGuard, RegisterSnapshot};
use crate::tracker::PROCESS_WIDE_OWNER;

/// One thread of the target at capture time.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadDump {
    pub tid: i32,
    pub name: String,
    /// Kernel scheduler state, `R`/`S`/`D`/`Z`/..., `?` when unreadable.
    pub run_state: char,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_channel: Option<String>,
    /// Where the thread was executing, as `path+offset` into its mapping.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registers: Option<RegisterSnapshot>,
    /// Whether this thread is implicated by the stalled tracker's owner
    /// hint. Drives report grouping, not serialized itself.
    #[serde(skip)]
    pub relevant: bool,
}

/// Captures all threads of `pid`.
///
/// `owner_id` is the stalled tracker's owner hint: a specific tid marks that
/// thread relevant; the process-wide sentinel marks whichever threads are
/// currently runnable, since one of them is the likely culprit.
/// `ptrace_capture` reflects the attach probe at watcher startup; without it
/// the dump is procfs-only. `include_registers` gates raw register values.
pub fn capture_threads(
    pid: i32,
    owner_id: u64,
    include_registers: bool,
    ptrace_capture: bool,
) -> Vec<ThreadDump> {
    if !cfg!(target_os = "linux") {
        return Vec::new();
    }
    let tids = match list_threads(pid) {
        Ok(tids) => tids,
        Err(e) => {
            debug!(pid, error = %e, "could not list target threads");
            return Vec::new();
        }
    };
    let maps = if ptrace_capture {
        get_process_maps(pid).ok()
    } else {
        None
    };

    let mut dumps = Vec::with_capacity(tids.len());
    for tid in tids {
        let name = read_comm(pid, tid).unwrap_or_else(|| "<unknown>".to_owned());
        let run_state = read_run_state(pid, tid).unwrap_or('?');
        let wait_channel = read_wchan(pid, tid);

        let mut module = None;
        let mut registers = None;
        if ptrace_capture {
            match AttachGuard::attach(tid) {
                Ok(guard) => {
                    if let Ok(snapshot) = guard.read_registers() {
                        module = maps
                            .as_deref()
                            .and_then(|maps| attribute_ip(snapshot.instruction_pointer, maps));
                        if include_registers {
                            registers = Some(snapshot);
                        }
                    }
                }
                Err(e) => debug!(tid, error = %e, "thread attach failed mid-capture"),
            }
        }

        let relevant = if owner_id == PROCESS_WIDE_OWNER {
            run_state == 'R'
        } else {
            tid as u64 == owner_id
        };

        dumps.push(ThreadDump {
            tid,
            name,
            run_state,
            wait_channel,
            module,
            registers,
            relevant,
        });
    }
    dumps
}

fn list_threads(pid: i32) -> std::io::Result<Vec<i32>> {
    let mut tids = Vec::new();
    for entry in std::fs::read_dir(format!("/proc/{pid}/task"))? {
        let entry = entry?;
        if let Ok(tid) = entry.file_name().to_string_lossy().parse::<i32>() {
            tids.push(tid);
        }
    }
    tids.sort_unstable();
    Ok(tids)
}

fn read_comm(pid: i32, tid: i32) -> Option<String> {
    let comm = std::fs::read_to_string(format!("/proc/{pid}/task/{tid}/comm")).ok()?;
    let comm = comm.trim();
    if comm.is_empty() {
        None
    } else {
        Some(comm.to_owned())
    }
}

fn read_run_state(pid: i32, tid: i32) -> Option<char> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/task/{tid}/stat")).ok()?;
    // The comm field may contain spaces and parens; the state letter is the
    // first field after the last ')'.
    let tail = &stat[stat.rfind(')')? + 1..];
    tail.trim_start().chars().next()
}

fn read_wchan(pid: i32, tid: i32) -> Option<String> {
    let wchan = std::fs::read_to_string(format!("/proc/{pid}/task/{tid}/wchan")).ok()?;
    let wchan = wchan.trim();
    if wchan.is_empty() || wchan == "0" {
        None
    } else {
        Some(wchan.to_owned())
    }
}

fn attribute_ip(ip: u64, maps: &[MapRange]) -> Option<String> {
    let ip = ip as usize;
    let map = maps
        .iter()
        .find(|map| ip >= map.start() && ip < map.start() + map.size())?;
    let offset = ip - map.start();
    match map.filename() {
        Some(path) => Some(format!("{}+{offset:#x}", path.display())),
        None => Some(format!("<anonymous>+{offset:#x}")),
    }
}
