//! Privileged attach plumbing: the Yama tracer grant a target issues for its
//! watcher, and the short-lived per-thread ptrace attachments the watcher
//! uses while capturing diagnostics.
//!
//! Attachments are guard-scoped. Whatever happens mid-capture, dropping the
//! guard detaches and the target resumes untouched; the watcher never writes
//! to the target.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("ptrace attach to thread {tid} failed: {source}")]
    Attach {
        tid: i32,
        source: nix::errno::Errno,
    },

    #[error("thread {tid} did not stop for inspection: {source}")]
    Stop {
        tid: i32,
        source: nix::errno::Errno,
    },

    #[error("could not read registers of thread {tid}: {source}")]
    Registers {
        tid: i32,
        source: nix::errno::Errno,
    },

    #[error("thread inspection is not supported on this platform")]
    Unsupported,
}

/// Minimal register view included in stall reports. On platforms where we
/// cannot read registers, reports simply omit it.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RegisterSnapshot {
    pub instruction_pointer: u64,
    pub stack_pointer: u64,
    pub frame_pointer: u64,
}

/// Allows `tracer_pid` to ptrace this process even under a restrictive Yama
/// `ptrace_scope`. Called by the target after spawning its watcher. Kernels
/// without Yama answer `EINVAL`; callers treat failure as a warning since the
/// scope may already permit the attach.
#[cfg(target_os = "linux")]
pub fn grant_ptrace_access(tracer_pid: i32) -> std::io::Result<()> {
    // SAFETY: PR_SET_PTRACER takes a pid argument and touches no memory.
    let rc = unsafe {
        libc::prctl(
            libc::PR_SET_PTRACER,
            tracer_pid as libc::c_ulong,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
        )
    };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn grant_ptrace_access(_tracer_pid: i32) -> std::io::Result<()> {
    // No Yama equivalent to configure.
    Ok(())
}

/// Opens this process to any tracer. Meant for test harnesses where the
/// watcher is a sibling process rather than a child.
#[cfg(target_os = "linux")]
pub fn grant_ptrace_access_any() -> std::io::Result<()> {
    // SAFETY: as above, no memory is involved.
    let rc = unsafe {
        libc::prctl(
            libc::PR_SET_PTRACER,
            libc::PR_SET_PTRACER_ANY,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
        )
    };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn grant_ptrace_access_any() -> std::io::Result<()> {
    Ok(())
}

/// A live ptrace attachment to one thread. The thread is stopped while the
/// guard exists and resumes when it drops.
#[cfg(target_os = "linux")]
pub struct AttachGuard {
    tid: nix::unistd::Pid,
}

#[cfg(target_os = "linux")]
impl AttachGuard {
    /// Attaches to `tid` and waits for it to stop.
    pub fn attach(tid: i32) -> Result<AttachGuard, AttachError> {
        use nix::sys::ptrace;
        use nix::sys::wait::{waitpid, WaitPidFlag};

        let pid = nix::unistd::Pid::from_raw(tid);
        ptrace::attach(pid).map_err(|source| AttachError::Attach { tid, source })?;
        // __WALL covers clone children, which is what threads are.
        if let Err(source) = waitpid(pid, Some(WaitPidFlag::__WALL)) {
            let _ = ptrace::detach(pid, None);
            return Err(AttachError::Stop { tid, source });
        }
        Ok(AttachGuard { tid: pid })
    }

    pub fn tid(&self) -> i32 {
        self.tid.as_raw()
    }

    /// Reads the stopped thread's registers.
    #[cfg(target_arch = "x86_64")]
    pub fn read_registers(&self) -> Result<RegisterSnapshot, AttachError> {
        let regs = nix::sys::ptrace::getregs(self.tid).map_err(|source| {
            AttachError::Registers {
                tid: self.tid(),
                source,
            }
        })?;
        Ok(RegisterSnapshot {
            instruction_pointer: regs.rip,
            stack_pointer: regs.rsp,
            frame_pointer: regs.rbp,
        })
    }

    #[cfg(not(target_arch = "x86_64"))]
    pub fn read_registers(&self) -> Result<RegisterSnapshot, AttachError> {
        Err(AttachError::Unsupported)
    }
}

#[cfg(target_os = "linux")]
impl Drop for AttachGuard {
    fn drop(&mut self) {
        let _ = nix::sys::ptrace::detach(self.tid, None);
    }
}

#[cfg(not(target_os = "linux"))]
pub struct AttachGuard {
    _tid: i32,
}

#[cfg(not(target_os = "linux"))]
impl AttachGuard {
    pub fn attach(_tid: i32) -> Result<AttachGuard, AttachError> {
        Err(AttachError::Unsupported)
    }

    pub fn tid(&self) -> i32 {
        self._tid
    }

    pub fn read_registers(&self) -> Result<RegisterSnapshot, AttachError> {
        Err(AttachError::Unsupported)
    }
}

/// One attach/detach round trip against the target's main thread. The
/// watcher runs this once at startup to decide between full diagnostics and
/// timing-only degraded mode.
pub fn probe(pid: i32) -> Result<(), AttachError> {
    AttachGuard::attach(pid).map(|_| ())
}
