//! Target process probing shared by the watcher and the supervisor.

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

/// What a null-signal probe of a pid tells us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// The process exists and we may signal it.
    Alive,
    /// The process does not exist (or the pid is invalid).
    Dead,
    /// The process exists but belongs to someone we cannot signal. The
    /// watcher reports this case specially: memory reads will almost
    /// certainly fail too.
    Denied,
}

/// Probes a pid with signal 0. The kernel answers differently for "no such
/// process" (`ESRCH`) and "exists, not yours" (`EPERM`), which is exactly the
/// split the watcher needs when deciding between "target exited" and "attach
/// denied".
pub fn probe(pid: i32) -> Liveness {
    if pid <= 0 {
        // 0 and negatives address process groups; never a valid target.
        return Liveness::Dead;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => Liveness::Alive,
        Err(Errno::EPERM) => Liveness::Denied,
        Err(Errno::ESRCH) => Liveness::Dead,
        Err(_) => Liveness::Dead,
    }
}

/// True while the pid refers to an existing process, whether or not we could
/// signal it.
pub fn is_alive(pid: i32) -> bool {
    probe(pid) != Liveness::Dead
}
