//! Test helper functions for E2E tests
//!
//! Everything here drives the compiled `vigil` binary. Cargo sets
//! `CARGO_BIN_EXE_vigil` for integration tests inside the crate, so the tests
//! always run the binary from the current build.

use anyhow::{Context, Result};
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use wait_timeout::ChildExt;

/// Path to the binary under test.
pub fn vigil_bin() -> &'static str {
    env!("CARGO_BIN_EXE_vigil")
}

/// Spawns `vigil exercise <scenario>` and blocks until the child reports
/// readiness on stdout, meaning its export page and tracker are live.
pub fn spawn_exercise(scenario: &str) -> Result<Child> {
    let mut child = Command::new(vigil_bin())
        .args(["exercise", scenario, "--hold", "30"])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .context("Failed to spawn exercise target")?;

    let stdout = child.stdout.take().context("no stdout handle")?;
    let mut line = String::new();
    BufReader::new(stdout)
        .read_line(&mut line)
        .context("Failed to read readiness line")?;
    if !line.starts_with("ready pid=") {
        let _ = child.kill();
        let _ = child.wait();
        anyhow::bail!("unexpected readiness line: {line:?}");
    }
    Ok(child)
}

/// Kills and reaps a child, ignoring "already gone".
pub fn kill_and_reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// What a finished watcher left behind.
pub struct WatchOutcome {
    pub status: ExitStatus,
    pub stderr: String,
}

/// Runs `vigil watch <pid> <extra_args>` for `run_for`, then asks it to stop
/// with SIGTERM and collects stderr plus the exit status. A watcher that
/// ignores the signal is killed after five seconds.
pub fn run_watch_for(pid: u32, extra_args: &[&str], run_for: Duration) -> Result<WatchOutcome> {
    let mut watcher = Command::new(vigil_bin())
        .arg("watch")
        .arg(pid.to_string())
        .args(extra_args)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .context("Failed to spawn watcher")?;

    let mut stderr = watcher.stderr.take().context("no stderr handle")?;
    let reader = std::thread::spawn(move || {
        let mut text = String::new();
        let _ = stderr.read_to_string(&mut text);
        text
    });

    std::thread::sleep(run_for);
    let _ = kill(Pid::from_raw(watcher.id() as i32), Signal::SIGTERM);

    let status = match watcher
        .wait_timeout(Duration::from_secs(5))
        .context("Failed waiting for watcher")?
    {
        Some(status) => status,
        None => {
            watcher.kill().context("Failed to kill stuck watcher")?;
            watcher.wait().context("Failed to reap stuck watcher")?
        }
    };
    let stderr = reader.join().unwrap_or_default();
    Ok(WatchOutcome { status, stderr })
}

/// Parses every line of stderr that is valid JSON.
pub fn json_lines(stderr: &str) -> Vec<serde_json::Value> {
    stderr
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

/// Extracts the stall payloads from JSON-mode stderr.
pub fn json_stalls(stderr: &str) -> Vec<serde_json::Value> {
    json_lines(stderr)
        .into_iter()
        .filter(|entry| entry["severity"] == "ERROR" && entry["stall"].is_object())
        .map(|entry| entry["stall"].clone())
        .collect()
}
