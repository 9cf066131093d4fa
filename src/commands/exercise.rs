//! Exercise command - hidden helper that instruments this process in a
//! canned way so the end-to-end tests have a real target to watch.

use anyhow::{anyhow, Context, Result};
use colored::Colorize;
use std::io::Write;
use std::str::FromStr;
use std::time::Duration;

use crate::attach;
use crate::tracker::{current_thread_owner, StallTracker};

/// Canned instrumentation scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// One counter, left active forever. A watcher should alert.
    Stall,
    /// One counter, parked idle. A watcher should stay quiet.
    Idle,
    /// A thousand create/close cycles first, so the surviving counter sits
    /// on a well-reused slot, then the same hold as `Stall`.
    Churn,
}

impl FromStr for Scenario {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "stall" => Ok(Scenario::Stall),
            "idle" => Ok(Scenario::Idle),
            "churn" => Ok(Scenario::Churn),
            _ => Err(anyhow!(
                "Unknown scenario: {s}. Known scenarios: stall, idle, churn"
            )),
        }
    }
}

/// Execute the exercise command: set up `scenario`, announce readiness on
/// stdout, then hold the state for `hold` seconds.
pub fn execute(scenario: Scenario, hold: f64) -> Result<()> {
    // The watcher is a sibling process, not a parent, so open tracer access
    // wide. Refusal is survivable; the watcher falls back to timing-only.
    if let Err(e) = attach::grant_ptrace_access_any() {
        eprintln!("{} could not open ptrace access: {e}", "!".yellow().bold());
    }

    let tracker = match scenario {
        Scenario::Stall => StallTracker::create("exercise stall", current_thread_owner())?,
        Scenario::Idle => {
            let tracker = StallTracker::create("exercise idle", current_thread_owner())?;
            tracker.go_idle();
            tracker
        }
        Scenario::Churn => {
            for _ in 0..1000 {
                StallTracker::create("churn worker", current_thread_owner())?.close();
            }
            StallTracker::create("exercise stall", current_thread_owner())?
        }
    };

    // The parent blocks on this line before starting its watcher.
    println!("ready pid={}", std::process::id());
    std::io::stdout()
        .flush()
        .context("Failed to flush readiness line")?;

    // Sit still so a watcher sees exactly the scenario state, not our
    // housekeeping.
    std::thread::sleep(Duration::from_secs_f64(hold));
    tracker.close();
    Ok(())
}
