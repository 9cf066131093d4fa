//! Watch command - monitors an instrumented process for stalls

use anyhow::{Context, Result};
use std::sync::atomic::Ordering;

use crate::watcher::{Watcher, WatcherConfig};

/// Execute the watch command against `pid`. Runs until the target exits or a
/// termination signal arrives; stall reports go to stderr as they happen.
pub fn execute(pid: i32, config: WatcherConfig) -> Result<()> {
    let mut watcher = Watcher::new(pid, config);

    let shutdown = watcher.shutdown_flag();
    ctrlc::set_handler(move || {
        shutdown.store(true, Ordering::SeqCst);
    })
    .context("Failed to install shutdown handler")?;

    watcher
        .run()
        .with_context(|| format!("watch of pid {pid} ended early"))?;
    Ok(())
}
