//! Shared utilities for integration tests

use anyhow::Result;
use std::thread;
use std::time::{Duration, Instant};

use vigil::page::SlotRecord;

/// Polls a predicate function until it returns true or timeout is reached
pub fn wait_for_condition<F>(predicate: F, timeout_ms: u64) -> Result<()>
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    let timeout = Duration::from_millis(timeout_ms);

    while start.elapsed() < timeout {
        if predicate() {
            return Ok(());
        }
        thread::sleep(Duration::from_millis(10));
    }

    anyhow::bail!("Timeout waiting for condition after {timeout_ms}ms")
}

/// Reads the slot record a tracker published, straight out of this process's
/// own memory.
pub fn read_record(slot_address: usize) -> SlotRecord {
    // SAFETY: tracker slots live on the leaked export page, so the address
    // stays valid for the life of the process.
    unsafe { std::ptr::read_volatile(slot_address as *const SlotRecord) }
}
