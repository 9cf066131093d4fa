//! Owner-side tracker handles. A [`StallTracker`] marks one execution context
//! whose forward progress an external watcher can judge; all it does on the
//! hot path is store a timestamp and a state word into the export page.
//!
//! Handles are moved, never cloned: closing consumes the handle, so a tracker
//! cannot be used or closed after close. Registry-owned trackers that live
//! for the whole process are a separate type, [`PermanentTracker`], with no
//! close at all.

use std::fmt;
use std::mem;

use crate::page::slot::SlotState;
use crate::page::{monotonic_now_ns, ExportPage, PageError, TrackerSlot};

/// Owner hint meaning "a process-wide resource, not one particular thread".
/// Used for trackers guarding things like a runtime's global lock.
pub const PROCESS_WIDE_OWNER: u64 = 0;

/// The calling thread's kernel thread id, for use as an owner hint.
#[cfg(target_os = "linux")]
pub fn current_thread_owner() -> u64 {
    // SAFETY: gettid has no side effects.
    (unsafe { libc::gettid() }) as u64
}

#[cfg(not(target_os = "linux"))]
pub fn current_thread_owner() -> u64 {
    PROCESS_WIDE_OWNER
}

/// How a tracker publishes itself across the process boundary: the slot
/// address plus the generation the slot carried when this handle claimed it.
/// A reader that sees a different generation at that address is looking at a
/// reused slot and must discard everything it knew about the old one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterAddress {
    pub address: usize,
    pub generation: u64,
}

/// An owned claim on one export page slot.
///
/// Created Active. `go_active` / `go_idle` may be called from the owning
/// thread as often as it likes; both refresh the transition timestamp even
/// when the state does not change, so they double as heartbeats.
pub struct StallTracker {
    slot: &'static TrackerSlot,
    generation: u64,
    label: &'static str,
    owner_id: u64,
}

impl StallTracker {
    /// Claims a slot on the process-wide export page. The label shows up
    /// verbatim in watcher reports.
    pub fn create(label: &str, owner_id: u64) -> Result<StallTracker, PageError> {
        ExportPage::global()?.allocate(label, owner_id)
    }

    pub(crate) fn bind(
        slot: &'static TrackerSlot,
        generation: u64,
        label: &'static str,
        owner_id: u64,
    ) -> StallTracker {
        StallTracker {
            slot,
            generation,
            label,
            owner_id,
        }
    }

    /// Marks the tracked context as running and subject to stall detection.
    /// Lock-free, allocation-free, one clock read and two atomic stores.
    pub fn go_active(&self) {
        self.slot.transition(SlotState::Active, monotonic_now_ns());
    }

    /// Marks the tracked context as intentionally waiting. Idle trackers
    /// never alert no matter how stale their timestamp gets.
    pub fn go_idle(&self) {
        self.slot.transition(SlotState::Idle, monotonic_now_ns());
    }

    /// Releases the slot for reuse. The slot's generation changes, so a
    /// watcher holding the old address knows to forget this tracker.
    pub fn close(self) {
        let _ = self.slot.release();
        mem::forget(self);
    }

    /// Converts this tracker into one that lives for the rest of the
    /// process. There is no way back; the slot is never reclaimed.
    pub fn into_permanent(self) -> PermanentTracker {
        let permanent = PermanentTracker {
            slot: self.slot,
            generation: self.generation,
            label: self.label,
            owner_id: self.owner_id,
        };
        mem::forget(self);
        permanent
    }

    /// Address of the underlying slot. Stable until `close`.
    pub fn address(&self) -> usize {
        self.slot as *const TrackerSlot as usize
    }

    /// The versioned handle a runtime passes to its counter sink.
    pub fn export_address(&self) -> CounterAddress {
        CounterAddress {
            address: self.address(),
            generation: self.generation,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn label(&self) -> &str {
        self.label
    }

    pub fn owner_id(&self) -> u64 {
        self.owner_id
    }

    /// Whether the slot currently reads as Active. Owner-side view, used by
    /// tests and diagnostics.
    pub fn is_active(&self) -> bool {
        self.slot.state_word() == SlotState::Active as u64
    }
}

impl Drop for StallTracker {
    /// A dropped handle releases its slot like an explicit close. `close`
    /// and `into_permanent` forget `self` first, so the release runs once.
    fn drop(&mut self) {
        let _ = self.slot.release();
    }
}

impl fmt::Debug for StallTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StallTracker")
            .field("label", &self.label)
            .field("address", &format_args!("{:#x}", self.address()))
            .field("generation", &self.generation)
            .field("owner_id", &self.owner_id)
            .finish()
    }
}

/// A tracker that is part of the process for as long as the process exists.
/// Produced by [`StallTracker::into_permanent`]; the registry keeps these for
/// well-known counters like the runtime's global lock.
pub struct PermanentTracker {
    slot: &'static TrackerSlot,
    generation: u64,
    label: &'static str,
    owner_id: u64,
}

impl PermanentTracker {
    pub fn go_active(&self) {
        self.slot.transition(SlotState::Active, monotonic_now_ns());
    }

    pub fn go_idle(&self) {
        self.slot.transition(SlotState::Idle, monotonic_now_ns());
    }

    pub fn address(&self) -> usize {
        self.slot as *const TrackerSlot as usize
    }

    pub fn export_address(&self) -> CounterAddress {
        CounterAddress {
            address: self.address(),
            generation: self.generation,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn label(&self) -> &str {
        self.label
    }

    pub fn owner_id(&self) -> u64 {
        self.owner_id
    }
}

impl fmt::Debug for PermanentTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermanentTracker")
            .field("label", &self.label)
            .field("address", &format_args!("{:#x}", self.address()))
            .field("generation", &self.generation)
            .finish()
    }
}
