//! Tracker slot layout shared between the instrumented process and the
//! watcher. The owning side sees atomics, the remote side copies plain words.

use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};

use bytemuck::{Pod, Zeroable};

use super::PageError;

/// Slot lifecycle states, stored as a single word in shared memory.
///
/// A freshly mapped page is zero-filled, so `Free` must be the zero value.
/// `Reserved` marks a slot that has been claimed but whose metadata is not
/// published yet; readers must skip it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum SlotState {
    Free = 0,
    Reserved = 1,
    Active = 2,
    Idle = 3,
}

impl SlotState {
    pub fn from_word(word: u64) -> Option<SlotState> {
        match word {
            0 => Some(SlotState::Free),
            1 => Some(SlotState::Reserved),
            2 => Some(SlotState::Active),
            3 => Some(SlotState::Idle),
            _ => None,
        }
    }
}

/// One slot as the owning process addresses it. Lives inside the export page
/// for the lifetime of the process and is never moved or unmapped.
///
/// Single-writer: after a claim, only the handle returned by
/// [`super::ExportPage::allocate`] stores to this slot. Everything is atomic
/// because unclaimed slots are probed concurrently by other allocating
/// threads, and because the words double as the cross-process read format.
#[repr(C)]
pub struct TrackerSlot {
    /// Odd while the slot is live, even while it is free. Bumped once on
    /// claim and once on release, so any reuse changes the value a remote
    /// reader saw.
    generation: AtomicU64,
    state: AtomicU64,
    last_transition_ns: AtomicU64,
    owner_id: AtomicU64,
    label_ptr: AtomicU64,
    label_len: AtomicU64,
}

/// The same slot as a remote reader copies it out of target memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct SlotRecord {
    pub generation: u64,
    pub state: u64,
    pub last_transition_ns: u64,
    pub owner_id: u64,
    pub label_ptr: u64,
    pub label_len: u64,
}

// The two views must stay layout-compatible.
const _: () = assert!(mem::size_of::<TrackerSlot>() == mem::size_of::<SlotRecord>());
const _: () = assert!(mem::align_of::<TrackerSlot>() == mem::align_of::<SlotRecord>());

impl SlotRecord {
    pub fn state(&self) -> Option<SlotState> {
        SlotState::from_word(self.state)
    }

    /// A slot is worth looking at only when its metadata is published (state
    /// Active or Idle) and its generation is odd. Anything else is free,
    /// mid-claim, or a torn copy, and is skipped until the next poll.
    pub fn is_live(&self) -> bool {
        self.generation % 2 == 1
            && matches!(self.state(), Some(SlotState::Active) | Some(SlotState::Idle))
    }

    pub fn is_active(&self) -> bool {
        self.is_live() && self.state == SlotState::Active as u64
    }
}

impl TrackerSlot {
    /// Attempts to take ownership of a free slot. On success the slot sits in
    /// `Reserved` until [`publish`](Self::publish) runs; the caller must
    /// follow up immediately.
    pub(crate) fn try_claim(&self) -> bool {
        self.state
            .compare_exchange(
                SlotState::Free as u64,
                SlotState::Reserved as u64,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Fills in metadata and makes the slot visible as a live Active tracker.
    /// Returns the new (odd) generation. Must only be called by the thread
    /// that won [`try_claim`](Self::try_claim).
    pub(crate) fn publish(&self, owner_id: u64, label_ptr: u64, label_len: u64, now_ns: u64) -> u64 {
        self.owner_id.store(owner_id, Ordering::Relaxed);
        self.label_ptr.store(label_ptr, Ordering::Relaxed);
        self.label_len.store(label_len, Ordering::Relaxed);
        self.last_transition_ns.store(now_ns, Ordering::Relaxed);
        let previous = self.generation.fetch_add(1, Ordering::AcqRel);
        debug_assert!(previous % 2 == 0, "claimed a slot that was already live");
        self.state.store(SlotState::Active as u64, Ordering::Release);
        previous + 1
    }

    /// Records a state transition. The timestamp is written first so a reader
    /// that observes the new state also observes a timestamp at least as new.
    pub(crate) fn transition(&self, state: SlotState, now_ns: u64) {
        self.last_transition_ns.store(now_ns, Ordering::Relaxed);
        self.state.store(state as u64, Ordering::Release);
    }

    /// Returns the slot to the free pool. The generation goes even before the
    /// state changes, so a reader never sees a free slot with a live-looking
    /// generation.
    pub(crate) fn release(&self) -> Result<(), PageError> {
        let previous = self.generation.fetch_add(1, Ordering::AcqRel);
        if previous % 2 == 0 {
            // Not live: restore parity and report the misuse.
            self.generation.fetch_add(1, Ordering::AcqRel);
            debug_assert!(false, "released a slot that was not claimed");
            return Err(PageError::DoubleClose);
        }
        self.state.store(SlotState::Free as u64, Ordering::Release);
        Ok(())
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn state_word(&self) -> u64 {
        self.state.load(Ordering::Acquire)
    }

    /// In-process snapshot of the slot words, mainly for tests and
    /// diagnostics. The remote reader gets the same shape via a memory copy.
    pub(crate) fn record(&self) -> SlotRecord {
        SlotRecord {
            generation: self.generation.load(Ordering::Acquire),
            state: self.state.load(Ordering::Acquire),
            last_transition_ns: self.last_transition_ns.load(Ordering::Relaxed),
            owner_id: self.owner_id.load(Ordering::Relaxed),
            label_ptr: self.label_ptr.load(Ordering::Relaxed),
            label_len: self.label_len.load(Ordering::Relaxed),
        }
    }
}
