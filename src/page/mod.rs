//! The export page: one process-lifetime shared memory page through which an
//! instrumented process exposes its stall trackers to an external watcher.
//!
//! The page is a single anonymous hardware page, deliberately leaked so its
//! address stays valid for as long as the process lives. It starts with a
//! self-identifying header (magic bytes, its own address, a format version)
//! followed by a fixed array of tracker slots. A watcher locates the page by
//! scanning the target's memory maps for a page-sized mapping whose header
//! checks out, or is handed the address out of band.

pub mod slot;

use std::mem;

use bytemuck::{Pod, Zeroable};
use memmap2::MmapMut;
use once_cell::sync::Lazy;
use thiserror::Error;

use crate::tracker::StallTracker;

pub use slot::{SlotRecord, SlotState, TrackerSlot};

/// Identifies an export page in a sea of anonymous page-sized mappings.
pub const PAGE_MAGIC: [u8; 16] = *b"VIGIL-EXPORT-PG\0";

/// Bumped whenever the header or slot layout changes incompatibly.
pub const FORMAT_VERSION: u64 = 0;

static PAGE_SIZE: Lazy<usize> = Lazy::new(|| {
    // SAFETY: sysconf reads a constant, no memory is touched.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
});

/// The hardware page size, which is also the exact size of an export page.
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Byte offset of the slot array within the page.
pub(crate) fn slot_region_offset() -> usize {
    let align = mem::align_of::<TrackerSlot>();
    (mem::size_of::<PageHeader>() + align - 1) & !(align - 1)
}

/// Number of slots that fit in a page of `page_bytes`.
pub(crate) fn slot_capacity(page_bytes: usize) -> usize {
    page_bytes.saturating_sub(slot_region_offset()) / mem::size_of::<SlotRecord>()
}

/// Reads the monotonic clock as nanoseconds. This clock has one system-wide
/// epoch, so the watcher can compare its own reading against timestamps the
/// target wrote. The call goes through the vDSO and never blocks.
pub fn monotonic_now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: clock_gettime only writes the out parameter.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    (ts.tv_sec as u64) * 1_000_000_000 + (ts.tv_nsec as u64)
}

/// Page header, written once at creation. `self_address` lets a scanner
/// confirm that a candidate mapping really is the page it claims to be and
/// not a stale copy of one.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct PageHeader {
    pub magic: [u8; 16],
    pub self_address: u64,
    pub format_version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PageError {
    /// Every slot in the page is claimed. Callers are expected to skip
    /// instrumentation rather than treat this as fatal.
    #[error("export page is full ({capacity} tracker slots in use)")]
    CapacityExceeded { capacity: usize },

    /// A slot was returned to the pool twice. Unreachable through the owned
    /// tracker handles; kept as a fail-fast for lower-level misuse.
    #[error("tracker slot released twice")]
    DoubleClose,

    #[error("could not map the export page: {0}")]
    MapFailed(String),
}

/// The process-wide export page. Create one with [`ExportPage::new`] for
/// isolated use (tests mostly) or share the global instance via
/// [`ExportPage::global`].
pub struct ExportPage {
    address: usize,
    slots: &'static [TrackerSlot],
}

impl ExportPage {
    /// Maps and initializes a fresh page. The mapping is leaked: trackers
    /// hand out raw addresses into it, so it must never move or unmap.
    pub fn new() -> Result<ExportPage, PageError> {
        let len = page_size();
        let mut map = MmapMut::map_anon(len).map_err(|e| PageError::MapFailed(e.to_string()))?;
        let address = map.as_ptr() as usize;

        let header = PageHeader {
            magic: PAGE_MAGIC,
            self_address: address as u64,
            format_version: FORMAT_VERSION,
        };
        let header_bytes = bytemuck::bytes_of(&header);
        map[..header_bytes.len()].copy_from_slice(header_bytes);

        let offset = slot_region_offset();
        // SAFETY: the region past the header is zero-filled and outlives the
        // process once the mapping is leaked below. A zeroed TrackerSlot is a
        // valid slot in the Free state.
        let (prefix, slots, _tail) = unsafe { map[offset..].align_to_mut::<TrackerSlot>() };
        debug_assert!(prefix.is_empty(), "slot region must start aligned");
        debug_assert_eq!(slots.len(), slot_capacity(len));
        let slots: &'static [TrackerSlot] = unsafe { mem::transmute::<&mut [TrackerSlot], _>(slots) };
        mem::forget(map);

        Ok(ExportPage { address, slots })
    }

    /// The shared page for this process, created on first use.
    pub fn global() -> Result<&'static ExportPage, PageError> {
        static GLOBAL: Lazy<Result<ExportPage, PageError>> = Lazy::new(ExportPage::new);
        GLOBAL.as_ref().map_err(|e| e.clone())
    }

    /// Claims a free slot, publishes it as Active, and returns the owning
    /// handle. Runs a single bounded pass over the slot array with no locks
    /// and no syscalls beyond the clock read; safe to call from a thread that
    /// is being monitored.
    ///
    /// The label is copied into leaked heap memory so the watcher can read it
    /// for as long as the slot stays claimed. Memory cost is one small string
    /// per allocate call.
    pub fn allocate(&self, label: &str, owner_id: u64) -> Result<StallTracker, PageError> {
        let label: &'static str = Box::leak(label.to_owned().into_boxed_str());
        for slot in self.slots {
            if !slot.try_claim() {
                continue;
            }
            let generation = slot.publish(
                owner_id,
                label.as_ptr() as u64,
                label.len() as u64,
                monotonic_now_ns(),
            );
            return Ok(StallTracker::bind(slot, generation, label, owner_id));
        }
        Err(PageError::CapacityExceeded {
            capacity: self.slots.len(),
        })
    }

    pub fn address(&self) -> usize {
        self.address
    }

    pub fn size(&self) -> usize {
        page_size()
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Count of slots currently claimed, for diagnostics and tests.
    pub fn slots_in_use(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state_word() != SlotState::Free as u64)
            .count()
    }
}
