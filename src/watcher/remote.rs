//! Remote side of the export page: locating it inside another process's
//! address space and copying slots and labels out.
//!
//! Reads go through the OS's process-memory facility (`process_vm_readv` on
//! Linux) without stopping the target. Copies are not atomic with respect to
//! the target's stores; callers treat every snapshot as best-effort and let
//! the next poll correct anything torn.

use std::mem;

use proc_maps::get_process_maps;
use remoteprocess::{Process, ProcessMemory};
use tracing::debug;

use crate::page::{
    page_size, slot_capacity, slot_region_offset, PageHeader, SlotRecord, FORMAT_VERSION,
    PAGE_MAGIC,
};

use super::WatchError;

/// Where the export page and its slot array live inside the target.
#[derive(Debug, Clone, Copy)]
struct PageLayout {
    page_address: usize,
    slots_address: usize,
    slot_count: usize,
}

/// Outcome of one scan of the target's memory maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSearch {
    Found,
    /// No export page. `candidates` counts readable-looking page-sized
    /// mappings that were checked; `unreadable` counts those whose header
    /// could not be copied at all. All candidates unreadable usually means
    /// the kernel is refusing our reads and the target needs to grant us
    /// tracer access.
    Absent { candidates: usize, unreadable: usize },
}

/// A handle onto one target process's memory.
pub struct RemoteTarget {
    pid: i32,
    process: Process,
    page: Option<PageLayout>,
}

impl RemoteTarget {
    /// Opens the process for reading. This does not stop or signal the
    /// target; failures usually mean the process is gone.
    pub fn open(pid: i32) -> Result<RemoteTarget, WatchError> {
        let process = Process::new(pid).map_err(|e| WatchError::AttachFailed {
            pid,
            reason: format!("could not open process: {e}"),
        })?;
        Ok(RemoteTarget {
            pid,
            process,
            page: None,
        })
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn has_page(&self) -> bool {
        self.page.is_some()
    }

    pub fn page_address(&self) -> Option<usize> {
        self.page.map(|layout| layout.page_address)
    }

    /// Scans the target's memory maps for an export page: page-sized,
    /// readable, magic bytes in place, header address matching the mapping
    /// itself. First match wins; a process carries at most one page in
    /// normal operation.
    pub fn locate_page(&mut self) -> Result<PageSearch, WatchError> {
        let page_len = page_size();
        let maps = get_process_maps(self.pid).map_err(|e| WatchError::AttachFailed {
            pid: self.pid,
            reason: format!("could not read memory maps: {e}"),
        })?;

        let mut candidates = 0usize;
        let mut unreadable = 0usize;
        for map in &maps {
            if map.size() != page_len || !map.is_read() {
                continue;
            }
            candidates += 1;
            let header: PageHeader = match self.process.copy_struct(map.start()) {
                Ok(header) => header,
                Err(_) => {
                    unreadable += 1;
                    continue;
                }
            };
            if header.magic != PAGE_MAGIC {
                continue;
            }
            if header.self_address != map.start() as u64 {
                // A copied or stale page; not the live one.
                debug!(address = map.start(), "page magic without self address");
                continue;
            }
            if header.format_version != FORMAT_VERSION {
                return Err(WatchError::VersionMismatch {
                    found: header.format_version,
                    supported: FORMAT_VERSION,
                });
            }
            self.adopt(map.start(), map.size());
            return Ok(PageSearch::Found);
        }
        Ok(PageSearch::Absent {
            candidates,
            unreadable,
        })
    }

    /// Binds to a page whose address was communicated out of band instead of
    /// discovered by scanning.
    pub fn locate_page_at(&mut self, address: usize) -> Result<(), WatchError> {
        let header: PageHeader =
            self.process
                .copy_struct(address)
                .map_err(|e| WatchError::AttachFailed {
                    pid: self.pid,
                    reason: format!("could not read page header at {address:#x}: {e}"),
                })?;
        if header.magic != PAGE_MAGIC || header.self_address != address as u64 {
            return Err(WatchError::AttachFailed {
                pid: self.pid,
                reason: format!("no export page at {address:#x}"),
            });
        }
        if header.format_version != FORMAT_VERSION {
            return Err(WatchError::VersionMismatch {
                found: header.format_version,
                supported: FORMAT_VERSION,
            });
        }
        self.adopt(address, page_size());
        Ok(())
    }

    fn adopt(&mut self, start: usize, size: usize) {
        self.page = Some(PageLayout {
            page_address: start,
            slots_address: start + slot_region_offset(),
            slot_count: slot_capacity(size),
        });
    }

    /// Copies every slot out of the page. Returns `(slot_address, record)`
    /// pairs; an empty vec when no page is bound yet.
    pub fn snapshot(&self) -> Result<Vec<(usize, SlotRecord)>, WatchError> {
        let Some(layout) = self.page else {
            return Ok(Vec::new());
        };
        let records: Vec<SlotRecord> = self
            .process
            .copy_vec(layout.slots_address, layout.slot_count)
            .map_err(|e| WatchError::AttachFailed {
                pid: self.pid,
                reason: format!("slot snapshot failed: {e}"),
            })?;
        let stride = mem::size_of::<SlotRecord>();
        Ok(records
            .into_iter()
            .enumerate()
            .map(|(i, record)| (layout.slots_address + i * stride, record))
            .collect())
    }

    /// Resolves a record's label by copying its bytes out of the target's
    /// heap. Lossy on purpose: a reused or torn slot can point at anything.
    pub fn read_label(&self, record: &SlotRecord) -> String {
        if record.label_len == 0 {
            return String::new();
        }
        // A label longer than a page is garbage from a torn read; clamp it.
        let len = record.label_len.min(page_size() as u64) as usize;
        match self.process.copy(record.label_ptr as usize, len) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => "<unreadable>".to_owned(),
        }
    }

    /// The target's command line, for inclusion in reports.
    pub fn read_cmdline(&self) -> Option<String> {
        if !cfg!(target_os = "linux") {
            return None;
        }
        let raw = std::fs::read(format!("/proc/{}/cmdline", self.pid)).ok()?;
        let joined = raw
            .split(|byte| *byte == 0)
            .filter(|part| !part.is_empty())
            .map(|part| String::from_utf8_lossy(part).into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        if joined.is_empty() {
            None
        } else {
            Some(joined)
        }
    }
}
