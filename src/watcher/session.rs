//! Per-target bookkeeping between polls: which counters we know, which
//! generation each was last seen at, and when each last alerted. Pure
//! in-memory logic; the caller feeds it snapshots and a clock reading, which
//! keeps every timing scenario deterministic under test.

use std::collections::HashMap;
use std::time::Duration;

use crate::page::SlotRecord;

/// Watcher tuning, shared by the CLI, the supervisor, and the session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatcherConfig {
    /// How often the target's page is sampled.
    pub poll_interval: Duration,
    /// How long a tracker may sit Active before it counts as stalled.
    pub alert_interval: Duration,
    /// Quiet period per counter identity after an alert. Zero disables
    /// suppression and re-alerts on every poll while the stall lasts.
    pub suppress_window: Duration,
    /// Include per-thread register values in stall reports.
    pub print_locals: bool,
    /// Emit machine-readable JSON instead of human-formatted alerts.
    pub json_mode: bool,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        WatcherConfig {
            poll_interval: Duration::from_millis(500),
            alert_interval: Duration::from_secs(2),
            suppress_window: Duration::from_secs(30),
            print_locals: true,
            json_mode: false,
        }
    }
}

/// A counter the session is tracking, keyed by slot address.
#[derive(Debug, Clone, Copy)]
struct KnownCounter {
    generation: u64,
    last_alert_ns: Option<u64>,
}

/// A qualifying stall found during one poll.
#[derive(Debug, Clone)]
pub struct StallObservation {
    pub slot_address: usize,
    pub generation: u64,
    pub owner_id: u64,
    pub stalled_for: Duration,
    /// The raw record, kept so the reporter can resolve the label bytes.
    pub record: SlotRecord,
}

/// One watcher's view of one target process.
pub struct WatcherSession {
    target_pid: i32,
    attached: bool,
    config: WatcherConfig,
    known_counters: HashMap<usize, KnownCounter>,
}

impl WatcherSession {
    pub fn new(target_pid: i32, config: WatcherConfig) -> WatcherSession {
        WatcherSession {
            target_pid,
            attached: false,
            config,
            known_counters: HashMap::new(),
        }
    }

    pub fn target_pid(&self) -> i32 {
        self.target_pid
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    pub fn attached(&self) -> bool {
        self.attached
    }

    pub fn mark_attached(&mut self, attached: bool) {
        self.attached = attached;
    }

    /// Number of live counters seen on the last poll.
    pub fn known_counters(&self) -> usize {
        self.known_counters.len()
    }

    /// Digests one snapshot of the target's slots, taken at `now_ns` on the
    /// shared monotonic clock, and returns the stalls that should alert.
    ///
    /// Identity is (address, generation): when a slot's generation moves, the
    /// old counter is forgotten and the slot is adopted as a brand-new one,
    /// including a clean suppression state. Slots that are free, mid-claim,
    /// or torn are dropped from bookkeeping until they read clean again.
    pub fn observe(
        &mut self,
        slots: &[(usize, SlotRecord)],
        now_ns: u64,
    ) -> Vec<StallObservation> {
        let alert_ns = self.config.alert_interval.as_nanos() as u64;
        let suppress_ns = self.config.suppress_window.as_nanos() as u64;
        let mut stalls = Vec::new();

        for (address, record) in slots {
            if !record.is_live() {
                self.known_counters.remove(address);
                continue;
            }

            let known = self
                .known_counters
                .entry(*address)
                .or_insert(KnownCounter {
                    generation: record.generation,
                    last_alert_ns: None,
                });
            if known.generation != record.generation {
                // Slot reuse: rebind to the new identity.
                *known = KnownCounter {
                    generation: record.generation,
                    last_alert_ns: None,
                };
            }

            if !record.is_active() {
                continue;
            }
            // A timestamp from our future means the snapshot raced a store;
            // saturate to "no time elapsed" and let the next poll decide.
            let elapsed_ns = now_ns.saturating_sub(record.last_transition_ns);
            if elapsed_ns <= alert_ns {
                continue;
            }
            if let Some(last) = known.last_alert_ns {
                if now_ns.saturating_sub(last) < suppress_ns {
                    continue;
                }
            }
            known.last_alert_ns = Some(now_ns);
            stalls.push(StallObservation {
                slot_address: *address,
                generation: record.generation,
                owner_id: record.owner_id,
                stalled_for: Duration::from_nanos(elapsed_ns),
                record: *record,
            });
        }

        // Addresses absent from this snapshot are gone with their page.
        let seen: Vec<usize> = slots.iter().map(|(address, _)| *address).collect();
        self.known_counters
            .retain(|address, _| seen.contains(address));

        stalls
    }
}
