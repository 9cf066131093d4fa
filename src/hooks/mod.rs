//! The seam between schedulers and trackers. A runtime adapter (an async
//! executor's instrument hook, an event loop's tick callback) owns a
//! [`StepProbe`] and forwards exactly three moments to it: a step is about to
//! run, a step finished, the run loop is tearing down.

use tracing::warn;

use crate::page::{ExportPage, PageError};
use crate::tracker::{current_thread_owner, StallTracker};

/// The fixed capability set adapters program against. Implementations must
/// tolerate being called in any order the host scheduler produces, including
/// `after_run` without any steps.
pub trait RunLoopHooks {
    /// A unit of work is about to execute on the monitored context.
    fn before_step(&mut self);

    /// The unit of work yielded control back to the scheduler.
    fn after_step(&mut self);

    /// The run loop is shutting down; release monitoring resources.
    fn after_run(&mut self);
}

enum ProbeSlot {
    /// No tracker yet; the first `before_step` claims one.
    Pending,
    Bound(StallTracker),
    /// Allocation failed once; the probe stays inert instead of retrying on
    /// every step of a busy loop.
    Disabled,
}

/// A [`RunLoopHooks`] implementation that maps step boundaries onto a
/// tracker: Active while a step runs, Idle between steps, closed on
/// teardown.
///
/// The tracker is allocated lazily inside the first `before_step`, on the
/// thread being monitored, so the owner hint is that thread's id. A follow-up
/// run after `after_run` starts over with a fresh tracker. Failures are
/// swallowed: a probe that cannot get a slot must not take the host down.
pub struct StepProbe {
    page: Option<&'static ExportPage>,
    label: String,
    slot: ProbeSlot,
}

impl StepProbe {
    /// A probe over the process-wide export page.
    pub fn new(label: impl Into<String>) -> StepProbe {
        StepProbe {
            page: None,
            label: label.into(),
            slot: ProbeSlot::Pending,
        }
    }

    /// A probe over a specific page, for tests and embedders that manage
    /// their own page.
    pub fn for_page(page: &'static ExportPage, label: impl Into<String>) -> StepProbe {
        StepProbe {
            page: Some(page),
            label: label.into(),
            slot: ProbeSlot::Pending,
        }
    }

    /// The bound tracker's slot address, once the first step has run.
    pub fn tracker_address(&self) -> Option<usize> {
        match &self.slot {
            ProbeSlot::Bound(tracker) => Some(tracker.address()),
            _ => None,
        }
    }

    fn allocate(&self) -> Result<StallTracker, PageError> {
        let owner = current_thread_owner();
        match self.page {
            Some(page) => page.allocate(&self.label, owner),
            None => StallTracker::create(&self.label, owner),
        }
    }

    fn bind_if_needed(&mut self) {
        if matches!(self.slot, ProbeSlot::Pending) {
            match self.allocate() {
                Ok(tracker) => self.slot = ProbeSlot::Bound(tracker),
                Err(e) => {
                    warn!(label = %self.label, error = %e, "step probe disabled");
                    self.slot = ProbeSlot::Disabled;
                }
            }
        }
    }
}

impl RunLoopHooks for StepProbe {
    fn before_step(&mut self) {
        self.bind_if_needed();
        if let ProbeSlot::Bound(tracker) = &self.slot {
            tracker.go_active();
        }
    }

    fn after_step(&mut self) {
        if let ProbeSlot::Bound(tracker) = &self.slot {
            tracker.go_idle();
        }
    }

    fn after_run(&mut self) {
        if let ProbeSlot::Bound(tracker) = std::mem::replace(&mut self.slot, ProbeSlot::Pending) {
            tracker.close();
        }
    }
}
