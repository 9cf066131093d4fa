//! Process-wide registry of well-known counters.
//!
//! A language runtime that can expose a progress counter (today: its global
//! lock) registers a sink here at startup; instrumentation code then asks the
//! registry to wire that counter to a tracker. Without a sink the runtime
//! simply does not support the counter and instrumentation fails with
//! [`RegistryError::UnsupportedRuntime`].

use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use thiserror::Error;

use crate::page::{ExportPage, PageError};
use crate::tracker::{CounterAddress, PermanentTracker, PROCESS_WIDE_OWNER};

/// Well-known counters a runtime may expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterKind {
    /// The runtime's global interpreter or scheduler lock.
    GlobalLock,
}

impl CounterKind {
    /// Label under which this counter's tracker shows up in watcher reports.
    pub fn label(self) -> &'static str {
        match self {
            CounterKind::GlobalLock => "global lock",
        }
    }
}

/// Callback through which the runtime learns where its counter lives. The
/// sink runs while the registry is locked; it must not call back into the
/// registry.
pub type CounterSink = Box<dyn Fn(CounterAddress) + Send + Sync>;

#[derive(Debug, Error)]
pub enum RegistryError {
    /// No sink is registered for the requested counter: the running runtime
    /// has no way to drive it.
    #[error("runtime exposes no hook for the {} counter", .kind.label())]
    UnsupportedRuntime { kind: CounterKind },

    #[error(transparent)]
    Page(#[from] PageError),
}

#[derive(Default)]
struct Inner {
    global_lock_sink: Option<CounterSink>,
    instrumented: HashMap<CounterKind, PermanentTracker>,
}

/// Registry tying counter kinds to permanent trackers. One per process in
/// normal use ([`CounterRegistry::global`]); tests build their own against a
/// private page.
pub struct CounterRegistry {
    page: &'static ExportPage,
    inner: Mutex<Inner>,
}

impl CounterRegistry {
    pub fn new(page: &'static ExportPage) -> CounterRegistry {
        CounterRegistry {
            page,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// The registry bound to the process-wide export page.
    pub fn global() -> Result<&'static CounterRegistry, PageError> {
        static GLOBAL: Lazy<Result<CounterRegistry, PageError>> =
            Lazy::new(|| ExportPage::global().map(CounterRegistry::new));
        GLOBAL.as_ref().map_err(|e| e.clone())
    }

    /// Registers the runtime's global-lock sink. Calling this is what makes
    /// `instrument(CounterKind::GlobalLock)` possible.
    pub fn set_global_lock_sink<F>(&self, sink: F)
    where
        F: Fn(CounterAddress) + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        inner.global_lock_sink = Some(Box::new(sink));
    }

    /// Whether a sink for the kind is currently registered.
    pub fn supports(&self, kind: CounterKind) -> bool {
        let inner = self.lock();
        match kind {
            CounterKind::GlobalLock => inner.global_lock_sink.is_some(),
        }
    }

    /// Wires a well-known counter to a permanent tracker and hands its
    /// address to the runtime's sink.
    ///
    /// Idempotent: a second call for the same kind succeeds without creating
    /// a second tracker. On error nothing is registered; there is no partial
    /// state to clean up.
    pub fn instrument(&self, kind: CounterKind) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        if inner.instrumented.contains_key(&kind) {
            return Ok(());
        }
        let Some(sink) = inner.global_lock_sink.as_ref() else {
            return Err(RegistryError::UnsupportedRuntime { kind });
        };
        let tracker = self.page.allocate(kind.label(), PROCESS_WIDE_OWNER)?;
        let permanent = tracker.into_permanent();
        sink(permanent.export_address());
        inner.instrumented.insert(kind, permanent);
        Ok(())
    }

    /// Whether `instrument(kind)` has completed for this kind.
    pub fn instrumented(&self, kind: CounterKind) -> bool {
        self.lock().instrumented.contains_key(&kind)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Setup-path lock; a poisoned guard still holds consistent data.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
