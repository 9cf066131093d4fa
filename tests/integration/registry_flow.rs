//! Registry wiring seen end to end
//!
//! A runtime registers a sink, instrumentation wires a permanent tracker to
//! it, and the resulting counter is readable through the same remote
//! interface a watcher uses.

use std::sync::{Arc, Mutex};

use vigil::page::ExportPage;
use vigil::registry::{CounterKind, CounterRegistry};
use vigil::tracker::{CounterAddress, PROCESS_WIDE_OWNER};
use vigil::watcher::RemoteTarget;

/// Test: the process-wide registry is one instance
#[test]
fn test_global_registry_is_one_instance() {
    let first = CounterRegistry::global().expect("global registry") as *const CounterRegistry;
    let second = CounterRegistry::global().expect("global registry") as *const CounterRegistry;
    assert_eq!(first, second);
}

/// Test: an instrumented counter is visible through the remote read path
#[test]
fn test_instrumented_counter_is_remotely_visible() {
    let page: &'static ExportPage = Box::leak(Box::new(ExportPage::new().expect("private page")));
    let registry = CounterRegistry::new(page);

    let delivered: Arc<Mutex<Option<CounterAddress>>> = Arc::new(Mutex::new(None));
    let store = delivered.clone();
    registry.set_global_lock_sink(move |address| {
        *store.lock().unwrap() = Some(address);
    });
    registry
        .instrument(CounterKind::GlobalLock)
        .expect("sink registered, instrument succeeds");
    let address = delivered.lock().unwrap().expect("sink ran");

    let mut target = RemoteTarget::open(std::process::id() as i32).expect("open self");
    target
        .locate_page_at(page.address())
        .expect("private page has a valid header");

    let snapshot = target.snapshot().expect("snapshot self");
    let live: Vec<_> = snapshot
        .iter()
        .filter(|(_, record)| record.is_live())
        .collect();
    assert_eq!(live.len(), 1, "one instrumented counter on a private page");

    let (slot_address, record) = live[0];
    assert_eq!(*slot_address, address.address);
    assert_eq!(record.generation, address.generation);
    assert_eq!(record.owner_id, PROCESS_WIDE_OWNER);
    assert!(record.is_active(), "counters start active");
    assert_eq!(target.read_label(record), "global lock");
}
