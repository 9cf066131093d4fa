//! The full read path against our own process
//!
//! A live tracker in this process, observed through the same remote memory
//! interface the watcher binary uses, digested by a session, and rendered
//! into a report. Reading our own memory needs no ptrace grant, so these
//! tests run anywhere.

use serial_test::serial;
use std::time::Duration;

use vigil::page::{monotonic_now_ns, ExportPage};
use vigil::tracker::{current_thread_owner, StallTracker};
use vigil::watcher::{PageSearch, RemoteTarget, StallReport, WatcherConfig, WatcherSession};

use super::helpers::wait_for_condition;

fn open_self_on_global_page() -> RemoteTarget {
    let mut target = RemoteTarget::open(std::process::id() as i32).expect("open self");
    target
        .locate_page_at(ExportPage::global().expect("global page").address())
        .expect("global page header is valid");
    target
}

/// Test: an active tracker left alone long enough becomes a stall report
#[test]
#[serial]
fn test_active_tracker_flows_through_session_to_report() {
    let tracker =
        StallTracker::create("pipeline worker", current_thread_owner()).expect("allocate");
    let pid = std::process::id() as i32;
    let target = open_self_on_global_page();

    let snapshot = target.snapshot().expect("snapshot");
    let mut session = WatcherSession::new(
        pid,
        WatcherConfig {
            alert_interval: Duration::from_secs(2),
            ..WatcherConfig::default()
        },
    );

    // Pretend three seconds pass without a transition.
    let later = monotonic_now_ns() + 3_000_000_000;
    let observations = session.observe(&snapshot, later);
    let ours: Vec<_> = observations
        .iter()
        .filter(|o| o.slot_address == tracker.address())
        .collect();
    assert_eq!(ours.len(), 1, "exactly one stall for our tracker");

    let observation = ours[0];
    assert_eq!(observation.generation, tracker.generation());
    assert_eq!(observation.owner_id, tracker.owner_id());
    assert!(observation.stalled_for >= Duration::from_secs(3));
    assert_eq!(target.read_label(&observation.record), "pipeline worker");

    let report = StallReport {
        pid,
        label: target.read_label(&observation.record),
        owner_id: observation.owner_id,
        generation: observation.generation,
        slot_address: observation.slot_address as u64,
        stalled_ms: observation.stalled_for.as_millis() as u64,
        degraded: true,
        cmdline: target.read_cmdline(),
        relevant_threads: Vec::new(),
        other_threads: Vec::new(),
    };
    let value = serde_json::to_value(&report).expect("report serializes");
    assert_eq!(value["label"], "pipeline worker");
    assert_eq!(value["pid"], pid);
    assert!(value["stalled_ms"].as_u64().expect("ms field") >= 3000);

    tracker.close();
}

/// Test: an idle tracker never alerts no matter how long it sits
#[test]
#[serial]
fn test_idle_tracker_never_alerts() {
    let tracker = StallTracker::create("idle worker", current_thread_owner()).expect("allocate");
    tracker.go_idle();
    let target = open_self_on_global_page();

    let snapshot = target.snapshot().expect("snapshot");
    let mut session = WatcherSession::new(std::process::id() as i32, WatcherConfig::default());
    let much_later = monotonic_now_ns() + 60_000_000_000;
    let observations = session.observe(&snapshot, much_later);

    assert!(
        observations
            .iter()
            .all(|o| o.slot_address != tracker.address()),
        "idle counters are not stalls"
    );
    tracker.close();
}

/// Test: closing a tracker silences its slot remotely
#[test]
#[serial]
fn test_closed_tracker_goes_quiet_remotely() {
    let tracker = StallTracker::create("short lived", current_thread_owner()).expect("allocate");
    let address = tracker.address();
    let target = open_self_on_global_page();

    let before = target.snapshot().expect("snapshot");
    assert!(
        before
            .iter()
            .any(|(slot, record)| *slot == address && record.is_live()),
        "tracker visible while open"
    );

    tracker.close();

    let after = target.snapshot().expect("snapshot");
    let (_, record) = after
        .iter()
        .find(|(slot, _)| *slot == address)
        .expect("slot stays in the page");
    assert!(!record.is_live(), "closed slot reads free");

    let mut session = WatcherSession::new(std::process::id() as i32, WatcherConfig::default());
    let much_later = monotonic_now_ns() + 60_000_000_000;
    let observations = session.observe(&after, much_later);
    assert!(observations.iter().all(|o| o.slot_address != address));
}

/// Test: a tracker owned by another thread is visible with its owner id
#[test]
#[serial]
fn test_tracker_on_another_thread_is_visible() {
    let (address_tx, address_rx) = std::sync::mpsc::channel();
    let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();

    let worker = std::thread::spawn(move || {
        let tracker =
            StallTracker::create("worker thread", current_thread_owner()).expect("allocate");
        address_tx
            .send((tracker.address(), tracker.owner_id()))
            .expect("report address");
        done_rx.recv().expect("hold until checked");
        tracker.close();
    });

    let (address, owner) = address_rx.recv().expect("worker started");
    assert_ne!(owner, 0, "thread owners are real tids");

    let target = open_self_on_global_page();
    wait_for_condition(
        || {
            target
                .snapshot()
                .map(|snapshot| {
                    snapshot.iter().any(|(slot, record)| {
                        *slot == address && record.is_live() && record.owner_id == owner
                    })
                })
                .unwrap_or(false)
        },
        1000,
    )
    .expect("worker tracker visible remotely");

    done_tx.send(()).expect("release worker");
    worker.join().expect("worker exits");
}

/// Test: map scanning finds an export page without being told the address
#[test]
#[serial]
fn test_scan_discovers_an_export_page() {
    let _bait = StallTracker::create("discovery bait", current_thread_owner()).expect("allocate");

    let mut target = RemoteTarget::open(std::process::id() as i32).expect("open self");
    match target.locate_page().expect("scan succeeds") {
        PageSearch::Found => {
            assert!(target.has_page());
            assert!(
                !target.snapshot().expect("snapshot after scan").is_empty(),
                "a found page has slots"
            );
        }
        PageSearch::Absent {
            candidates,
            unreadable,
        } => panic!("export page not found ({candidates} candidates, {unreadable} unreadable)"),
    }
}
