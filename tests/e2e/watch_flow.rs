//! Watcher flows against a real instrumented target
//!
//! Each test spawns an `exercise` target, points a watcher at it with short
//! intervals, and asserts on the watcher's reports and exit status.

use serial_test::serial;
use std::process::{Command, Stdio};
use std::time::Duration;
use wait_timeout::ChildExt;

use super::helpers::*;

const FAST_INTERVALS: &[&str] = &[
    "--poll-interval",
    "0.1",
    "--alert-interval",
    "0.3",
    "--traceback-suppress",
    "60",
];

/// Test: a stalled target produces exactly one alert under suppression
#[test]
#[serial]
fn test_stall_scenario_produces_one_alert() {
    let mut target = spawn_exercise("stall").expect("target starts");

    let mut args = vec!["--json-mode"];
    args.extend_from_slice(FAST_INTERVALS);
    let outcome =
        run_watch_for(target.id(), &args, Duration::from_millis(1500)).expect("watch runs");
    kill_and_reap(&mut target);

    assert!(
        outcome.status.success(),
        "watcher should exit cleanly on SIGTERM, stderr:\n{}",
        outcome.stderr
    );
    let stalls = json_stalls(&outcome.stderr);
    assert_eq!(
        stalls.len(),
        1,
        "one alert then suppression, stderr:\n{}",
        outcome.stderr
    );
    let stall = &stalls[0];
    assert_eq!(stall["label"], "exercise stall");
    assert_eq!(stall["pid"].as_i64().expect("pid"), target.id() as i64);
    assert!(stall["stalled_ms"].as_u64().expect("stalled_ms") >= 300);
}

/// Test: an idle target is never reported
#[test]
#[serial]
fn test_idle_scenario_stays_quiet() {
    let mut target = spawn_exercise("idle").expect("target starts");

    let mut args = vec!["--json-mode"];
    args.extend_from_slice(FAST_INTERVALS);
    let outcome =
        run_watch_for(target.id(), &args, Duration::from_millis(1200)).expect("watch runs");
    kill_and_reap(&mut target);

    assert!(outcome.status.success());
    assert!(
        json_stalls(&outcome.stderr).is_empty(),
        "idle counters must not alert, stderr:\n{}",
        outcome.stderr
    );
}

/// Test: human-readable mode renders the stall with its label
#[test]
#[serial]
fn test_human_mode_renders_stall_text() {
    let mut target = spawn_exercise("stall").expect("target starts");

    let outcome = run_watch_for(target.id(), FAST_INTERVALS, Duration::from_millis(1500))
        .expect("watch runs");
    kill_and_reap(&mut target);

    assert!(outcome.status.success());
    assert!(
        outcome.stderr.contains("stall: 'exercise stall'"),
        "expected human stall line, stderr:\n{}",
        outcome.stderr
    );
    assert!(outcome.stderr.contains("active for"));
}

/// Test: a heavily reused slot alerts with a late odd generation
#[test]
#[serial]
fn test_churn_target_alert_carries_late_generation() {
    let mut target = spawn_exercise("churn").expect("target starts");

    let mut args = vec!["--json-mode"];
    args.extend_from_slice(FAST_INTERVALS);
    let outcome =
        run_watch_for(target.id(), &args, Duration::from_millis(1500)).expect("watch runs");
    kill_and_reap(&mut target);

    let stalls = json_stalls(&outcome.stderr);
    assert_eq!(stalls.len(), 1, "stderr:\n{}", outcome.stderr);
    let generation = stalls[0]["generation"].as_u64().expect("generation");
    assert_eq!(generation % 2, 1, "live generations are odd");
    assert!(
        generation > 1000,
        "a thousand reuse cycles must show in the generation, got {generation}"
    );
}

/// Test: the watcher exits zero by itself when the target dies
#[test]
#[serial]
fn test_watcher_exits_cleanly_when_target_dies() {
    let mut target = spawn_exercise("stall").expect("target starts");

    let mut watcher = Command::new(vigil_bin())
        .args([
            "watch",
            &target.id().to_string(),
            "--json-mode",
            "--poll-interval",
            "0.1",
            "--alert-interval",
            "60",
        ])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("watcher starts");

    std::thread::sleep(Duration::from_millis(400));
    kill_and_reap(&mut target);

    let status = watcher
        .wait_timeout(Duration::from_secs(5))
        .expect("wait for watcher")
        .unwrap_or_else(|| {
            let _ = watcher.kill();
            panic!("watcher did not notice the target dying");
        });
    assert!(status.success(), "target death is a clean exit");
}

/// Test: watching a pid that does not exist fails fast and nonzero
#[test]
fn test_watch_of_missing_pid_fails() {
    let output = Command::new(vigil_bin())
        .args(["watch", "2000000000"])
        .output()
        .expect("watch runs");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("2000000000"),
        "error should name the pid, stderr:\n{stderr}"
    );
}
