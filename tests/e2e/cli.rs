//! CLI surface checks against the real binary

use std::process::Command;

use super::helpers::vigil_bin;

/// Test: completions generation writes a bash script to stdout
#[test]
fn test_completions_bash_emits_script() {
    let output = Command::new(vigil_bin())
        .args(["completions", "bash"])
        .output()
        .expect("run completions");

    assert!(output.status.success());
    let script = String::from_utf8_lossy(&output.stdout);
    assert!(script.contains("vigil"), "script should mention the binary");
}

/// Test: unknown shells are refused with the supported list
#[test]
fn test_completions_rejects_unknown_shell() {
    let output = Command::new(vigil_bin())
        .args(["completions", "powershell"])
        .output()
        .expect("run completions");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Unsupported shell"));
}

/// Test: watch without a pid is a usage error
#[test]
fn test_watch_requires_pid() {
    let output = Command::new(vigil_bin())
        .args(["watch"])
        .output()
        .expect("run watch");
    assert!(!output.status.success());
}

/// Test: negative intervals are rejected by argument validation
#[test]
fn test_negative_interval_is_rejected() {
    let output = Command::new(vigil_bin())
        .args(["watch", "1", "--poll-interval=-1"])
        .output()
        .expect("run watch");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("non-negative"));
}

/// Test: the version flag works
#[test]
fn test_version_flag() {
    let output = Command::new(vigil_bin())
        .args(["--version"])
        .output()
        .expect("run version");

    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("vigil"));
}
