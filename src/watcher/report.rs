//! Alert output. Two renderings of the same information: a structured JSON
//! line per event for log collectors, or colored human-readable text.
//! Everything goes to stderr so a host process piping the watcher can keep
//! stdout for itself.

use chrono::{SecondsFormat, Utc};
use colored::Colorize;
use serde::Serialize;

use super::capture::ThreadDump;

/// Log severity, serialized the way structured-logging collectors expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Everything known about one qualifying stall at alert time.
#[derive(Debug, Clone, Serialize)]
pub struct StallReport {
    pub pid: i32,
    pub label: String,
    pub owner_id: u64,
    pub generation: u64,
    pub slot_address: u64,
    pub stalled_ms: u64,
    /// True when the watcher is running without ptrace capture and the
    /// thread lists are necessarily empty.
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmdline: Option<String>,
    pub relevant_threads: Vec<ThreadDump>,
    pub other_threads: Vec<ThreadDump>,
}

#[derive(Serialize)]
struct LogEntry<'a> {
    severity: Severity,
    timestamp: String,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    stall: Option<&'a StallReport>,
}

fn json_line(severity: Severity, message: &str, stall: Option<&StallReport>) -> String {
    let entry = LogEntry {
        severity,
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        message,
        stall,
    };
    serde_json::to_string(&entry)
        .unwrap_or_else(|e| format!("{{\"severity\":\"ERROR\",\"message\":\"report serialization failed: {e}\"}}"))
}

fn human_thread_line(dump: &ThreadDump) -> String {
    let mut line = format!("      [{}] {} ({})", dump.tid, dump.name, dump.run_state);
    if let Some(wchan) = &dump.wait_channel {
        line.push_str(&format!(" in {wchan}"));
    }
    if let Some(module) = &dump.module {
        line.push_str(&format!(" at {module}"));
    }
    if let Some(regs) = &dump.registers {
        line.push_str(&format!(
            "\n          ip={:#x} sp={:#x} bp={:#x}",
            regs.instruction_pointer, regs.stack_pointer, regs.frame_pointer
        ));
    }
    line
}

fn human_stall_text(report: &StallReport) -> String {
    let mut text = format!(
        "{} stall: '{}' active for {} ms (pid {}, owner {}, generation {})",
        "✗".red().bold(),
        report.label,
        report.stalled_ms,
        report.pid,
        if report.owner_id == 0 {
            "process-wide".to_owned()
        } else {
            format!("tid {}", report.owner_id)
        },
        report.generation,
    );
    if let Some(cmdline) = &report.cmdline {
        text.push_str(&format!("\n    command: {cmdline}"));
    }
    if report.degraded {
        text.push_str("\n    (timing only; thread capture unavailable)");
    }
    if !report.relevant_threads.is_empty() {
        text.push_str(&format!("\n    {}", "probably responsible:".bold()));
        for dump in &report.relevant_threads {
            text.push('\n');
            text.push_str(&human_thread_line(dump));
        }
    }
    if !report.other_threads.is_empty() {
        text.push_str("\n    other threads:");
        for dump in &report.other_threads {
            text.push('\n');
            text.push_str(&human_thread_line(dump));
        }
    }
    text
}

/// Sink for everything the watcher tells the outside world.
pub struct Reporter {
    json_mode: bool,
}

impl Reporter {
    pub fn new(json_mode: bool) -> Reporter {
        Reporter { json_mode }
    }

    /// Status events: attached, degraded, exiting and friends.
    pub fn event(&self, severity: Severity, message: &str) {
        if self.json_mode {
            eprintln!("{}", json_line(severity, message, None));
            return;
        }
        let symbol = match severity {
            Severity::Info => "→".cyan().to_string(),
            Severity::Warning => "!".yellow().bold().to_string(),
            Severity::Error => "✗".red().bold().to_string(),
        };
        eprintln!("{symbol} {message}");
    }

    /// A stall alert with full diagnostics.
    pub fn stall(&self, report: &StallReport) {
        if self.json_mode {
            eprintln!("{}", json_line(Severity::Error, "stall detected", Some(report)));
        } else {
            eprintln!("{}", human_stall_text(report));
        }
    }
}
