use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use std::str::FromStr;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use vigil::commands::{exercise, watch};
use vigil::completions::{generate_completions, Shell};
use vigil::watcher::WatcherConfig;

/// Validates interval arguments: a finite, non-negative number of seconds.
fn clap_seconds_validator(value: &str) -> Result<f64, String> {
    let seconds: f64 = value
        .parse()
        .map_err(|_| format!("'{value}' is not a number of seconds"))?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err("must be a non-negative number of seconds".to_string());
    }
    Ok(seconds)
}

#[derive(Parser)]
#[command(name = "vigil")]
#[command(about = "Out-of-process stall watcher for instrumented programs", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch an instrumented process and report stalls on stderr
    Watch {
        /// Process ID to watch
        pid: i32,

        /// How often to sample the target's counters
        #[arg(short = 'p', long, value_name = "SECONDS", default_value_t = 0.5,
              value_parser = clap_seconds_validator)]
        poll_interval: f64,

        /// How long a counter may sit active before it counts as stalled
        #[arg(short = 'a', long, value_name = "SECONDS", default_value_t = 2.0,
              value_parser = clap_seconds_validator)]
        alert_interval: f64,

        /// Quiet period before the same stall is reported again
        #[arg(long, value_name = "SECONDS", default_value_t = 30.0,
              value_parser = clap_seconds_validator)]
        traceback_suppress: f64,

        /// Attach and capture registers when reporting a stall (default)
        #[arg(long, overrides_with = "no_print_locals")]
        print_locals: bool,

        /// Report stalls from timing data alone, without attaching
        #[arg(long)]
        no_print_locals: bool,

        /// Emit one JSON object per event instead of human-readable text
        #[arg(long, overrides_with = "no_json_mode")]
        json_mode: bool,

        /// Emit human-readable text (default)
        #[arg(long)]
        no_json_mode: bool,
    },

    /// Internal: instrument this process with a canned scenario (used by tests)
    #[command(hide = true)]
    Exercise {
        /// Scenario to run (stall, idle, churn)
        scenario: String,

        /// How long to hold the scenario before exiting
        #[arg(long, value_name = "SECONDS", default_value_t = 30.0,
              value_parser = clap_seconds_validator)]
        hold: f64,
    },

    /// Generate shell completion script
    Completions {
        /// Shell to generate completions for (bash, zsh, fish)
        shell: String,
    },
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Watch {
            pid,
            poll_interval,
            alert_interval,
            traceback_suppress,
            print_locals,
            no_print_locals,
            json_mode,
            no_json_mode,
        } => {
            let config = WatcherConfig {
                poll_interval: Duration::from_secs_f64(poll_interval),
                alert_interval: Duration::from_secs_f64(alert_interval),
                suppress_window: Duration::from_secs_f64(traceback_suppress),
                print_locals: print_locals || !no_print_locals,
                json_mode: json_mode && !no_json_mode,
            };
            watch::execute(pid, config)
        }
        Commands::Exercise { scenario, hold } => {
            let scenario = exercise::Scenario::from_str(&scenario)?;
            exercise::execute(scenario, hold)
        }
        Commands::Completions { shell } => {
            let shell = Shell::from_str(&shell)?;
            let mut cmd = Cli::command();
            generate_completions(&mut cmd, shell);
            Ok(())
        }
    }
}
