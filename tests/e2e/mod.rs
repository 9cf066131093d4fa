//! End-to-end tests for the vigil binary
//!
//! These spawn the real binary twice: once as an instrumented target (the
//! hidden `exercise` subcommand) and once as a watcher, then assert on the
//! watcher's stderr and exit status.

pub mod cli;
pub mod helpers;
pub mod watch_flow;

pub use helpers::*;
