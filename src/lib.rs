pub mod attach;
pub mod commands;
pub mod completions;
pub mod hooks;
pub mod page;
pub mod process;
pub mod registry;
pub mod supervise;
pub mod tracker;
pub mod watcher;
