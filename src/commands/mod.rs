pub mod exercise;
pub mod watch;
