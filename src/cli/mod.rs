//! Command-line interface for deferq.
//!
//! Provides the scheduler loop plus commands for scheduling, inspecting and
//! controlling jobs.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
