//! Command-line interface for modelforge.
//!
//! Provides commands for running the polling scheduler, submitting project
//! plans, triggering individual stages, and inspecting records.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
