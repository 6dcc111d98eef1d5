//! Command-line interface for pool-forge.
//!
//! Provides commands for validating a pool topology and running a batch of
//! tasks through it.

mod commands;

pub use commands::{parse_cli, run, run_with_cli};
