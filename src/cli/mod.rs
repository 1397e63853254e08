//! Command-line interface for ingest-pipeline.
//!
//! Provides the `consume` and `supply` commands.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands, ConsumeArgs, SupplyArgs};
