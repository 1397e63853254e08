//! ingest-pipeline entry point.
//!
//! Sets up logging, then hands off to `cli` for the `consume` or `supply`
//! command.

use std::process::ExitCode;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = ingest_pipeline::cli::parse_cli();

    // RUST_LOG wins over --log-level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    match ingest_pipeline::cli::run_with_cli(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = ?e, "ingest-pipeline stopped");
            ExitCode::FAILURE
        }
    }
}
