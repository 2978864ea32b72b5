//! lakeflow command-line entry point.

mod cli;
mod commands;

use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    // Logs go to stderr so `cat` output stays clean.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Args::parse();
    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "starting lakeflow");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(commands::run(args))
}
