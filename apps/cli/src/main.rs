//! updaterelay CLI: feed update streams through the distribution pipeline.
//!
//! Validates JSON-lines update files, caches accepted records, and fans them
//! out to webhook subscribers with retry, circuit breaking, and fallbacks.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
