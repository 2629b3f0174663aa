//! Leadflow CLI: enrich, summarize and score B2B leads.
//!
//! Pulls company data from structured providers, fills gaps through the
//! enrichment chain, and stores scored lead records.

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
