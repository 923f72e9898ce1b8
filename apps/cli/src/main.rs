//! docenrich CLI: batch enrichment of official-document records.
//!
//! Loads a JSON-lines batch, enriches the records that still need it through
//! a chat-completions service, and rewrites the batch atomically.

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
