mod cli;
mod client;
mod error;
mod logging;
mod model;
mod orchestrator;
mod poller;
mod text_summary;

use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    logging::init(args.verbose);
    cli::run(args).await
}
