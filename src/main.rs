mod bencode;
mod choke;
mod cli;
mod client;
mod error;
mod peer;
mod piece;
mod rate;
mod session;
mod storage;
mod torrent;
mod tracker;

use anyhow::Result;
use cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .init();

    cli.run().await?;

    Ok(())
}
