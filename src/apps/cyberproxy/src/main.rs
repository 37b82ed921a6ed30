use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install the ring crypto provider"))?;

    let cli = cyberproxy::cli::Cli::parse();
    cli.run().await
}
