//! rapid - Rapid package downloader CLI

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use rapid_cli::cmd;
use rapid_cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over -v
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match &cli.command {
        Commands::Download { specs, .. } => {
            let mut config = cli.sync_config()?;
            cli.command.apply(&mut config);
            cmd::download::download(config, specs).await
        }
        Commands::List { json } => cmd::list::list(cli.sync_config()?, *json).await,
        Commands::Validate { delete } => cmd::validate::validate(&cli.writepath()?, *delete),
        Commands::DumpSdp { file } => cmd::dump::dump_sdp(file),
        Commands::ValidateSdp { file } => cmd::dump::validate_sdp(&cli.writepath()?, file),
    }
}
