//! blobkv - unified CLI entrypoint.
//!
//! Usage:
//!   blobkv start [--listen ADDR] [--config config/blobkv.toml]
//!   blobkv config validate
//!   blobkv config show [--format toml|json]

use anyhow::Result;
use blobkv::cli::commands::{run_config, run_start};
use blobkv::cli::{Cli, Commands};
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let overrides = cli.overrides();
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Start(args) => run_start(args, config_path, overrides).await,
        Commands::Config(args) => run_config(args, config_path, overrides),
    }
}
