//! Command-line interface.
//!
//! Unified CLI for blobkv operations.

pub mod commands;

use crate::core::config::ConfigOverrides;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// blobkv - etcd v3 KV and Watch over S3-compatible blob storage.
#[derive(Parser, Debug)]
#[command(name = "blobkv")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path (default: config/blobkv.toml, if present).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Overrides carried by the global flags.
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            log_level: self.log_level.clone(),
            ..Default::default()
        }
    }
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the blobkv server.
    Start(commands::StartArgs),
    /// Configuration operations.
    Config(commands::ConfigArgs),
}
