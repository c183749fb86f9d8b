//! Trellis - unified CLI entrypoint.
//!
//! Usage:
//!   trellis start --config config/trellis.toml
//!   trellis verify --config config/trellis.toml [--format json]
//!   trellis config validate --config config/trellis.toml
//!   trellis config show --config config/trellis.toml

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use trellis::cli::commands::{run_config, run_start, run_verify};
use trellis::cli::{Cli, Commands};
use trellis::config::ConfigOverrides;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config/trellis.toml"));
    let overrides = ConfigOverrides {
        log_level: cli.log_level,
        ..Default::default()
    };

    match cli.command {
        Commands::Start(args) => run_start(&config_path, args, overrides).await,
        Commands::Verify(args) => run_verify(&config_path, args, overrides).await,
        Commands::Config(args) => run_config(&config_path, args),
    }
}
