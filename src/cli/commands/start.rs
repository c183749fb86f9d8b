//! Start command implementation.

use super::config::load_config;
use super::telemetry::init_tracing;
use crate::core::config::ConfigOverrides;
use crate::core::runtime::Runtime;
use anyhow::Result;
use clap::Args;
use std::path::Path;

/// Start the store hub.
#[derive(Args, Debug, Default)]
pub struct StartArgs {
    /// Override the store key prefix.
    #[arg(long)]
    pub prefix: Option<String>,

    /// Override the etcd endpoints (repeatable).
    #[arg(long = "endpoint")]
    pub endpoints: Vec<String>,
}

/// Run the start command with the given config path.
pub async fn run_start(
    config_path: &Path,
    args: StartArgs,
    mut overrides: ConfigOverrides,
) -> Result<()> {
    overrides.prefix = args.prefix;
    overrides.endpoints = args.endpoints;
    let config = load_config(config_path, &overrides)?;
    init_tracing(&config.telemetry.log_level);

    let mut runtime = Runtime::new(config)?;
    runtime.run().await
}
