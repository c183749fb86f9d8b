//! Verify command implementation.

use super::config::load_config;
use super::telemetry::init_tracing;
use crate::core::config::ConfigOverrides;
use crate::core::runtime::Runtime;
use crate::store::verify;
use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use std::path::Path;

/// Report output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Compare caches with the store.
#[derive(Args, Debug, Default)]
pub struct VerifyArgs {
    /// Output format.
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,

    /// Exit with an error when any key is inconsistent.
    #[arg(long)]
    pub strict: bool,
}

/// Start a hub, verify every kind once, print the report, and stop.
pub async fn run_verify(
    config_path: &Path,
    args: VerifyArgs,
    overrides: ConfigOverrides,
) -> Result<()> {
    let config = load_config(config_path, &overrides)?;
    init_tracing(&config.telemetry.log_level);

    let mut runtime = Runtime::new(config)?;
    runtime.start().await?;
    let hub = runtime
        .hub()
        .cloned()
        .context("store hub not started")?;

    let report = verify(&hub).await;
    runtime.stop().await?;
    let report = report.context("verification failed")?;

    match args.format {
        OutputFormat::Text => print!("{}", report.render_text()),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }

    if args.strict && !report.is_consistent() {
        anyhow::bail!("{} inconsistent keys", report.inconsistent_count);
    }
    Ok(())
}
