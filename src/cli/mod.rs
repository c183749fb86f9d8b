//! Command-line interface.
//!
//! Unified CLI for Trellis operations.

pub mod commands;

use clap::{Parser, Subcommand};

/// Trellis - cached configuration store for an API gateway manager.
#[derive(Parser, Debug)]
#[command(name = "trellis")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path.
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the store hub and keep caches in sync until interrupted.
    Start(commands::StartArgs),
    /// Compare every cache with the store and print a report.
    Verify(commands::VerifyArgs),
    /// Configuration operations.
    Config(commands::ConfigArgs),
}
