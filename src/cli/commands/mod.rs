//! CLI command implementations.

mod config;
mod start;
mod telemetry;
mod verify;

pub use config::{run_config, ConfigArgs, ConfigCommand};
pub use start::{run_start, StartArgs};
pub use telemetry::init_tracing;
pub use verify::{run_verify, OutputFormat, VerifyArgs};
