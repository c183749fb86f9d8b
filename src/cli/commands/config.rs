//! Config command implementation.

use crate::core::config::{Config, ConfigOverrides};
use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::path::Path;

/// Configuration operations.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Validate the configuration file.
    Validate,
    /// Print the effective configuration, defaults included.
    Show {
        /// Output format (toml, json).
        #[arg(long, default_value = "toml")]
        format: String,
    },
    /// Generate a configuration template.
    Generate {
        /// Store backend (etcd, memory).
        #[arg(long, default_value = "etcd")]
        backend: String,
    },
}

/// Load a config file, apply overrides, and validate the result.
pub(crate) fn load_config(path: &Path, overrides: &ConfigOverrides) -> Result<Config> {
    let mut config = Config::from_file(path)
        .with_context(|| format!("failed to load config from {:?}", path))?;
    config.apply_overrides(overrides);
    config.validate().context("invalid configuration after overrides")?;
    Ok(config)
}

/// Run the config command.
pub fn run_config(config_path: &Path, args: ConfigArgs) -> Result<()> {
    match args.command {
        ConfigCommand::Validate => validate_config(config_path),
        ConfigCommand::Show { format } => show_config(config_path, &format),
        ConfigCommand::Generate { backend } => {
            print!("{}", generate_template(&backend)?);
            Ok(())
        }
    }
}

fn validate_config(path: &Path) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("Config file not found: {:?}", path);
    }
    let config = Config::from_file(path)?;
    let kinds = config.resources.parse_kinds()?;
    println!("✓ Configuration is valid");
    println!("  backend: {}", config.store.backend);
    println!("  prefix:  {}", config.store.prefix);
    println!("  kinds:   {}", kinds.len());
    Ok(())
}

fn show_config(path: &Path, format: &str) -> Result<()> {
    let config = Config::from_file(path)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&config)?),
        "toml" => print!("{}", toml::to_string_pretty(&config)?),
        other => anyhow::bail!("unknown format: {} (expected toml or json)", other),
    }
    Ok(())
}

fn generate_template(backend: &str) -> Result<String> {
    let store = match backend {
        "etcd" => {
            r#"[store]
backend = "etcd"
endpoints = ["http://127.0.0.1:2379"]
prefix = "/apisix"
connect_timeout_ms = 5000
request_timeout_ms = 5000
node_id = 1
"#
        }
        "memory" => {
            r#"[store]
backend = "memory"
endpoints = []
prefix = "/apisix"
request_timeout_ms = 5000
node_id = 1
"#
        }
        other => anyhow::bail!("unknown backend: {} (expected etcd or memory)", other),
    };

    Ok(format!(
        r#"# Trellis configuration

{store}
[watch]
retry_timeout_ms = 5000
backoff_initial_ms = 100
backoff_max_ms = 10000
max_resume_failures = 3

[resources]
kinds = ["routes", "services", "upstreams", "consumers", "ssls", "scripts",
         "global_rules", "plugin_configs", "protos", "stream_routes", "server_info"]

[telemetry]
log_level = "info"
"#
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_templates_parse() {
        for backend in ["etcd", "memory"] {
            let template = generate_template(backend).unwrap();
            let config = Config::from_toml(&template).unwrap();
            assert_eq!(config.store.backend, backend);
            assert_eq!(config.resources.parse_kinds().unwrap().len(), 11);
        }
    }

    #[test]
    fn unknown_backend_is_rejected() {
        assert!(generate_template("redis").is_err());
    }
}
