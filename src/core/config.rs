//! Configuration parsing and validation.
//!
//! Trellis configuration is loaded from TOML files with CLI overrides.
//! Sections mirror the runtime components: the backing store, the watch
//! loops, the registered resource kinds, and telemetry.

use crate::resource::ResourceKind;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level Trellis configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Authoritative store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Watch loop reconnect behaviour.
    #[serde(default)]
    pub watch: WatchConfig,

    /// Resource kinds to register with the hub.
    #[serde(default)]
    pub resources: ResourcesConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Authoritative store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend: "etcd" or "memory".
    #[serde(default = "default_backend")]
    pub backend: String,

    /// etcd endpoints, e.g. "http://127.0.0.1:2379".
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,

    /// Root key prefix under which every resource type lives.
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Connection establishment timeout in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Deadline for every unary store request in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Node id embedded in generated resource ids (0-1023).
    #[serde(default = "default_node_id")]
    pub node_id: u16,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            endpoints: default_endpoints(),
            prefix: default_prefix(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            node_id: default_node_id(),
        }
    }
}

impl StoreConfig {
    /// Connection timeout as a Duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Request timeout as a Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Watch loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Deadline for each relist or resubscribe attempt in milliseconds.
    #[serde(default = "default_retry_timeout_ms")]
    pub retry_timeout_ms: u64,

    /// First backoff delay after a failure in milliseconds.
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    /// Backoff ceiling in milliseconds.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Consecutive resume failures tolerated before forcing a full relist.
    #[serde(default = "default_max_resume_failures")]
    pub max_resume_failures: u32,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            retry_timeout_ms: default_retry_timeout_ms(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            max_resume_failures: default_max_resume_failures(),
        }
    }
}

impl WatchConfig {
    /// Per-attempt deadline as a Duration.
    pub fn retry_timeout(&self) -> Duration {
        Duration::from_millis(self.retry_timeout_ms)
    }

    /// Initial backoff as a Duration.
    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    /// Backoff ceiling as a Duration.
    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

/// Registered resource kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcesConfig {
    /// Resource type segments, e.g. "routes". Defaults to every kind.
    #[serde(default = "default_kinds")]
    pub kinds: Vec<String>,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            kinds: default_kinds(),
        }
    }
}

impl ResourcesConfig {
    /// Parse the configured names into kinds.
    pub fn parse_kinds(&self) -> Result<Vec<ResourceKind>> {
        let mut kinds = Vec::with_capacity(self.kinds.len());
        for name in &self.kinds {
            let kind = ResourceKind::from_name(name)
                .with_context(|| format!("resources.kinds contains unknown kind: {}", name))?;
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        Ok(kinds)
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

// Default value functions

fn default_backend() -> String {
    "etcd".to_string()
}

fn default_endpoints() -> Vec<String> {
    vec!["http://127.0.0.1:2379".to_string()]
}

fn default_prefix() -> String {
    "/apisix".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_node_id() -> u16 {
    1
}

fn default_retry_timeout_ms() -> u64 {
    5_000
}

fn default_backoff_initial_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    10_000
}

fn default_max_resume_failures() -> u32 {
    3
}

fn default_kinds() -> Vec<String> {
    ResourceKind::ALL
        .iter()
        .map(|kind| kind.name().to_string())
        .collect()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).with_context(|| "failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration backed by the in-process store, for tests and demos.
    pub fn in_memory() -> Self {
        let mut config = Self::default();
        config.store.backend = "memory".to_string();
        config.store.endpoints.clear();
        config
    }

    /// Apply CLI overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref log_level) = overrides.log_level {
            self.telemetry.log_level = log_level.clone();
        }
        if let Some(ref prefix) = overrides.prefix {
            self.store.prefix = prefix.clone();
        }
        if !overrides.endpoints.is_empty() {
            self.store.endpoints = overrides.endpoints.clone();
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.validate_store()?;
        self.validate_watch()?;
        self.resources.parse_kinds()?;
        self.validate_telemetry()?;
        Ok(())
    }

    fn validate_store(&self) -> Result<()> {
        if self.store.backend != "etcd" && self.store.backend != "memory" {
            anyhow::bail!(
                "store.backend must be 'etcd' or 'memory', got: {}",
                self.store.backend
            );
        }

        if self.store.backend == "etcd" && self.store.endpoints.is_empty() {
            anyhow::bail!("store.endpoints required for etcd backend");
        }

        if !self.store.prefix.starts_with('/') {
            anyhow::bail!(
                "store.prefix must start with '/', got: {}",
                self.store.prefix
            );
        }
        if self.store.prefix.len() > 1 && self.store.prefix.ends_with('/') {
            anyhow::bail!(
                "store.prefix must not end with '/', got: {}",
                self.store.prefix
            );
        }

        if self.store.request_timeout_ms == 0 {
            anyhow::bail!("store.request_timeout_ms must be > 0");
        }

        if self.store.node_id > 1023 {
            anyhow::bail!("store.node_id must be <= 1023, got: {}", self.store.node_id);
        }

        Ok(())
    }

    fn validate_watch(&self) -> Result<()> {
        if self.watch.retry_timeout_ms == 0 {
            anyhow::bail!("watch.retry_timeout_ms must be > 0");
        }

        if self.watch.backoff_initial_ms > self.watch.backoff_max_ms {
            anyhow::bail!(
                "watch.backoff_initial_ms ({}) cannot exceed watch.backoff_max_ms ({})",
                self.watch.backoff_initial_ms,
                self.watch.backoff_max_ms
            );
        }

        if self.watch.max_resume_failures == 0 {
            anyhow::bail!("watch.max_resume_failures must be > 0");
        }

        Ok(())
    }

    fn validate_telemetry(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.telemetry.log_level.as_str()) {
            anyhow::bail!(
                "telemetry.log_level must be one of {:?}, got: {}",
                valid_levels,
                self.telemetry.log_level
            );
        }
        Ok(())
    }
}

/// CLI override options that can be applied to configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override log level.
    pub log_level: Option<String>,
    /// Override key prefix.
    pub prefix: Option<String>,
    /// Override etcd endpoints.
    pub endpoints: Vec<String>,
}
