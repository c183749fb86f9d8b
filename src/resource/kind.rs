//! Resource kinds (hub keys) and their storage layout.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A configuration resource type managed by the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Route,
    Service,
    Upstream,
    Consumer,
    Ssl,
    Script,
    GlobalRule,
    PluginConfig,
    Proto,
    StreamRoute,
    ServerInfo,
}

impl ResourceKind {
    /// Every kind, in registration order.
    pub const ALL: [ResourceKind; 11] = [
        Self::Route,
        Self::Service,
        Self::Upstream,
        Self::Consumer,
        Self::Ssl,
        Self::Script,
        Self::GlobalRule,
        Self::PluginConfig,
        Self::Proto,
        Self::StreamRoute,
        Self::ServerInfo,
    ];

    /// Stable name used in configuration and verification reports.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Route => "routes",
            Self::Service => "services",
            Self::Upstream => "upstreams",
            Self::Consumer => "consumers",
            Self::Ssl => "ssls",
            Self::Script => "scripts",
            Self::GlobalRule => "global_rules",
            Self::PluginConfig => "plugin_configs",
            Self::Proto => "protos",
            Self::StreamRoute => "stream_routes",
            Self::ServerInfo => "server_info",
        }
    }

    /// Key segment below the root prefix.
    pub fn segment(&self) -> &'static str {
        match self {
            Self::ServerInfo => "data_plane/server_info",
            other => other.name(),
        }
    }

    /// Parse a kind from its configuration name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.name() == name)
    }

    /// Document field that holds the resource key.
    ///
    /// Consumers are addressed by username; everything else by id.
    pub fn key_field(&self) -> &'static str {
        match self {
            Self::Consumer => "username",
            _ => "id",
        }
    }

    /// Whether the manager may write this kind.
    ///
    /// Server infos are reported by data-plane nodes and only read here.
    pub fn is_writable(&self) -> bool {
        !matches!(self, Self::ServerInfo)
    }

    /// Whether a missing key may be generated on create.
    pub fn generates_keys(&self) -> bool {
        self.key_field() == "id"
    }

    /// Key range prefix for this kind, with a trailing separator.
    pub fn key_prefix(&self, root: &str) -> String {
        format!("{}/{}/", root.trim_end_matches('/'), self.segment())
    }

    /// Full storage key for a resource of this kind.
    pub fn storage_key(&self, root: &str, key: &str) -> String {
        format!("{}{}", self.key_prefix(root), key)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = crate::core::error::TrellisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| crate::core::error::TrellisError::UnknownResourceType {
            name: s.to_string(),
        })
    }
}
