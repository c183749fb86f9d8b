//! Pre-write validation.
//!
//! Validation is pure: it reads the candidate resource and, for foreign-key
//! checks, the live key sets of other kinds through a [`KeyLookup`]. Nothing
//! is written, so callers may run it speculatively.

use super::{value_as_key, Resource, ResourceKind};
use crate::core::error::{TrellisError, TrellisResult};

/// Longest accepted resource key.
pub const MAX_KEY_LEN: usize = 64;

/// A payload field that must name a live resource of another kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reference {
    pub field: &'static str,
    pub target: ResourceKind,
}

const ROUTE_REFERENCES: &[Reference] = &[
    Reference {
        field: "service_id",
        target: ResourceKind::Service,
    },
    Reference {
        field: "upstream_id",
        target: ResourceKind::Upstream,
    },
    Reference {
        field: "plugin_config_id",
        target: ResourceKind::PluginConfig,
    },
    Reference {
        field: "script_id",
        target: ResourceKind::Script,
    },
];

const SERVICE_REFERENCES: &[Reference] = &[Reference {
    field: "upstream_id",
    target: ResourceKind::Upstream,
}];

const STREAM_ROUTE_REFERENCES: &[Reference] = &[
    Reference {
        field: "service_id",
        target: ResourceKind::Service,
    },
    Reference {
        field: "upstream_id",
        target: ResourceKind::Upstream,
    },
];

/// Read access to the live keys of every registered kind.
pub trait KeyLookup: Send + Sync {
    /// Whether `key` currently exists for `kind`.
    ///
    /// Kinds that are not registered report `false`.
    fn contains_key(&self, kind: ResourceKind, key: &str) -> bool;

    /// Whether `kind` is registered at all.
    fn is_registered(&self, kind: ResourceKind) -> bool;
}

/// Validation rules for one resource kind.
#[derive(Debug, Clone, Copy)]
pub struct Validator {
    kind: ResourceKind,
}

impl Validator {
    /// Rules for the given kind.
    pub fn for_kind(kind: ResourceKind) -> Self {
        Self { kind }
    }

    /// Foreign keys checked for this kind.
    pub fn references(&self) -> &'static [Reference] {
        match self.kind {
            ResourceKind::Route => ROUTE_REFERENCES,
            ResourceKind::Service => SERVICE_REFERENCES,
            ResourceKind::StreamRoute => STREAM_ROUTE_REFERENCES,
            _ => &[],
        }
    }

    /// Run every check against `resource`.
    pub fn validate(&self, resource: &Resource, lookup: &dyn KeyLookup) -> TrellisResult<()> {
        let key = resource.key_for(self.kind).ok_or_else(|| {
            TrellisError::validation(format!("{} is required", self.kind.key_field()))
        })?;
        validate_key(&key)?;
        if !resource.id.is_empty() && self.kind.key_field() != "id" {
            validate_key(&resource.id)?;
        }
        self.check_required_fields(resource)?;
        self.check_references(resource, lookup)
    }

    fn check_required_fields(&self, resource: &Resource) -> TrellisResult<()> {
        match self.kind {
            ResourceKind::Route => {
                if resource.field("uri").is_none() && resource.field("uris").is_none() {
                    return Err(TrellisError::validation("route requires uri or uris"));
                }
            }
            ResourceKind::Upstream => {
                if resource.field("nodes").is_none() && resource.field("service_name").is_none() {
                    return Err(TrellisError::validation(
                        "upstream requires nodes or service_name",
                    ));
                }
            }
            ResourceKind::Ssl => {
                require_non_empty_str(resource, "cert")?;
                require_non_empty_str(resource, "key")?;
            }
            ResourceKind::Script => {
                if resource.field("script").is_none() {
                    return Err(TrellisError::validation("script requires script"));
                }
            }
            ResourceKind::GlobalRule | ResourceKind::PluginConfig => {
                if !resource.field("plugins").is_some_and(|p| p.is_object()) {
                    return Err(TrellisError::validation(format!(
                        "{} requires a plugins object",
                        self.kind
                    )));
                }
            }
            ResourceKind::Proto => require_non_empty_str(resource, "content")?,
            ResourceKind::Service
            | ResourceKind::Consumer
            | ResourceKind::StreamRoute
            | ResourceKind::ServerInfo => {}
        }
        Ok(())
    }

    fn check_references(&self, resource: &Resource, lookup: &dyn KeyLookup) -> TrellisResult<()> {
        for reference in self.references() {
            let Some(value) = resource.field(reference.field) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            let target = value_as_key(value).ok_or_else(|| {
                TrellisError::validation(format!(
                    "{} must be a string or number",
                    reference.field
                ))
            })?;
            if target.is_empty() {
                continue;
            }
            if !lookup.is_registered(reference.target) {
                continue;
            }
            if !lookup.contains_key(reference.target, &target) {
                return Err(TrellisError::validation(format!(
                    "{}: {} not found",
                    reference.field, target
                )));
            }
        }
        Ok(())
    }
}

/// Check a resource key's length and alphabet.
pub fn validate_key(key: &str) -> TrellisResult<()> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(TrellisError::validation(format!(
            "key must be 1-{} characters, got {}",
            MAX_KEY_LEN,
            key.len()
        )));
    }
    let valid = key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        return Err(TrellisError::validation(format!(
            "key {} may only contain [a-zA-Z0-9-_.]",
            key
        )));
    }
    Ok(())
}

fn require_non_empty_str(resource: &Resource, field: &str) -> TrellisResult<()> {
    match resource.field_str(field) {
        Some(value) if !value.is_empty() => Ok(()),
        _ => Err(TrellisError::validation(format!("{} is required", field))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    struct Keys(HashSet<(ResourceKind, String)>);

    impl KeyLookup for Keys {
        fn contains_key(&self, kind: ResourceKind, key: &str) -> bool {
            self.0.contains(&(kind, key.to_string()))
        }

        fn is_registered(&self, _kind: ResourceKind) -> bool {
            true
        }
    }

    fn route(doc: serde_json::Value) -> Resource {
        Resource::from_value(doc).unwrap()
    }

    #[test]
    fn key_alphabet_is_enforced() {
        assert!(validate_key("abc-1_2.3").is_ok());
        assert!(validate_key("a/b").is_err());
        assert!(validate_key("").is_err());
        assert!(validate_key(&"x".repeat(65)).is_err());
    }

    #[test]
    fn route_requires_uri() {
        let keys = Keys(HashSet::new());
        let err = Validator::for_kind(ResourceKind::Route)
            .validate(&route(json!({"id": "r1"})), &keys)
            .unwrap_err();
        assert!(matches!(err, TrellisError::Validation { .. }));
    }

    #[test]
    fn dangling_upstream_reference_is_rejected() {
        let mut set = HashSet::new();
        set.insert((ResourceKind::Upstream, "u1".to_string()));
        let keys = Keys(set);
        let validator = Validator::for_kind(ResourceKind::Route);

        assert!(validator
            .validate(&route(json!({"id": "r1", "uri": "/", "upstream_id": "u1"})), &keys)
            .is_ok());
        let err = validator
            .validate(&route(json!({"id": "r1", "uri": "/", "upstream_id": "u2"})), &keys)
            .unwrap_err();
        assert_eq!(err, TrellisError::validation("upstream_id: u2 not found"));
    }
}
