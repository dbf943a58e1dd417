//! Node path namespace for one coordinator instance.
//!
//! Every node this coordinator touches lives under
//! `/<region>-<cluster>/<service-type>`. The namespace is a pure translator from
//! relative paths to absolute node paths; absolute paths pass through untouched.

use crate::error::{CoordinationError, CoordinationResult};

/// Child of the prefix holding the lock recipe nodes.
pub const LOCK_NODE: &str = "lock";

/// Child of a party base path holding the membership nodes.
pub const PARTY_NODE: &str = "party";

/// Path namespace derived from (region, cluster, service type).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    region: String,
    cluster: String,
    service_type: String,
    prefix: String,
}

impl Namespace {
    /// Build the namespace, rejecting empty components or ones containing `/`.
    pub fn new(region: &str, cluster: &str, service_type: &str) -> CoordinationResult<Self> {
        for (field, value) in [
            ("region", region),
            ("cluster", cluster),
            ("service_type", service_type),
        ] {
            if value.trim().is_empty() {
                return Err(CoordinationError::Config(format!("{field} is empty")));
            }
            if value.contains('/') {
                return Err(CoordinationError::Config(format!(
                    "{field} contains a path separator: {value}"
                )));
            }
        }
        Ok(Self {
            region: region.to_owned(),
            cluster: cluster.to_owned(),
            service_type: service_type.to_owned(),
            prefix: format!("/{region}-{cluster}/{service_type}"),
        })
    }

    /// The absolute prefix every relative path resolves under.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    /// Resolve `path` under the prefix. Absolute paths are returned as-is.
    pub fn resolve(&self, path: &str) -> String {
        join_path(&self.prefix, path)
    }

    /// Absolute path of an entry `name` in the relative cache path `path`.
    pub fn entry(&self, path: &str, name: &str) -> String {
        join_path(&self.resolve(path), name)
    }

    /// Absolute path of the lock recipe.
    pub fn lock_path(&self) -> String {
        self.resolve(LOCK_NODE)
    }

    /// Absolute path of a party placed under `base`, or under the prefix
    /// when no base is given.
    pub fn party_path(&self, base: Option<&str>) -> String {
        join_path(base.unwrap_or(&self.prefix), PARTY_NODE)
    }
}

/// Join two node paths. An absolute `child` replaces `base` entirely.
pub fn join_path(base: &str, child: &str) -> String {
    if child.starts_with('/') {
        return child.to_owned();
    }
    let child = child.trim_end_matches('/');
    if child.is_empty() {
        return base.to_owned();
    }
    format!("{}/{child}", base.trim_end_matches('/'))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
