/**
 * Remote resource registry abstraction
 *
 * The synchronizer only ever needs two things from the outside world: a full
 * listing of a collection and a stream of changes from a point in that
 * collection's history. Everything else about the remote side stays behind
 * `ResourceRegistry`.
 */
use super::cache::errors::invalid_kind_error;
use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::serde_json::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

mod cluster;
mod memory;

pub use cluster::KubeRegistry;
pub use memory::MemoryRegistry;

/// Group, version and plural name of a tracked collection
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKind {
    /// API group, empty for the core group
    pub group: String,
    pub version: String,
    pub plural: String,
}

impl ResourceKind {
    #[must_use]
    pub fn new(group: impl Into<String>, version: impl Into<String>, plural: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            plural: plural.into(),
        }
    }

    /// `v1` for the core group, `apps/v1` otherwise
    #[must_use]
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Reject kinds that cannot address a collection
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the version or plural name is blank
    /// or any part contains a path separator
    pub fn validate(&self) -> Result<()> {
        if self.version.trim().is_empty() {
            return Err(invalid_kind_error(self, "version is empty"));
        }
        if self.plural.trim().is_empty() {
            return Err(invalid_kind_error(self, "plural name is empty"));
        }
        if [&self.group, &self.version, &self.plural]
            .iter()
            .any(|part| part.contains('/'))
        {
            return Err(invalid_kind_error(self, "parts must not contain '/'"));
        }
        Ok(())
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.plural, self.version)
        } else {
            write!(f, "{}.{}/{}", self.plural, self.group, self.version)
        }
    }
}

/// Identity of one remote object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    /// `None` for cluster-scoped objects
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceKey {
    #[must_use]
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    #[must_use]
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Whether this key falls inside an optional namespace filter
    #[must_use]
    pub fn in_namespace(&self, filter: Option<&str>) -> bool {
        filter.is_none_or(|ns| self.namespace.as_deref() == Some(ns))
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Last known state of one remote object
///
/// The payload is carried around untouched; only the key and the resource
/// version matter to the synchronizer.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceRecord {
    pub key: ResourceKey,
    pub resource_version: Option<String>,
    pub payload: Value,
}

impl ResourceRecord {
    #[must_use]
    pub const fn new(key: ResourceKey, resource_version: Option<String>, payload: Value) -> Self {
        Self {
            key,
            resource_version,
            payload,
        }
    }

    /// Both records describe the same remote state
    ///
    /// Resource versions decide when both sides have one, the payload otherwise.
    #[must_use]
    pub fn same_state(&self, other: &Self) -> bool {
        match (&self.resource_version, &other.resource_version) {
            (Some(a), Some(b)) => a == b,
            _ => self.payload == other.payload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

/// One incremental change reported by a watch
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent {
    pub change: ChangeKind,
    pub record: ResourceRecord,
}

impl WatchEvent {
    #[must_use]
    pub const fn new(change: ChangeKind, record: ResourceRecord) -> Self {
        Self { change, record }
    }
}

/// Result of a full listing
#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub records: Vec<ResourceRecord>,
    /// Collection version the listing was taken at, used to resume a watch
    pub resume_token: Option<String>,
}

/// Lazy, non-restartable sequence of changes
pub type WatchStream = BoxStream<'static, Result<WatchEvent>>;

/// The remote side of a synchronizer
#[async_trait]
pub trait ResourceRegistry: Send + Sync {
    /// Check that the handle can be used at all
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an unusable handle
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Enumerate every object of `kind` matching the namespace filter
    async fn list(&self, kind: &ResourceKind, namespace: Option<&str>) -> Result<Listing>;

    /// Subscribe to changes after `resume_token`
    ///
    /// Without a token the stream starts at "now" (implementation defined).
    async fn watch(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        resume_token: Option<&str>,
    ) -> Result<WatchStream>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use k8s_openapi::serde_json::json;

    #[test]
    fn test_kind_display_and_api_version() {
        let pods = ResourceKind::new("", "v1", "pods");
        assert_eq!(pods.api_version(), "v1");
        assert_eq!(pods.to_string(), "pods/v1");

        let deployments = ResourceKind::new("apps", "v1", "deployments");
        assert_eq!(deployments.api_version(), "apps/v1");
        assert_eq!(deployments.to_string(), "deployments.apps/v1");
    }

    #[test]
    fn test_kind_validation() {
        assert!(ResourceKind::new("", "v1", "pods").validate().is_ok());
        assert!(matches!(
            ResourceKind::new("", "", "pods").validate(),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            ResourceKind::new("apps", "v1", " ").validate(),
            Err(Error::Configuration(_))
        ));
        assert!(ResourceKind::new("apps/v1", "v1", "deployments").validate().is_err());
    }

    #[test]
    fn test_namespace_filter() {
        let key = ResourceKey::namespaced("default", "web");
        assert!(key.in_namespace(None));
        assert!(key.in_namespace(Some("default")));
        assert!(!key.in_namespace(Some("kube-system")));
        assert!(!ResourceKey::cluster("node-1").in_namespace(Some("default")));
        assert_eq!(key.to_string(), "default/web");
    }

    #[test]
    fn test_same_state_prefers_resource_version() {
        let key = ResourceKey::namespaced("default", "web");
        let a = ResourceRecord::new(key.clone(), Some("7".into()), json!({"replicas": 1}));
        let b = ResourceRecord::new(key.clone(), Some("7".into()), json!({"replicas": 2}));
        let c = ResourceRecord::new(key.clone(), Some("8".into()), json!({"replicas": 1}));
        assert!(a.same_state(&b));
        assert!(!a.same_state(&c));

        let unversioned = ResourceRecord::new(key, None, json!({"replicas": 1}));
        assert!(unversioned.same_state(&c));
    }
}
