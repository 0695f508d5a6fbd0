//! estack core types: cluster state snapshot, pod/resource identity, reconcile directives.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub mod cluster_state;
pub mod results;

pub use cluster_state::{ClusterState, Node, NodeId, ShardRouting, StateError};
pub use results::{Directive, Results};

pub mod prelude {
    pub use super::{
        ClusterState, Directive, NameResolver, NodeId, NodeResolver, ObservedState, PodRef, ResourceKey, Results,
    };
}

/// Identity of a managed resource: `(namespace, name)`.
///
/// Used both for expectations bookkeeping and for requeue addressing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// Parse `namespace/name`; a bare `name` lands in `default`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => Some(Self::new(ns, name)),
            Some(_) => None,
            None if !s.is_empty() => Some(Self::new("default", s)),
            None => None,
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A pod as seen by the orchestration client cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
    /// `metadata.uid` when known; deleters use it as a precondition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

impl PodRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into(), uid: None }
    }

    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    /// Same pod, ignoring uid when either side does not know it.
    pub fn same_pod(&self, other: &PodRef) -> bool {
        self.namespace == other.namespace
            && self.name == other.name
            && match (&self.uid, &other.uid) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
    }
}

impl fmt::Display for PodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Resolves a pod to the database node it runs.
///
/// The pairing is a naming contract between the database and the pod naming scheme;
/// implementations may be swapped for a stricter mapping.
pub trait NodeResolver: Send + Sync {
    fn resolve<'a>(&self, pod: &PodRef, state: &'a ClusterState) -> Option<&'a NodeId>;
}

/// Default resolver: the node whose advertised `name` equals the pod name.
#[derive(Debug, Clone, Copy, Default)]
pub struct NameResolver;

impl NodeResolver for NameResolver {
    fn resolve<'a>(&self, pod: &PodRef, state: &'a ClusterState) -> Option<&'a NodeId> {
        state.node_by_name(&pod.name).map(|(id, _)| id)
    }
}

/// Output of the cluster state observer for one resource.
///
/// `cluster_state` is `None` when no snapshot could be fetched; callers must treat
/// data placement as unknown.
#[derive(Debug, Clone, Default)]
pub struct ObservedState {
    pub cluster_state: Option<Arc<ClusterState>>,
}

impl ObservedState {
    pub fn new(state: ClusterState) -> Self {
        Self { cluster_state: Some(Arc::new(state)) }
    }

    pub fn unknown() -> Self {
        Self { cluster_state: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_key_parse() {
        assert_eq!(ResourceKey::parse("prod/es"), Some(ResourceKey::new("prod", "es")));
        assert_eq!(ResourceKey::parse("es"), Some(ResourceKey::new("default", "es")));
        assert_eq!(ResourceKey::parse(""), None);
        assert_eq!(ResourceKey::parse("/es"), None);
        assert_eq!(ResourceKey::parse("a/b/c"), None);
        assert_eq!(ResourceKey::new("ns", "x").to_string(), "ns/x");
    }

    #[test]
    fn same_pod_ignores_unknown_uid() {
        let a = PodRef::new("default", "p");
        let b = PodRef::new("default", "p").with_uid("u1");
        let c = PodRef::new("default", "p").with_uid("u2");
        assert!(a.same_pod(&b));
        assert!(b.same_pod(&a));
        assert!(!b.same_pod(&c));
        assert!(!a.same_pod(&PodRef::new("other", "p")));
    }

    #[test]
    fn name_resolver_matches_node_name() {
        let state: ClusterState = serde_json::from_value(serde_json::json!({
            "nodes": {
                "id-a": { "name": "es-a", "ephemeral_id": "e", "transport_address": "10.0.0.1:9300", "attributes": {} }
            }
        }))
        .expect("state");
        let r = NameResolver;
        assert_eq!(r.resolve(&PodRef::new("default", "es-a"), &state).map(|s| s.as_str()), Some("id-a"));
        assert!(r.resolve(&PodRef::new("default", "es-b"), &state).is_none());
    }
}
