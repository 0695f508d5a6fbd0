//! Cluster state snapshot as returned by the database `_cluster/state` API (subset).
//!
//! A snapshot is replaced wholesale on every refresh and never mutated in place.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Opaque node identifier assigned by the database.
pub type NodeId = String;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("malformed cluster state: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("inconsistent routing table: {index}[{ordinal}] lists a copy of {copy_index}[{copy_shard}]")]
    InconsistentRouting { index: String, ordinal: u32, copy_index: String, copy_shard: u32 },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterState {
    #[serde(default)]
    pub cluster_name: String,
    #[serde(default)]
    pub cluster_uuid: String,
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub state_uuid: String,
    #[serde(default)]
    pub master_node: Option<NodeId>,
    #[serde(default)]
    pub nodes: BTreeMap<NodeId, Node>,
    #[serde(default)]
    pub routing_table: RoutingTable,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    #[serde(default)]
    pub ephemeral_id: String,
    #[serde(default)]
    pub transport_address: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingTable {
    #[serde(default)]
    pub indices: BTreeMap<String, IndexRouting>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexRouting {
    /// Shard ordinal -> copies (primary and replicas).
    #[serde(default)]
    pub shards: BTreeMap<u32, Vec<ShardRouting>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShardState {
    Unassigned,
    Initializing,
    Started,
    Relocating,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationId {
    pub id: String,
}

/// One physical copy of a shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardRouting {
    pub state: ShardState,
    pub primary: bool,
    /// Absent when the copy is unassigned.
    #[serde(default)]
    pub node: Option<NodeId>,
    /// Destination while the copy is being moved.
    #[serde(default)]
    pub relocating_node: Option<NodeId>,
    pub shard: u32,
    pub index: String,
    #[serde(default)]
    pub allocation_id: Option<AllocationId>,
}

impl ShardRouting {
    pub fn is_assigned(&self) -> bool {
        self.node.is_some()
    }

    /// True if the copy lives on, or is moving to, `node_id`.
    pub fn references(&self, node_id: &str) -> bool {
        self.node.as_deref() == Some(node_id) || self.relocating_node.as_deref() == Some(node_id)
    }
}

impl ClusterState {
    /// Parse and validate a `_cluster/state` response body.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, StateError> {
        let state: ClusterState = serde_json::from_slice(bytes)?;
        state.validate()?;
        Ok(state)
    }

    /// Structural checks serde cannot express: each copy must agree with the
    /// index name and ordinal it is filed under.
    pub fn validate(&self) -> Result<(), StateError> {
        for (index, routing) in &self.routing_table.indices {
            for (ordinal, copies) in &routing.shards {
                if let Some(bad) = copies.iter().find(|c| &c.index != index || c.shard != *ordinal) {
                    return Err(StateError::InconsistentRouting {
                        index: index.clone(),
                        ordinal: *ordinal,
                        copy_index: bad.index.clone(),
                        copy_shard: bad.shard,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.routing_table.indices.is_empty()
    }

    /// Node whose advertised name equals `name`.
    pub fn node_by_name(&self, name: &str) -> Option<(&NodeId, &Node)> {
        self.nodes.iter().find(|(_, n)| n.name == name)
    }

    /// Every shard copy across all indices and ordinals, in routing table order.
    pub fn shards(&self) -> impl Iterator<Item = &ShardRouting> {
        self.routing_table.indices.values().flat_map(|i| i.shards.values()).flatten()
    }

    /// Copies held by `node_id`, including copies relocating to it.
    pub fn shards_on_node<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a ShardRouting> + 'a {
        self.shards().filter(move |c| c.references(node_id))
    }

    pub fn holds_data(&self, node_id: &str) -> bool {
        self.shards_on_node(node_id).next().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> ClusterState {
        serde_json::from_value(serde_json::json!({
            "cluster_name": "es",
            "nodes": {
                "a": { "name": "es-a" },
                "b": { "name": "es-b" },
                "c": { "name": "es-c" }
            },
            "routing_table": { "indices": { "logs": { "shards": {
                "0": [
                    { "state": "RELOCATING", "primary": true, "node": "a", "relocating_node": "b", "shard": 0, "index": "logs" },
                    { "state": "UNASSIGNED", "primary": false, "node": null, "relocating_node": null, "shard": 0, "index": "logs" }
                ]
            } } } }
        }))
        .expect("valid state")
    }

    #[test]
    fn relocation_target_counts_as_holding_data() {
        let s = state();
        assert!(s.holds_data("a"));
        assert!(s.holds_data("b"));
        assert!(!s.holds_data("c"));
        assert_eq!(s.shards().count(), 2);
        assert_eq!(s.shards().filter(|c| !c.is_assigned()).count(), 1);
    }

    #[test]
    fn lookup_by_name() {
        let s = state();
        assert_eq!(s.node_by_name("es-b").map(|(id, _)| id.as_str()), Some("b"));
        assert!(s.node_by_name("b").is_none());
    }

    #[test]
    fn rejects_misfiled_copy() {
        let raw = serde_json::json!({
            "routing_table": { "indices": { "logs": { "shards": {
                "1": [ { "state": "STARTED", "primary": true, "node": "a", "shard": 0, "index": "logs" } ]
            } } } }
        });
        let err = ClusterState::from_slice(raw.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, StateError::InconsistentRouting { ordinal: 1, copy_shard: 0, .. }));
    }

    #[test]
    fn rejects_structurally_invalid_json() {
        let err = ClusterState::from_slice(br#"{"nodes": []}"#).unwrap_err();
        assert!(matches!(err, StateError::Malformed(_)));
        assert!(ClusterState::from_slice(b"not json").is_err());
    }

    #[test]
    fn empty_document_is_empty_state() {
        let s = ClusterState::from_slice(b"{}").expect("empty is valid");
        assert!(s.is_empty());
    }
}
