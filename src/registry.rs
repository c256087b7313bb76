//! Node registry: the active peer set, per-node status and last-seen chain
//! position.
//!
//! Every node keeps its own registry view; the table is mutable and only
//! eventually consistent across the cluster.

use crate::clock::Clock;
use crate::store::Store;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Cluster-wide node identifier, e.g. `CBR_0` or `BANK_3`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        NodeId(value.to_string())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        NodeId(value)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Role of a node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeRole {
    /// The central authority; permanent leader under normal operation.
    Authority,
    /// A financial organisation; voting peer and potential temporary leader.
    FinancialOrg,
}

/// Liveness status of a node record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Active,
    Inactive,
    Syncing,
    Disconnected,
}

/// Registry row; at most one per node id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: NodeId,
    pub name: String,
    pub role: NodeRole,
    pub status: NodeStatus,
    pub address: String,
    pub last_seen: DateTime<Utc>,
    pub height: u64,
    pub last_block_hash: String,
    pub registered_at: DateTime<Utc>,
}

/// Directed connection between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerLink {
    pub connected_at: DateTime<Utc>,
    pub last_communication: DateTime<Utc>,
}

/// Aggregate registry counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub active: usize,
    pub inactive: usize,
    pub syncing: usize,
    pub disconnected: usize,
}

/// Registry operations over a node's store.
#[derive(Clone)]
pub struct NodeRegistry {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
}

impl NodeRegistry {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>) -> NodeRegistry {
        NodeRegistry { store, clock }
    }

    /// Insert or replace a node record; new nodes start `Active`.
    pub fn register_node(
        &self,
        node_id: NodeId,
        name: impl Into<String>,
        role: NodeRole,
        address: impl Into<String>,
    ) -> NodeRecord {
        let now = self.clock.now();
        let record = NodeRecord {
            node_id: node_id.clone(),
            name: name.into(),
            role,
            status: NodeStatus::Active,
            address: address.into(),
            last_seen: now,
            height: 0,
            last_block_hash: String::new(),
            registered_at: now,
        };
        self.store.write(|t| {
            t.nodes.insert(node_id, record.clone());
        });
        record
    }

    /// Update status and, optionally, the last-known chain position.
    pub fn update_status(
        &self,
        node_id: &NodeId,
        status: NodeStatus,
        height: Option<u64>,
        last_block_hash: Option<&str>,
    ) {
        let now = self.clock.now();
        self.store.write(|t| {
            if let Some(record) = t.nodes.get_mut(node_id) {
                record.status = status;
                record.last_seen = now;
                if let Some(height) = height {
                    record.height = height;
                }
                if let Some(hash) = last_block_hash {
                    record.last_block_hash = hash.to_string();
                }
            }
        });
    }

    /// Record a successfully observed chain position for a peer.
    pub fn sync_node_info(&self, node_id: &NodeId, height: u64, last_block_hash: &str) {
        self.update_status(node_id, NodeStatus::Active, Some(height), Some(last_block_hash));
    }

    pub fn get(&self, node_id: &NodeId) -> Option<NodeRecord> {
        self.store.read(|t| t.nodes.get(node_id).cloned())
    }

    pub fn all_nodes(&self) -> Vec<NodeRecord> {
        self.store.read(|t| t.nodes.values().cloned().collect())
    }

    pub fn active_nodes(&self) -> Vec<NodeRecord> {
        self.store.read(|t| {
            t.nodes
                .values()
                .filter(|n| n.status == NodeStatus::Active)
                .cloned()
                .collect()
        })
    }

    pub fn nodes_by_role(&self, role: NodeRole) -> Vec<NodeRecord> {
        self.store.read(|t| {
            t.nodes
                .values()
                .filter(|n| n.role == role)
                .cloned()
                .collect()
        })
    }

    pub fn register_connection(&self, from: &NodeId, to: &NodeId) {
        let now = self.clock.now();
        self.store.write(|t| {
            t.connections.insert(
                (from.clone(), to.clone()),
                PeerLink {
                    connected_at: now,
                    last_communication: now,
                },
            );
        });
    }

    pub fn update_connection(&self, from: &NodeId, to: &NodeId) {
        let now = self.clock.now();
        self.store.write(|t| {
            if let Some(link) = t.connections.get_mut(&(from.clone(), to.clone())) {
                link.last_communication = now;
            }
        });
    }

    /// Nodes this node has an outgoing connection to.
    pub fn connected_nodes(&self, node_id: &NodeId) -> Vec<NodeRecord> {
        self.store.read(|t| {
            t.connections
                .keys()
                .filter(|(from, _)| from == node_id)
                .filter_map(|(_, to)| t.nodes.get(to).cloned())
                .collect()
        })
    }

    pub fn statistics(&self) -> RegistryStats {
        self.store.read(|t| {
            let mut stats = RegistryStats {
                total: t.nodes.len(),
                ..RegistryStats::default()
            };
            for node in t.nodes.values() {
                match node.status {
                    NodeStatus::Active => stats.active += 1,
                    NodeStatus::Inactive => stats.inactive += 1,
                    NodeStatus::Syncing => stats.syncing += 1,
                    NodeStatus::Disconnected => stats.disconnected += 1,
                }
            }
            stats
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn registry() -> NodeRegistry {
        NodeRegistry::new(Arc::new(Store::new()), Arc::new(SystemClock::new()))
    }

    #[test]
    fn register_is_single_record_per_node() {
        let registry = registry();
        let id = NodeId::from("BANK_1");
        registry.register_node(id.clone(), "Alpha Bank", NodeRole::FinancialOrg, "local://1");
        registry.register_node(id.clone(), "Alpha Bank", NodeRole::FinancialOrg, "local://1b");
        assert_eq!(registry.all_nodes().len(), 1);
        assert_eq!(registry.get(&id).unwrap().address, "local://1b");
    }

    #[test]
    fn status_updates_track_chain_position() {
        let registry = registry();
        let id = NodeId::from("BANK_1");
        registry.register_node(id.clone(), "Alpha Bank", NodeRole::FinancialOrg, "");
        registry.sync_node_info(&id, 7, "abc");
        let record = registry.get(&id).unwrap();
        assert_eq!(record.height, 7);
        assert_eq!(record.last_block_hash, "abc");
        assert_eq!(record.status, NodeStatus::Active);

        registry.update_status(&id, NodeStatus::Disconnected, None, None);
        assert!(registry.active_nodes().is_empty());
        assert_eq!(registry.statistics().disconnected, 1);
    }

    #[test]
    fn connections_are_directed() {
        let registry = registry();
        let cbr = NodeId::from("CBR_0");
        let bank = NodeId::from("BANK_1");
        registry.register_node(cbr.clone(), "Central Bank", NodeRole::Authority, "");
        registry.register_node(bank.clone(), "Alpha Bank", NodeRole::FinancialOrg, "");
        registry.register_connection(&cbr, &bank);
        assert_eq!(registry.connected_nodes(&cbr).len(), 1);
        assert!(registry.connected_nodes(&bank).is_empty());
    }
}
