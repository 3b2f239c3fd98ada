//! Cluster topology: the ordered node set, peer derivation, the queue hash
//! ring, and PBFT primary/quorum arithmetic.

use crate::NodeId;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use thiserror::Error;

/// Errors building a topology from configuration.
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("node list is empty")]
    EmptyNodeList,

    #[error("local node '{0}' is not in the node list")]
    LocalNotInList(NodeId),

    #[error("duplicate node id '{0}' in node list")]
    DuplicateNode(NodeId),

    #[error("malformed node spec '{0}', expected 'id=http://host:port'")]
    MalformedSpec(String),
}

/// One member of the cluster: its id and the address peers reach it at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    pub addr: String,
}

impl NodeSpec {
    /// Parse an `id=http://host:port` spec string.
    pub fn parse(spec: &str) -> Result<Self, TopologyError> {
        let (id, addr) = spec
            .split_once('=')
            .ok_or_else(|| TopologyError::MalformedSpec(spec.to_string()))?;
        if id.is_empty() || addr.is_empty() {
            return Err(TopologyError::MalformedSpec(spec.to_string()));
        }
        Ok(Self {
            id: NodeId::new(id.trim()),
            addr: addr.trim().trim_end_matches('/').to_string(),
        })
    }
}

/// The cluster topology known to every node at start.
///
/// The node list is a totally ordered sequence shared by all nodes; order is
/// significant because both the queue hash ring and PBFT primary selection
/// index into it. Membership is fixed for the life of the process.
#[derive(Debug, Clone)]
pub struct ClusterTopology {
    local: NodeId,
    nodes: Vec<NodeSpec>,
}

impl ClusterTopology {
    /// Build a topology. The local node must appear in the list and ids must
    /// be unique.
    pub fn new(local: NodeId, nodes: Vec<NodeSpec>) -> Result<Self, TopologyError> {
        if nodes.is_empty() {
            return Err(TopologyError::EmptyNodeList);
        }
        for (i, node) in nodes.iter().enumerate() {
            if nodes[..i].iter().any(|other| other.id == node.id) {
                return Err(TopologyError::DuplicateNode(node.id.clone()));
            }
        }
        if !nodes.iter().any(|n| n.id == local) {
            return Err(TopologyError::LocalNotInList(local));
        }
        Ok(Self { local, nodes })
    }

    /// This node's id.
    pub fn local(&self) -> &NodeId {
        &self.local
    }

    /// Total number of nodes, `n`.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True for a single-node cluster.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All members in configured order.
    pub fn members(&self) -> &[NodeSpec] {
        &self.nodes
    }

    /// All node ids in configured order.
    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.iter().map(|n| &n.id)
    }

    /// Every member except the local node.
    pub fn peers(&self) -> impl Iterator<Item = &NodeSpec> {
        self.nodes.iter().filter(move |n| n.id != self.local)
    }

    /// Ids of every peer.
    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.peers().map(|n| n.id.clone()).collect()
    }

    /// Look up the address of a node.
    pub fn addr_of(&self, id: &NodeId) -> Option<&str> {
        self.nodes
            .iter()
            .find(|n| &n.id == id)
            .map(|n| n.addr.as_str())
    }

    /// Whether `id` names the local node.
    pub fn is_local(&self, id: &NodeId) -> bool {
        &self.local == id
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Queue hash ring
    // ═══════════════════════════════════════════════════════════════════════

    /// The node responsible for a queue:
    /// `all_nodes[stable_hash(queue_name) mod n]`.
    ///
    /// The hash is the first eight bytes of SHA-256 over the UTF-8 name,
    /// big-endian, so every node computes the same answer for the same list.
    pub fn responsible(&self, queue_name: &str) -> &NodeId {
        let index = (stable_hash(queue_name) % self.nodes.len() as u64) as usize;
        &self.nodes[index].id
    }

    // ═══════════════════════════════════════════════════════════════════════
    // PBFT arithmetic
    // ═══════════════════════════════════════════════════════════════════════

    /// Maximum tolerated Byzantine replicas: `f = ⌊(n−1)/3⌋`.
    pub fn max_faulty(&self) -> usize {
        (self.nodes.len() - 1) / 3
    }

    /// PBFT quorum size: `2f + 1`.
    pub fn pbft_quorum(&self) -> usize {
        2 * self.max_faulty() + 1
    }

    /// The primary for a view: `all_nodes[view mod n]`.
    pub fn primary_for(&self, view: u64) -> &NodeId {
        let index = (view % self.nodes.len() as u64) as usize;
        &self.nodes[index].id
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Raft arithmetic
    // ═══════════════════════════════════════════════════════════════════════

    /// Votes needed for a strict majority: `⌊n/2⌋ + 1`.
    pub fn majority(&self) -> usize {
        self.nodes.len() / 2 + 1
    }
}

/// Deterministic 64-bit hash of a name, shared by every node.
fn stable_hash(name: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    let bytes = hasher.finalize();
    u64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}
