//! Desired replication topology.

use ldapmesh_core::{Node, NodeId, Rid, ServerId};
use std::collections::HashSet;

/// Topology errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopologyError {
    /// No nodes at all
    #[error("Topology has no nodes")]
    Empty,

    /// A node appears twice
    #[error("Node {node} listed more than once")]
    DuplicateNode {
        /// Repeated node
        node: NodeId,
    },

    /// A node has not been given a server ID
    #[error("Node {node} has no server ID")]
    MissingServerId {
        /// Node without an ID
        node: NodeId,
    },

    /// A node is not part of the topology
    #[error("Node {node} is not in the topology")]
    UnknownNode {
        /// Unknown node
        node: NodeId,
    },
}

/// One planned link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedLink<'a> {
    /// Node that pulls
    pub consumer: &'a Node,
    /// Node pulled from
    pub provider: &'a Node,
    /// Replica ID of the link
    pub rid: Rid,
}

/// The set of nodes that should replicate as a full mesh
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredTopology {
    nodes: Vec<Node>,
}

impl DesiredTopology {
    /// Create a topology
    #[must_use]
    pub fn new(nodes: Vec<Node>) -> Self {
        Self { nodes }
    }

    /// Nodes in declaration order
    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Look up a node
    #[must_use]
    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id() == id)
    }

    /// Number of nodes
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether there are no nodes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Topology with one more node
    ///
    /// # Errors
    ///
    /// Returns error if the node is already present
    pub fn with_node(&self, node: Node) -> Result<Self, TopologyError> {
        if self.node(node.id()).is_some() {
            return Err(TopologyError::DuplicateNode { node: node.id().clone() });
        }
        let mut nodes = self.nodes.clone();
        nodes.push(node);
        Ok(Self { nodes })
    }

    /// Topology without a node
    ///
    /// # Errors
    ///
    /// Returns error if the node is not present
    pub fn without(&self, id: &NodeId) -> Result<Self, TopologyError> {
        if self.node(id).is_none() {
            return Err(TopologyError::UnknownNode { node: id.clone() });
        }
        Ok(Self {
            nodes: self.nodes.iter().filter(|n| n.id() != id).cloned().collect(),
        })
    }

    /// Check that the topology can be converged
    ///
    /// Duplicate server IDs are not rejected here. The nodes holding them are
    /// failed individually and kept out of the mesh.
    ///
    /// # Errors
    ///
    /// Returns error if the topology is empty, repeats a node, or has a node
    /// without a server ID
    pub fn validate(&self) -> Result<(), TopologyError> {
        if self.nodes.is_empty() {
            return Err(TopologyError::Empty);
        }
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id()) {
                return Err(TopologyError::DuplicateNode { node: node.id().clone() });
            }
            if node.server_id.is_none() {
                return Err(TopologyError::MissingServerId { node: node.id().clone() });
            }
        }
        Ok(())
    }

    /// Server IDs held by more than one node
    #[must_use]
    pub fn duplicate_server_ids(&self) -> Vec<ServerId> {
        let mut seen = HashSet::new();
        let mut dups = Vec::new();
        for id in self.nodes.iter().filter_map(|n| n.server_id) {
            if !seen.insert(id) && !dups.contains(&id) {
                dups.push(id);
            }
        }
        dups
    }

    /// Every link of the full mesh over the `eligible` nodes,
    /// consumer-major in declaration order
    ///
    /// The rid of each link is the provider's server ID. Nodes without one
    /// are left out.
    #[must_use]
    pub fn full_mesh(&self, eligible: &HashSet<NodeId>) -> Vec<PlannedLink<'_>> {
        let members: Vec<&Node> = self.nodes.iter().filter(|n| eligible.contains(n.id())).collect();
        let mut plan = Vec::new();
        for &consumer in &members {
            for &provider in &members {
                if provider.id() == consumer.id() {
                    continue;
                }
                if let Some(server_id) = provider.server_id {
                    plan.push(PlannedLink {
                        consumer,
                        provider,
                        rid: Rid::from(server_id),
                    });
                }
            }
        }
        plan
    }
}
