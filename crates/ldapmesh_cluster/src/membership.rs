//! Cluster membership management.

use crate::resolver::StaticResolver;
use crate::topology::DesiredTopology;
use indexmap::IndexMap;
use ldapmesh_core::{Node, NodeId, ServerId, id::MAX_SERVER_ID};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Membership errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MembershipError {
    /// Node already a member
    #[error("Node {node} is already a member")]
    DuplicateNode {
        /// Repeated node
        node: NodeId,
    },

    /// Server ID held by another member
    #[error("Server ID {server_id} of {node} is already held by {holder}")]
    DuplicateServerId {
        /// Contested ID
        server_id: ServerId,
        /// Node being added
        node: NodeId,
        /// Current holder
        holder: NodeId,
    },

    /// Node not a member
    #[error("Node {node} is not a member")]
    NotFound {
        /// Missing node
        node: NodeId,
    },

    /// Every server ID is taken
    #[error("No free server ID left (limit {limit})")]
    Exhausted {
        /// Highest server ID
        limit: u16,
    },
}

/// Ordered set of cluster members
#[derive(Clone, Default)]
pub struct Membership {
    members: Arc<RwLock<IndexMap<NodeId, Node>>>,
}

impl Membership {
    /// Create an empty membership
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a node list
    ///
    /// # Errors
    ///
    /// Returns error if a node or server ID repeats
    pub async fn from_nodes(nodes: impl IntoIterator<Item = Node>) -> Result<Self, MembershipError> {
        let membership = Self::new();
        for node in nodes {
            membership.add_member(node).await?;
        }
        Ok(membership)
    }

    /// Add a member
    ///
    /// # Errors
    ///
    /// Returns error if the node or its server ID is already present
    pub async fn add_member(&self, node: Node) -> Result<(), MembershipError> {
        let mut members = self.members.write().await;
        if members.contains_key(node.id()) {
            return Err(MembershipError::DuplicateNode { node: node.id().clone() });
        }
        if let Some(server_id) = node.server_id {
            if let Some(holder) = members.values().find(|m| m.server_id == Some(server_id)) {
                return Err(MembershipError::DuplicateServerId {
                    server_id,
                    node: node.id().clone(),
                    holder: holder.id().clone(),
                });
            }
        }
        members.insert(node.id().clone(), node);
        Ok(())
    }

    /// Remove a member, returning it
    ///
    /// # Errors
    ///
    /// Returns error if the node is not a member
    pub async fn remove_member(&self, id: &NodeId) -> Result<Node, MembershipError> {
        self.members
            .write()
            .await
            .shift_remove(id)
            .ok_or_else(|| MembershipError::NotFound { node: id.clone() })
    }

    /// Get a member
    pub async fn get_member(&self, id: &NodeId) -> Option<Node> {
        self.members.read().await.get(id).cloned()
    }

    /// All members in insertion order
    pub async fn members(&self) -> Vec<Node> {
        self.members.read().await.values().cloned().collect()
    }

    /// Member count
    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    /// Give every member without a server ID the lowest free one
    ///
    /// Existing IDs are never changed. Returns the new assignments.
    ///
    /// # Errors
    ///
    /// Returns error if the ID space is exhausted
    pub async fn assign_server_ids(&self) -> Result<Vec<(NodeId, ServerId)>, MembershipError> {
        let mut members = self.members.write().await;
        let mut taken: Vec<u16> = members.values().filter_map(|m| m.server_id).map(ServerId::get).collect();
        let mut assigned = Vec::new();
        for member in members.values_mut().filter(|m| m.server_id.is_none()) {
            let next = (1..=MAX_SERVER_ID)
                .find(|v| !taken.contains(v))
                .ok_or(MembershipError::Exhausted { limit: MAX_SERVER_ID })?;
            let server_id = ServerId::new(next).map_err(|_| MembershipError::Exhausted { limit: MAX_SERVER_ID })?;
            taken.push(next);
            member.server_id = Some(server_id);
            info!(node = %member.id(), server_id = %server_id, "server ID assigned");
            assigned.push((member.id().clone(), server_id));
        }
        Ok(assigned)
    }

    /// Desired topology over the current members
    pub async fn topology(&self) -> DesiredTopology {
        DesiredTopology::new(self.members().await)
    }

    /// Resolver over the members' IP fallbacks
    pub async fn resolver(&self) -> StaticResolver {
        StaticResolver::from_nodes(self.members.read().await.values())
    }
}
