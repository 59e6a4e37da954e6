//! Run reports and progress events.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use ldapmesh_core::{NodeId, Rid, RunId};
use serde::{Deserialize, Serialize};

/// Orchestrator operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Converge the whole topology
    Converge,
    /// Join a node and link it to the mesh
    AddNode,
    /// Detach a node from the mesh
    RemoveNode,
}

/// Run phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// No run in flight
    #[default]
    Idle,
    /// Preparing nodes to serve and record changes
    Provisioning,
    /// Writing replication links
    Linking,
    /// Every node reached its desired state
    Converged,
    /// At least one node failed
    PartiallyFailed,
}

impl Phase {
    /// Whether the phase ends a run
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Converged | Self::PartiallyFailed)
    }
}

/// Classification of a per-node failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeErrorKind {
    /// Node unreachable, bind rejected, or timed out
    Connectivity,
    /// The engine rejected a configuration change
    ConfigConflict,
    /// Desired state would break a topology invariant
    InvariantViolation,
    /// The run was cancelled before this node was handled
    Cancelled,
}

/// One link written or removed on a consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkChange {
    /// Replica ID
    pub rid: Rid,
    /// Provider URL
    pub provider: String,
    /// Whether an existing directive with this rid was replaced
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub replaced: bool,
}

impl LinkChange {
    /// Create a change record
    #[must_use]
    pub fn new(rid: Rid, provider: impl Into<String>) -> Self {
        Self {
            rid,
            provider: provider.into(),
            replaced: false,
        }
    }

    /// Mark as a replacement
    #[must_use]
    pub fn replacing(mut self) -> Self {
        self.replaced = true;
        self
    }
}

/// Outcome for one node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReport {
    /// Node passed provisioning in this run
    pub provisioned: bool,
    /// Links written on this node as consumer
    pub links_added: Vec<LinkChange>,
    /// Links removed from this node as consumer
    pub links_removed: Vec<LinkChange>,
    /// Mirror mode observed after the run
    pub mirror_mode: bool,
    /// Failure message
    pub error: Option<String>,
    /// Failure classification
    pub error_kind: Option<NodeErrorKind>,
    /// Node was detached from the mesh
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub removed: bool,
}

impl NodeReport {
    /// Record a failure
    pub fn fail(&mut self, kind: NodeErrorKind, error: impl Into<String>) {
        self.error_kind = Some(kind);
        self.error = Some(error.into());
    }

    /// Whether the node failed
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.error_kind.is_some()
    }
}

/// Result of one orchestrator run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    /// Run identifier
    pub run_id: RunId,
    /// Operation performed
    pub operation: Operation,
    /// Final phase
    pub phase: Phase,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// End time
    pub finished_at: Option<DateTime<Utc>>,
    /// Per-node outcomes, in topology order
    pub nodes: IndexMap<NodeId, NodeReport>,
}

impl RunReport {
    /// Start a report
    #[must_use]
    pub fn new(run_id: RunId, operation: Operation) -> Self {
        Self {
            run_id,
            operation,
            phase: Phase::Idle,
            started_at: Utc::now(),
            finished_at: None,
            nodes: IndexMap::new(),
        }
    }

    /// Report for a node, created on first access
    pub fn node_mut(&mut self, id: &NodeId) -> &mut NodeReport {
        self.nodes.entry(id.clone()).or_default()
    }

    /// Report for a node
    #[must_use]
    pub fn node(&self, id: &NodeId) -> Option<&NodeReport> {
        self.nodes.get(id)
    }

    /// Nodes that failed
    #[must_use]
    pub fn failed_nodes(&self) -> Vec<&NodeId> {
        self.nodes
            .iter()
            .filter(|(_, r)| r.is_failed())
            .map(|(id, _)| id)
            .collect()
    }

    /// Total links written across the cluster
    #[must_use]
    pub fn links_added(&self) -> usize {
        self.nodes.values().map(|r| r.links_added.len()).sum()
    }

    /// Total links removed across the cluster
    #[must_use]
    pub fn links_removed(&self) -> usize {
        self.nodes.values().map(|r| r.links_removed.len()).sum()
    }

    /// Close the report, deriving the terminal phase from node outcomes
    pub fn finish(&mut self) {
        self.phase = if self.nodes.values().any(NodeReport::is_failed) {
            Phase::PartiallyFailed
        } else {
            Phase::Converged
        };
        self.finished_at = Some(Utc::now());
    }

    /// Pretty JSON rendering
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Progress notification emitted during a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    /// The run entered a phase
    PhaseChanged {
        /// Run
        run_id: RunId,
        /// New phase
        phase: Phase,
    },
    /// A node finished provisioning
    NodeProvisioned {
        /// Node
        node: NodeId,
        /// Writes performed
        writes: usize,
    },
    /// A node's links were reconciled
    NodeLinked {
        /// Node
        node: NodeId,
        /// Links written
        added: usize,
        /// Links removed
        removed: usize,
    },
    /// A node failed
    NodeFailed {
        /// Node
        node: NodeId,
        /// Classification
        kind: NodeErrorKind,
        /// Message
        error: String,
    },
    /// The run finished
    Finished {
        /// Run
        run_id: RunId,
        /// Terminal phase
        phase: Phase,
    },
}
