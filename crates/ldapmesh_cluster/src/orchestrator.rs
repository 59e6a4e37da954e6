//! Topology orchestrator.
//!
//! Drives provisioning and linking across every node of a topology. Nodes
//! are independent units of work: a node that fails is reported and left
//! out of the mesh, and the run carries on with the others. Only one run may
//! be in flight per orchestrator.

use crate::links::{DesiredLink, LinkError, LinkManager, LinkReport};
use crate::provisioner::{ProvisionStatus, Provisioner};
use crate::report::{NodeErrorKind, Operation, Phase, RunEvent, RunReport};
use crate::resolver::NameResolver;
use crate::settings::{ConfigError, OrchestratorConfig, ReplicationSettings};
use crate::topology::{DesiredTopology, TopologyError};
use futures::stream::{self, StreamExt};
use indexmap::IndexMap;
use ldapmesh_core::{Node, NodeId, Rid, RunId};
use ldapmesh_directory::{ConfigSession, DirectoryConnector};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, mpsc::UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Orchestrator errors
///
/// Only caller-level mistakes are errors; node failures go in the report.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrchestratorError {
    /// Nothing to converge
    #[error("Desired topology is empty")]
    EmptyTopology,

    /// The desired topology is unusable
    #[error("Invalid topology: {0}")]
    InvalidTopology(TopologyError),

    /// Another run holds the cluster
    #[error("A run is already in progress")]
    RunInProgress,

    /// Settings failed validation
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl From<TopologyError> for OrchestratorError {
    fn from(err: TopologyError) -> Self {
        match err {
            TopologyError::Empty => Self::EmptyTopology,
            other => Self::InvalidTopology(other),
        }
    }
}

/// Observed replication state of one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    /// Provisioning status
    pub status: ProvisionStatus,
    /// Stored links as (rid, provider)
    pub links: Vec<(Rid, String)>,
    /// Mirror mode flag
    pub mirror_mode: bool,
}

struct NodeFailure {
    kind: NodeErrorKind,
    message: String,
}

impl NodeFailure {
    fn new(kind: NodeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<LinkError> for NodeFailure {
    fn from(err: LinkError) -> Self {
        let kind = match &err {
            LinkError::Directory(e) if e.is_connectivity() => NodeErrorKind::Connectivity,
            LinkError::Directory(_) | LinkError::MalformedDirective { .. } => NodeErrorKind::ConfigConflict,
            LinkError::InvariantViolation { .. } => NodeErrorKind::InvariantViolation,
        };
        Self::new(kind, err.to_string())
    }
}

/// Drives provisioning and linking across a cluster
pub struct Orchestrator {
    connector: Arc<dyn DirectoryConnector>,
    provisioner: Provisioner,
    links: LinkManager,
    config: OrchestratorConfig,
    run_lock: Mutex<()>,
    phase: RwLock<Phase>,
    events: Option<UnboundedSender<RunEvent>>,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Create an orchestrator
    ///
    /// # Errors
    ///
    /// Returns error if the settings or configuration are invalid
    pub fn new(
        connector: Arc<dyn DirectoryConnector>,
        settings: ReplicationSettings,
        resolver: Arc<dyn NameResolver>,
        config: OrchestratorConfig,
    ) -> Result<Self, OrchestratorError> {
        settings.validate()?;
        config.validate()?;
        Ok(Self {
            connector,
            provisioner: Provisioner::new(settings.clone()),
            links: LinkManager::new(settings, resolver),
            config,
            run_lock: Mutex::new(()),
            phase: RwLock::new(Phase::Idle),
            events: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Stream progress events to a channel
    #[must_use]
    pub fn with_events(mut self, events: UnboundedSender<RunEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Use an external cancellation token
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that cancels runs of this orchestrator
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Current phase
    pub async fn phase(&self) -> Phase {
        *self.phase.read().await
    }

    /// Provision every node, then link the provisioned ones as a full mesh
    ///
    /// # Errors
    ///
    /// Returns error if the topology is empty or invalid, or a run is
    /// already in progress
    pub async fn converge(&self, topology: &DesiredTopology) -> Result<RunReport, OrchestratorError> {
        let _guard = self.run_lock.try_lock().map_err(|_| OrchestratorError::RunInProgress)?;
        topology.validate()?;
        Ok(self.run_mesh(topology, Operation::Converge).await)
    }

    /// Join a node and link it into the mesh
    ///
    /// Existing members are re-checked, so the run also repairs them.
    ///
    /// # Errors
    ///
    /// Returns error if the node is already present, the resulting topology
    /// is invalid, or a run is already in progress
    pub async fn add_node(&self, topology: &DesiredTopology, node: Node) -> Result<RunReport, OrchestratorError> {
        let _guard = self.run_lock.try_lock().map_err(|_| OrchestratorError::RunInProgress)?;
        let topology = topology.with_node(node)?;
        topology.validate()?;
        Ok(self.run_mesh(&topology, Operation::AddNode).await)
    }

    /// Detach a node: every remaining node drops its link to it, then the
    /// node's own replication configuration is torn down
    ///
    /// # Errors
    ///
    /// Returns error if the node is not in the topology, the topology is
    /// invalid, or a run is already in progress
    pub async fn remove_node(&self, topology: &DesiredTopology, id: &NodeId) -> Result<RunReport, OrchestratorError> {
        let _guard = self.run_lock.try_lock().map_err(|_| OrchestratorError::RunInProgress)?;
        topology.validate()?;
        let remaining = topology.without(id)?;
        let removed = topology
            .node(id)
            .ok_or_else(|| TopologyError::UnknownNode { node: id.clone() })?;
        let duplicates = topology.duplicate_server_ids();
        let rid = removed
            .server_id
            .filter(|sid| !duplicates.contains(sid))
            .map(Rid::from);

        let run_id = RunId::new();
        let mut report = RunReport::new(run_id, Operation::RemoveNode);
        for node in topology.nodes() {
            report.node_mut(node.id());
        }
        info!(run = %run_id, node = %id, remaining = remaining.len(), "removing node");
        self.set_phase(run_id, Phase::Linking).await;

        let outcomes: Vec<(NodeId, Result<LinkReport, NodeFailure>)> = stream::iter(remaining.nodes())
            .map(|consumer| async move {
                let result = self
                    .bounded(async {
                        let mut session = self.open(consumer).await?;
                        let result = self.unlink(session.as_mut(), removed, rid).await;
                        release(session).await;
                        result
                    })
                    .await;
                (consumer.id().clone(), result)
            })
            .buffer_unordered(self.config.max_concurrent)
            .collect()
            .await;
        for (node, outcome) in outcomes {
            self.record_links(&mut report, &node, outcome);
        }

        let teardown = self
            .bounded(async {
                let mut session = self.open(removed).await?;
                let result = self.links.teardown(session.as_mut()).await.map_err(NodeFailure::from);
                release(session).await;
                result
            })
            .await;
        self.record_links(&mut report, id, teardown);
        report.node_mut(id).removed = true;

        Ok(self.finish(report).await)
    }

    /// Read every node's replication state without changing anything
    pub async fn inspect(&self, topology: &DesiredTopology) -> IndexMap<NodeId, Result<NodeState, String>> {
        let mut states: IndexMap<NodeId, Result<NodeState, String>> = topology
            .nodes()
            .iter()
            .map(|n| (n.id().clone(), Err("not inspected".to_string())))
            .collect();
        let outcomes: Vec<(NodeId, Result<NodeState, String>)> = stream::iter(topology.nodes())
            .map(|node| async move {
                let result = self
                    .bounded(async {
                        let mut session = self.open(node).await?;
                        let state = self.read_state(session.as_mut()).await;
                        release(session).await;
                        state
                    })
                    .await
                    .map_err(|f| f.message);
                (node.id().clone(), result)
            })
            .buffer_unordered(self.config.max_concurrent)
            .collect()
            .await;
        for (node, state) in outcomes {
            states.insert(node, state);
        }
        states
    }

    async fn run_mesh(&self, topology: &DesiredTopology, operation: Operation) -> RunReport {
        let run_id = RunId::new();
        let mut report = RunReport::new(run_id, operation);
        for node in topology.nodes() {
            report.node_mut(node.id());
        }
        info!(run = %run_id, operation = ?operation, nodes = topology.len(), "run started");
        self.set_phase(run_id, Phase::Provisioning).await;

        // Nodes sharing a server ID would also share a rid; none of them is touched.
        let duplicates = topology.duplicate_server_ids();
        let mut candidates = Vec::new();
        for node in topology.nodes() {
            match node.server_id.filter(|id| duplicates.contains(id)) {
                Some(server_id) => self.record_failure(
                    &mut report,
                    node.id(),
                    NodeFailure::new(
                        NodeErrorKind::InvariantViolation,
                        format!("server ID {} is held by more than one node", server_id),
                    ),
                ),
                None => candidates.push(node),
            }
        }

        let provisioned: Vec<(NodeId, Result<usize, NodeFailure>)> = stream::iter(candidates)
            .map(|node| async move { (node.id().clone(), self.bounded(self.provision_node(node)).await) })
            .buffer_unordered(self.config.max_concurrent)
            .collect()
            .await;

        let mut eligible = HashSet::new();
        for (node, outcome) in provisioned {
            match outcome {
                Ok(writes) => {
                    report.node_mut(&node).provisioned = true;
                    self.emit(RunEvent::NodeProvisioned { node: node.clone(), writes });
                    eligible.insert(node);
                }
                Err(failure) => self.record_failure(&mut report, &node, failure),
            }
        }

        self.set_phase(run_id, Phase::Linking).await;
        let plan = topology.full_mesh(&eligible);
        let consumers: Vec<(&Node, Vec<&Node>)> = topology
            .nodes()
            .iter()
            .filter(|n| eligible.contains(n.id()))
            .map(|consumer| {
                let providers = plan
                    .iter()
                    .filter(|link| link.consumer.id() == consumer.id())
                    .map(|link| link.provider)
                    .collect();
                (consumer, providers)
            })
            .collect();
        let linked: Vec<(NodeId, Result<LinkReport, NodeFailure>)> = stream::iter(consumers)
            .map(|(consumer, providers)| async move {
                let desired = providers
                    .into_iter()
                    .map(|p| self.links.desired_link(p))
                    .collect::<Result<Vec<DesiredLink>, LinkError>>();
                let result = match desired {
                    Ok(desired) => {
                        self.bounded(async {
                            let mut session = self.open(consumer).await?;
                            let result = self
                                .links
                                .converge(session.as_mut(), &desired)
                                .await
                                .map_err(NodeFailure::from);
                            release(session).await;
                            result
                        })
                        .await
                    }
                    Err(e) => Err(NodeFailure::from(e)),
                };
                (consumer.id().clone(), result)
            })
            .buffer_unordered(self.config.max_concurrent)
            .collect()
            .await;
        for (node, outcome) in linked {
            self.record_links(&mut report, &node, outcome);
        }

        self.finish(report).await
    }

    async fn provision_node(&self, node: &Node) -> Result<usize, NodeFailure> {
        let server_id = node
            .require_server_id()
            .map_err(|e| NodeFailure::new(NodeErrorKind::InvariantViolation, e.to_string()))?;
        let mut session = self.open(node).await?;
        let result = self.provisioner.provision(session.as_mut(), server_id).await;
        release(session).await;
        match result {
            Ok(report) => Ok(report.writes()),
            Err(e) => {
                let kind = if e.is_connectivity() {
                    NodeErrorKind::Connectivity
                } else {
                    NodeErrorKind::ConfigConflict
                };
                Err(NodeFailure::new(kind, e.to_string()))
            }
        }
    }

    async fn unlink(
        &self,
        session: &mut dyn ConfigSession,
        removed: &Node,
        rid: Option<Rid>,
    ) -> Result<LinkReport, NodeFailure> {
        if let Some(rid) = rid {
            let by_rid = self.links.remove_link_by_rid(session, rid).await?;
            if !by_rid.removed.is_empty() {
                return Ok(by_rid);
            }
        }
        Ok(self.links.remove_link(session, &removed.address).await?)
    }

    async fn read_state(&self, session: &mut dyn ConfigSession) -> Result<NodeState, NodeFailure> {
        let status = self
            .provisioner
            .status(session)
            .await
            .map_err(|e| NodeFailure::from(LinkError::from(e)))?;
        let links = self
            .links
            .list_links(session)
            .await?
            .into_iter()
            .map(|l| (l.rid, l.provider.to_string()))
            .collect();
        let mirror_mode = self.links.mirror_mode(session).await?;
        Ok(NodeState {
            status,
            links,
            mirror_mode,
        })
    }

    async fn open(&self, node: &Node) -> Result<Box<dyn ConfigSession>, NodeFailure> {
        self.connector
            .connect(node)
            .await
            .map_err(|e| NodeFailure::new(NodeErrorKind::Connectivity, e.to_string()))
    }

    /// Apply cancellation and the per-node timeout to one node's work
    async fn bounded<T, F>(&self, work: F) -> Result<T, NodeFailure>
    where
        F: Future<Output = Result<T, NodeFailure>>,
    {
        if self.cancel.is_cancelled() {
            return Err(NodeFailure::new(NodeErrorKind::Cancelled, "run cancelled"));
        }
        match tokio::time::timeout(self.config.operation_timeout(), work).await {
            Ok(result) => result,
            Err(_) => Err(NodeFailure::new(
                NodeErrorKind::Connectivity,
                format!("operation timed out after {}ms", self.config.operation_timeout_ms),
            )),
        }
    }

    fn record_links(
        &self,
        report: &mut RunReport,
        node: &NodeId,
        outcome: Result<LinkReport, NodeFailure>,
    ) {
        match outcome {
            Ok(links) => {
                self.emit(RunEvent::NodeLinked {
                    node: node.clone(),
                    added: links.added.len(),
                    removed: links.removed.len(),
                });
                let entry = report.node_mut(node);
                entry.links_added = links.added;
                entry.links_removed = links.removed;
                entry.mirror_mode = links.mirror_mode;
            }
            Err(failure) => self.record_failure(report, node, failure),
        }
    }

    fn record_failure(&self, report: &mut RunReport, node: &NodeId, failure: NodeFailure) {
        warn!(node = %node, kind = ?failure.kind, error = %failure.message, "node failed");
        self.emit(RunEvent::NodeFailed {
            node: node.clone(),
            kind: failure.kind,
            error: failure.message.clone(),
        });
        report.node_mut(node).fail(failure.kind, failure.message);
    }

    async fn finish(&self, mut report: RunReport) -> RunReport {
        report.finish();
        self.set_phase(report.run_id, report.phase).await;
        self.emit(RunEvent::Finished {
            run_id: report.run_id,
            phase: report.phase,
        });
        info!(
            run = %report.run_id,
            phase = ?report.phase,
            added = report.links_added(),
            removed = report.links_removed(),
            failed = report.failed_nodes().len(),
            "run finished"
        );
        report
    }

    async fn set_phase(&self, run_id: RunId, phase: Phase) {
        *self.phase.write().await = phase;
        debug!(run = %run_id, phase = ?phase, "phase changed");
        self.emit(RunEvent::PhaseChanged { run_id, phase });
    }

    fn emit(&self, event: RunEvent) {
        if let Some(events) = &self.events {
            // A dropped receiver only means nobody is listening.
            let _ = events.send(event);
        }
    }
}

async fn release(mut session: Box<dyn ConfigSession>) {
    if let Err(e) = session.close().await {
        debug!(node = %session.node(), error = %e, "close failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::NoopResolver;
    use ldapmesh_core::{Credentials, NodeAddress, ServerId};
    use ldapmesh_directory::MemoryDirectory;
    use ldapmesh_directory::memory::{NodeHealth, SEED_PRIMARY_DB};
    use proptest::prelude::*;
    use tokio::sync::mpsc;

    fn node(host: &str, server_id: u16) -> Node {
        Node::new(
            NodeAddress::new(NodeId::new(host).unwrap()),
            Credentials::config_admin("secret"),
        )
        .with_server_id(ServerId::new(server_id).unwrap())
    }

    fn settings() -> ReplicationSettings {
        ReplicationSettings::new(Credentials::new("cn=replicator,o=gluu", "replpw"))
    }

    fn topology(hosts: &[&str]) -> DesiredTopology {
        DesiredTopology::new(
            hosts
                .iter()
                .enumerate()
                .map(|(i, h)| node(h, (i + 1) as u16))
                .collect(),
        )
    }

    async fn cluster(hosts: &[&str]) -> (MemoryDirectory, DesiredTopology, Orchestrator) {
        let topology = topology(hosts);
        let dir = MemoryDirectory::with_nodes(topology.nodes().iter().map(Node::id)).await;
        let orchestrator = Orchestrator::new(
            Arc::new(dir.clone()),
            settings(),
            Arc::new(NoopResolver),
            OrchestratorConfig::new().with_max_concurrent(4),
        )
        .unwrap();
        (dir, topology, orchestrator)
    }

    async fn links_on(dir: &MemoryDirectory, host: &str) -> Vec<String> {
        dir.values(&NodeId::new(host).unwrap(), SEED_PRIMARY_DB, "olcSyncrepl")
            .await
    }

    async fn mirror_on(dir: &MemoryDirectory, host: &str) -> bool {
        dir.values(&NodeId::new(host).unwrap(), SEED_PRIMARY_DB, "olcMirrorMode")
            .await
            == vec!["TRUE".to_string()]
    }

    #[tokio::test]
    async fn test_converge_full_mesh() {
        let (dir, topology, orchestrator) = cluster(&["a", "b", "c"]).await;
        let report = orchestrator.converge(&topology).await.unwrap();

        assert_eq!(report.phase, Phase::Converged);
        assert_eq!(orchestrator.phase().await, Phase::Converged);
        assert_eq!(report.links_added(), 6);
        for host in ["a", "b", "c"] {
            let r = report.node(&NodeId::new(host).unwrap()).unwrap();
            assert!(r.provisioned);
            assert!(r.mirror_mode);
            assert_eq!(r.links_added.len(), 2);
            assert_eq!(links_on(&dir, host).await.len(), 2);
            assert!(mirror_on(&dir, host).await);
        }
    }

    #[tokio::test]
    async fn test_second_converge_writes_nothing() {
        let (dir, topology, orchestrator) = cluster(&["a", "b", "c"]).await;
        orchestrator.converge(&topology).await.unwrap();
        let before = dir.total_writes().await;
        let first_links = links_on(&dir, "a").await;

        let report = orchestrator.converge(&topology).await.unwrap();
        assert_eq!(report.phase, Phase::Converged);
        assert_eq!(report.links_added(), 0);
        assert_eq!(report.links_removed(), 0);
        assert_eq!(dir.total_writes().await, before);
        assert_eq!(links_on(&dir, "a").await, first_links);
    }

    #[tokio::test]
    async fn test_rids_follow_provider_server_ids() {
        let (dir, topology, orchestrator) = cluster(&["a", "b", "c"]).await;
        orchestrator.converge(&topology).await.unwrap();
        let on_b = links_on(&dir, "b").await;
        assert!(on_b.iter().any(|v| v.contains("rid=001 provider=ldaps://a:1636 ")));
        assert!(on_b.iter().any(|v| v.contains("rid=003 provider=ldaps://c:1636 ")));
    }

    #[tokio::test]
    async fn test_unreachable_node_isolated() {
        let (dir, topology, orchestrator) = cluster(&["a", "b", "c", "d"]).await;
        dir.set_health(&NodeId::new("d").unwrap(), NodeHealth::Unreachable).await;

        let report = orchestrator.converge(&topology).await.unwrap();
        assert_eq!(report.phase, Phase::PartiallyFailed);
        assert_eq!(report.failed_nodes(), vec![&NodeId::new("d").unwrap()]);
        let d = report.node(&NodeId::new("d").unwrap()).unwrap();
        assert_eq!(d.error_kind, Some(NodeErrorKind::Connectivity));
        assert!(!d.provisioned);

        assert_eq!(report.links_added(), 6);
        for host in ["a", "b", "c"] {
            let links = links_on(&dir, host).await;
            assert_eq!(links.len(), 2);
            assert!(links.iter().all(|v| !v.contains("ldaps://d:")));
        }
    }

    #[tokio::test]
    async fn test_rejected_provisioning_excluded_from_mesh() {
        let (dir, topology, orchestrator) = cluster(&["a", "b", "c"]).await;
        dir.reject_writes(&NodeId::new("c").unwrap(), "cn=module{0},cn=config")
            .await;

        let report = orchestrator.converge(&topology).await.unwrap();
        let c = report.node(&NodeId::new("c").unwrap()).unwrap();
        assert_eq!(c.error_kind, Some(NodeErrorKind::ConfigConflict));
        assert!(links_on(&dir, "c").await.is_empty());
        assert_eq!(links_on(&dir, "a").await.len(), 1);
        assert_eq!(links_on(&dir, "b").await.len(), 1);
    }

    async fn orchestrate(topology: &DesiredTopology, config: OrchestratorConfig) -> (MemoryDirectory, Orchestrator) {
        let dir = MemoryDirectory::with_nodes(topology.nodes().iter().map(Node::id)).await;
        let orchestrator =
            Orchestrator::new(Arc::new(dir.clone()), settings(), Arc::new(NoopResolver), config).unwrap();
        (dir, orchestrator)
    }

    #[tokio::test]
    async fn test_shared_server_id_keeps_nodes_out_of_mesh() {
        let topology = DesiredTopology::new(vec![node("a", 1), node("b", 2), node("c", 2), node("d", 4)]);
        let (dir, orchestrator) = orchestrate(&topology, OrchestratorConfig::new()).await;

        let report = orchestrator.converge(&topology).await.unwrap();
        assert_eq!(report.phase, Phase::PartiallyFailed);
        for host in ["b", "c"] {
            let id = NodeId::new(host).unwrap();
            let r = report.node(&id).unwrap();
            assert_eq!(r.error_kind, Some(NodeErrorKind::InvariantViolation));
            assert!(!r.provisioned);
            assert!(links_on(&dir, host).await.is_empty());
            assert!(!mirror_on(&dir, host).await);
            assert_eq!(dir.write_count(&id).await, 0);
        }
        for host in ["a", "d"] {
            let links = links_on(&dir, host).await;
            assert_eq!(links.len(), 1);
            assert!(links.iter().all(|v| !v.contains("rid=002")));
            assert!(mirror_on(&dir, host).await);
        }
    }

    #[tokio::test]
    async fn test_remove_node_with_shared_server_id_unlinks_by_address() {
        let (dir, topology, orchestrator) = cluster(&["a", "b", "c"]).await;
        orchestrator.converge(&topology).await.unwrap();

        // c has since been given b's server ID; its rid no longer identifies it
        let drifted = DesiredTopology::new(vec![node("a", 1), node("b", 2), node("c", 2)]);
        let report = orchestrator
            .remove_node(&drifted, &NodeId::new("c").unwrap())
            .await
            .unwrap();
        assert_eq!(report.phase, Phase::Converged);
        let on_a = links_on(&dir, "a").await;
        assert_eq!(on_a.len(), 1);
        assert!(on_a[0].contains("rid=002 provider=ldaps://b:1636 "));
    }

    #[tokio::test]
    async fn test_remove_node_scenario() {
        let (dir, topology, orchestrator) = cluster(&["a", "b", "c"]).await;
        orchestrator.converge(&topology).await.unwrap();

        let c = NodeId::new("c").unwrap();
        let report = orchestrator.remove_node(&topology, &c).await.unwrap();
        assert_eq!(report.phase, Phase::Converged);
        for host in ["a", "b"] {
            let r = report.node(&NodeId::new(host).unwrap()).unwrap();
            assert_eq!(r.links_removed.len(), 1);
            assert_eq!(r.links_removed[0].rid.get(), 3);
            assert!(r.mirror_mode);
            assert_eq!(links_on(&dir, host).await.len(), 1);
            assert!(mirror_on(&dir, host).await);
        }
        let removed = report.node(&c).unwrap();
        assert!(removed.removed);
        assert_eq!(removed.links_removed.len(), 2);
        assert!(links_on(&dir, "c").await.is_empty());
        assert!(!mirror_on(&dir, "c").await);
    }

    #[tokio::test]
    async fn test_remove_sole_provider_disables_mirror_mode() {
        let (dir, topology, orchestrator) = cluster(&["a", "b"]).await;
        orchestrator.converge(&topology).await.unwrap();

        let report = orchestrator
            .remove_node(&topology, &NodeId::new("b").unwrap())
            .await
            .unwrap();
        let a = report.node(&NodeId::new("a").unwrap()).unwrap();
        assert!(!a.mirror_mode);
        assert!(!mirror_on(&dir, "a").await);
    }

    #[tokio::test]
    async fn test_add_node_links_into_mesh() {
        let (dir, topology, orchestrator) = cluster(&["a", "b"]).await;
        orchestrator.converge(&topology).await.unwrap();
        dir.add_node(&NodeId::new("c").unwrap()).await;

        let report = orchestrator.add_node(&topology, node("c", 3)).await.unwrap();
        assert_eq!(report.operation, Operation::AddNode);
        assert_eq!(report.phase, Phase::Converged);
        assert_eq!(report.links_added(), 4);
        for host in ["a", "b", "c"] {
            assert_eq!(links_on(&dir, host).await.len(), 2);
        }
        assert!(matches!(
            orchestrator.add_node(&topology, node("a", 9)).await,
            Err(OrchestratorError::InvalidTopology(TopologyError::DuplicateNode { .. }))
        ));
    }

    #[tokio::test]
    async fn test_fatal_errors() {
        let (_dir, _topology, orchestrator) = cluster(&["a"]).await;
        assert_eq!(
            orchestrator.converge(&DesiredTopology::default()).await.unwrap_err(),
            OrchestratorError::EmptyTopology
        );
        let unassigned = DesiredTopology::new(vec![Node::new(
            NodeAddress::new(NodeId::new("x").unwrap()),
            Credentials::config_admin("secret"),
        )]);
        assert!(matches!(
            orchestrator.converge(&unassigned).await,
            Err(OrchestratorError::InvalidTopology(TopologyError::MissingServerId { .. }))
        ));
    }

    #[tokio::test]
    async fn test_run_in_progress() {
        let (_dir, topology, orchestrator) = cluster(&["a"]).await;
        let _held = orchestrator.run_lock.lock().await;
        assert_eq!(
            orchestrator.converge(&topology).await.unwrap_err(),
            OrchestratorError::RunInProgress
        );
    }

    #[tokio::test]
    async fn test_cancelled_run_touches_nothing() {
        let (dir, topology, orchestrator) = cluster(&["a", "b"]).await;
        orchestrator.cancellation().cancel();
        let report = orchestrator.converge(&topology).await.unwrap();
        assert_eq!(report.phase, Phase::PartiallyFailed);
        assert!(report
            .nodes
            .values()
            .all(|r| r.error_kind == Some(NodeErrorKind::Cancelled)));
        assert_eq!(dir.total_writes().await, 0);
    }

    #[tokio::test]
    async fn test_hanging_node_times_out() {
        let mesh = topology(&["a", "b"]);
        let (dir, orchestrator) = orchestrate(&mesh, OrchestratorConfig::new().with_operation_timeout(200)).await;
        dir.set_health(&NodeId::new("b").unwrap(), NodeHealth::Hanging).await;

        let started = std::time::Instant::now();
        let report = orchestrator.converge(&mesh).await.unwrap();
        assert!(started.elapsed() >= std::time::Duration::from_millis(200));

        let b = report.node(&NodeId::new("b").unwrap()).unwrap();
        assert_eq!(b.error_kind, Some(NodeErrorKind::Connectivity));
        assert_eq!(b.error.as_deref(), Some("operation timed out after 200ms"));
        let a = report.node(&NodeId::new("a").unwrap()).unwrap();
        assert!(a.provisioned);
        assert!(a.error_kind.is_none());
        assert!(links_on(&dir, "a").await.is_empty());
        assert!(!mirror_on(&dir, "a").await);
    }

    #[tokio::test]
    async fn test_events_streamed() {
        let (dir, topology, _) = cluster(&["a", "b"]).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let orchestrator = Orchestrator::new(
            Arc::new(dir),
            settings(),
            Arc::new(NoopResolver),
            OrchestratorConfig::new(),
        )
        .unwrap()
        .with_events(tx);
        orchestrator.converge(&topology).await.unwrap();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(matches!(
            events.first(),
            Some(RunEvent::PhaseChanged { phase: Phase::Provisioning, .. })
        ));
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, RunEvent::NodeLinked { .. }))
                .count(),
            2
        );
        assert!(matches!(
            events.last(),
            Some(RunEvent::Finished { phase: Phase::Converged, .. })
        ));
    }

    #[tokio::test]
    async fn test_inspect() {
        let (_dir, topology, orchestrator) = cluster(&["a", "b"]).await;
        orchestrator.converge(&topology).await.unwrap();
        let states = orchestrator.inspect(&topology).await;
        let a = states[&NodeId::new("a").unwrap()].as_ref().unwrap();
        assert!(a.status.is_provisioned());
        assert!(a.mirror_mode);
        assert_eq!(a.links, vec![(Rid::new(2).unwrap(), "ldaps://b:1636".to_string())]);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let bad = ReplicationSettings::new(Credentials::new("cn=replicator,o=gluu", ""));
        let result = Orchestrator::new(
            Arc::new(MemoryDirectory::new()),
            bad,
            Arc::new(NoopResolver),
            OrchestratorConfig::new(),
        );
        assert!(matches!(result, Err(OrchestratorError::Config(_))));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_converge_links_every_pair(server_ids in prop::collection::hash_set(1u16..=999, 1..7)) {
            let server_ids: Vec<u16> = server_ids.into_iter().collect();
            let n = server_ids.len();
            let topology = DesiredTopology::new(
                server_ids
                    .iter()
                    .enumerate()
                    .map(|(i, sid)| node(&format!("ldap{}", i), *sid))
                    .collect(),
            );
            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let (phase, stored, states) = runtime.block_on(async {
                let (dir, orchestrator) = orchestrate(&topology, OrchestratorConfig::new()).await;
                let report = orchestrator.converge(&topology).await.unwrap();
                let mut stored = 0;
                for member in topology.nodes() {
                    stored += dir.values(member.id(), SEED_PRIMARY_DB, "olcSyncrepl").await.len();
                }
                (report.phase, stored, orchestrator.inspect(&topology).await)
            });

            prop_assert_eq!(phase, Phase::Converged);
            prop_assert_eq!(stored, n * (n - 1));
            for (i, sid) in server_ids.iter().enumerate() {
                let state = states[&NodeId::new(&format!("ldap{}", i)).unwrap()].as_ref().unwrap();
                let mut rids: Vec<u16> = state.links.iter().map(|(rid, _)| rid.get()).collect();
                rids.sort_unstable();
                let mut expected: Vec<u16> = server_ids.iter().copied().filter(|s| s != sid).collect();
                expected.sort_unstable();
                prop_assert_eq!(rids, expected);
                prop_assert_eq!(state.mirror_mode, n > 1);
            }
        }
    }
}
