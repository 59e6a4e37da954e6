//! LDAPMESH Cluster
//!
//! Replication topology management for a fleet of directory nodes:
//! node provisioning, replication link convergence, and the orchestrator
//! that drives both across the cluster.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod directive;
pub mod links;
pub mod membership;
pub mod orchestrator;
pub mod provisioner;
pub mod report;
pub mod resolver;
pub mod settings;
pub mod topology;

pub use directive::{DirectiveError, ParsedDirective, ProviderUrl, SyncDirective, parse_directive, tokenize};
pub use links::{DesiredLink, LinkError, LinkManager, LinkReport, ReplicationLink};
pub use membership::{Membership, MembershipError};
pub use orchestrator::{NodeState, Orchestrator, OrchestratorError};
pub use provisioner::{ProvisionError, ProvisionReport, ProvisionStatus, Provisioner, StepKind, StepOutcome};
pub use report::{LinkChange, NodeErrorKind, NodeReport, Operation, Phase, RunEvent, RunReport};
pub use resolver::{NameResolver, NoopResolver, StaticResolver, canonical_host};
pub use settings::{ConfigError, OrchestratorConfig, PurgePolicy, RawReplicationSettings, ReplicationSettings};
pub use topology::{DesiredTopology, PlannedLink, TopologyError};
