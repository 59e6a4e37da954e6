//! LDAPMESH CLI
//!
//! Command-line interface for converging and inspecting multi-master
//! replication across a cluster of directory nodes.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod config;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use color_eyre::eyre::{bail, eyre};
use config::{ClusterFile, NodeEntry};
use ldapmesh_cluster::{
    DesiredTopology, Membership, NoopResolver, Orchestrator, OrchestratorConfig, Phase, ReplicationSettings,
    RunEvent, RunReport,
};
use ldapmesh_core::{Credentials, Node, NodeAddress, NodeId, ServerId, TlsMode};
use ldapmesh_directory::memory::NodeHealth;
use ldapmesh_directory::{DirectoryConnector, LdapConnector, MemoryDirectory};
use serde_json::json;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ldapmesh")]
#[command(about = "LDAPMESH - Multi-master replication topology manager", long_about = None)]
struct Cli {
    /// Cluster file
    #[arg(short, long, default_value = "cluster.toml", env = "LDAPMESH_CONFIG")]
    config: PathBuf,

    /// Log level for ldapmesh crates (overrides RUST_LOG)
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision every node and link them as a full mesh
    Converge,
    /// Add a node to the cluster file and link it into the mesh
    AddNode {
        /// Hostname of the new node
        hostname: String,
        /// IP fallback
        #[arg(long)]
        ip: Option<IpAddr>,
        /// LDAP port
        #[arg(long, default_value_t = ldapmesh_core::node::DEFAULT_PORT)]
        port: u16,
        /// Transport security (ldaps, starttls, plain)
        #[arg(long, default_value = "ldaps")]
        tls: String,
        /// Bind password for the configuration namespace
        #[arg(long, env = "LDAPMESH_ADMIN_PASSWORD")]
        admin_password: String,
        /// Fixed server ID; the lowest free one when absent
        #[arg(long)]
        server_id: Option<u16>,
    },
    /// Unlink a node from the mesh and drop it from the cluster file
    RemoveNode {
        /// Hostname of the node to remove
        hostname: String,
    },
    /// Show the provisioning and link state of every node
    Status,
    /// Show the links stored on one node
    Links {
        /// Hostname of the node
        hostname: String,
    },
    /// Converge an in-memory cluster twice and report both runs
    Simulate {
        /// Number of nodes
        #[arg(short, long, default_value_t = 3)]
        nodes: usize,
        /// Hostnames to make unreachable
        #[arg(long)]
        unreachable: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref(), cli.json_logs)?;

    match cli.command {
        Commands::Converge => converge(&cli.config).await,
        Commands::AddNode {
            hostname,
            ip,
            port,
            tls,
            admin_password,
            server_id,
        } => {
            let mut entry = NodeEntry::new(hostname, admin_password);
            entry.ip = ip;
            entry.port = port;
            entry.tls = parse_tls(&tls)?;
            entry.server_id = server_id;
            add_node(&cli.config, entry).await
        }
        Commands::RemoveNode { hostname } => remove_node(&cli.config, &hostname).await,
        Commands::Status => status(&cli.config, None).await,
        Commands::Links { hostname } => status(&cli.config, Some(&hostname)).await,
        Commands::Simulate { nodes, unreachable } => simulate(nodes, &unreachable).await,
    }
}

fn init_tracing(level: Option<&str>, json: bool) -> Result<()> {
    let filter = match level {
        Some(level) => EnvFilter::try_new(format!("ldapmesh={}", level))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ldapmesh=info")),
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

fn parse_tls(value: &str) -> Result<TlsMode> {
    match value.to_ascii_lowercase().as_str() {
        "ldaps" => Ok(TlsMode::Ldaps),
        "starttls" => Ok(TlsMode::StartTls),
        "plain" => Ok(TlsMode::Plain),
        other => bail!("unknown TLS mode: {}", other),
    }
}

/// Load the cluster file, assign missing server IDs and persist them
async fn load_members(path: &Path) -> Result<(ClusterFile, Membership)> {
    let mut file = ClusterFile::load(path)?;
    let membership = Membership::from_nodes(file.to_nodes()?).await?;
    let assigned = membership.assign_server_ids().await?;
    if file.record_server_ids(&assigned) > 0 {
        file.save(path)?;
        info!(path = %path.display(), assigned = assigned.len(), "server IDs written back");
    }
    Ok((file, membership))
}

async fn build_orchestrator(
    connector: Arc<dyn DirectoryConnector>,
    settings: ReplicationSettings,
    membership: &Membership,
    config: OrchestratorConfig,
) -> Result<Orchestrator> {
    let (tx, mut rx) = mpsc::unbounded_channel::<RunEvent>();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Ok(line) = serde_json::to_string(&event) {
                debug!(event = %line, "run event");
            }
        }
    });
    let orchestrator = Orchestrator::new(connector, settings, Arc::new(membership.resolver().await), config)?
        .with_events(tx);

    let cancel = orchestrator.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, nodes not yet started will be skipped");
            cancel.cancel();
        }
    });
    Ok(orchestrator)
}

fn ldap_connector(file: &ClusterFile) -> Arc<dyn DirectoryConnector> {
    Arc::new(
        LdapConnector::new()
            .with_operation_timeout(file.orchestrator.operation_timeout())
            .with_certificate_verification(file.replication.verify_provider_cert),
    )
}

fn print_report(report: &RunReport) -> Result<()> {
    println!("{}", report.to_json()?);
    if report.phase == Phase::PartiallyFailed {
        bail!("{} node(s) failed", report.failed_nodes().len());
    }
    Ok(())
}

async fn converge(path: &Path) -> Result<()> {
    let (file, membership) = load_members(path).await?;
    let orchestrator = build_orchestrator(ldap_connector(&file), file.settings(), &membership, file.orchestrator.clone()).await?;
    let report = orchestrator.converge(&membership.topology().await).await?;
    print_report(&report)
}

async fn add_node(path: &Path, entry: NodeEntry) -> Result<()> {
    let mut file = ClusterFile::load(path)?;
    let id = entry.id()?;
    if file.entry(&id).is_some() {
        bail!("{} is already in {}", id, path.display());
    }
    file.nodes.push(entry);
    file.validate()?;
    file.save(path)?;

    let (file, membership) = load_members(path).await?;
    let topology = membership.topology().await;
    let node = membership
        .get_member(&id)
        .await
        .ok_or_else(|| eyre!("{} missing after load", id))?;
    let existing = topology.without(&id)?;

    let orchestrator = build_orchestrator(ldap_connector(&file), file.settings(), &membership, file.orchestrator.clone()).await?;
    let report = orchestrator.add_node(&existing, node).await?;
    print_report(&report)
}

async fn remove_node(path: &Path, hostname: &str) -> Result<()> {
    let (mut file, membership) = load_members(path).await?;
    let id = NodeId::new(hostname)?;
    let topology = membership.topology().await;

    let orchestrator = build_orchestrator(ldap_connector(&file), file.settings(), &membership, file.orchestrator.clone()).await?;
    let report = orchestrator.remove_node(&topology, &id).await?;
    if report.phase == Phase::Converged {
        file.remove_entry(&id);
        file.save(path)?;
        info!(node = %id, "node dropped from cluster file");
    } else {
        warn!(node = %id, "removal incomplete, node kept in cluster file");
    }
    print_report(&report)
}

async fn status(path: &Path, only: Option<&str>) -> Result<()> {
    let file = ClusterFile::load(path)?;
    let membership = Membership::from_nodes(file.to_nodes()?).await?;
    let topology = match only {
        Some(hostname) => {
            let id = NodeId::new(hostname)?;
            let node = membership
                .get_member(&id)
                .await
                .ok_or_else(|| eyre!("{} is not in {}", id, path.display()))?;
            DesiredTopology::new(vec![node])
        }
        None => membership.topology().await,
    };
    let orchestrator = build_orchestrator(ldap_connector(&file), file.settings(), &membership, file.orchestrator.clone()).await?;

    let mut out = serde_json::Map::new();
    for (node, state) in orchestrator.inspect(&topology).await {
        let value = match state {
            Ok(state) => serde_json::to_value(state)?,
            Err(error) => json!({ "error": error }),
        };
        out.insert(node.to_string(), value);
    }
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

async fn simulate(count: usize, unreachable: &[String]) -> Result<()> {
    if count == 0 {
        bail!("simulation needs at least one node");
    }
    let membership = Membership::new();
    for i in 1..=count {
        let address = NodeAddress::new(NodeId::new(&format!("ldap{}.sim", i))?);
        membership
            .add_member(Node::new(address, Credentials::config_admin("simulated")))
            .await?;
    }
    membership.assign_server_ids().await?;
    let topology = membership.topology().await;

    let dir = MemoryDirectory::with_nodes(topology.nodes().iter().map(Node::id)).await;
    for hostname in unreachable {
        dir.set_health(&NodeId::new(hostname)?, NodeHealth::Unreachable).await;
    }

    let settings = ReplicationSettings::new(Credentials::new("cn=replicator,o=gluu", "simulated"));
    let orchestrator = Orchestrator::new(
        Arc::new(dir.clone()),
        settings,
        Arc::new(NoopResolver),
        OrchestratorConfig::new(),
    )?;

    let first = orchestrator.converge(&topology).await?;
    let after_first = dir.total_writes().await;
    let second = orchestrator.converge(&topology).await?;
    let second_writes = dir.total_writes().await - after_first;

    let server_ids: Vec<(String, Option<u16>)> = topology
        .nodes()
        .iter()
        .map(|n| (n.id().to_string(), n.server_id.map(ServerId::get)))
        .collect();
    let summary = json!({
        "server_ids": server_ids,
        "first": first,
        "second": second,
        "writes": { "first": after_first, "second": second_writes },
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
