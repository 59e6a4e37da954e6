//! Cluster file handling.
//!
//! The cluster file is TOML: replication settings, orchestrator limits and
//! one `[[nodes]]` table per directory server. Server IDs handed out by the
//! CLI are written back so later runs keep the same rids.

use ldapmesh_cluster::{ConfigError, OrchestratorConfig, RawReplicationSettings, ReplicationSettings};
use ldapmesh_core::{CoreError, Credentials, Node, NodeAddress, NodeId, ServerId, TlsMode};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;

/// Cluster file errors
#[derive(Debug, thiserror::Error)]
pub enum ClusterFileError {
    /// File does not exist
    #[error("Cluster file not found: {path}")]
    NotFound {
        /// Path looked up
        path: String,
    },

    /// Read or write failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// File is not valid TOML for a cluster
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// File could not be rendered
    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A node entry is invalid
    #[error("Node {hostname}: {source}")]
    Node {
        /// Entry hostname
        hostname: String,
        /// Underlying error
        #[source]
        source: CoreError,
    },

    /// A hostname appears twice
    #[error("Node {hostname} listed more than once")]
    DuplicateNode {
        /// Repeated hostname
        hostname: String,
    },

    /// Settings are invalid
    #[error("Invalid settings: {0}")]
    Config(#[from] ConfigError),
}

/// One `[[nodes]]` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEntry {
    /// Hostname providers are addressed by
    pub hostname: String,
    /// IP fallback
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,
    /// LDAP port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Transport security
    #[serde(default)]
    pub tls: TlsMode,
    /// Bind DN for the configuration namespace
    #[serde(default = "default_admin_dn")]
    pub admin_dn: String,
    /// Bind password for the configuration namespace
    pub admin_password: String,
    /// Server ID, assigned on first use when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<u16>,
}

impl NodeEntry {
    /// Create an entry with default port, TLS and admin DN
    #[must_use]
    pub fn new(hostname: impl Into<String>, admin_password: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            ip: None,
            port: default_port(),
            tls: TlsMode::default(),
            admin_dn: default_admin_dn(),
            admin_password: admin_password.into(),
            server_id: None,
        }
    }

    /// Node identity of this entry
    ///
    /// # Errors
    ///
    /// Returns error if the hostname is invalid
    pub fn id(&self) -> Result<NodeId, ClusterFileError> {
        NodeId::new(&self.hostname).map_err(|source| self.invalid(source))
    }

    /// Convert to a node
    ///
    /// # Errors
    ///
    /// Returns error if the hostname or server ID is invalid
    pub fn to_node(&self) -> Result<Node, ClusterFileError> {
        let mut address = NodeAddress::new(self.id()?).with_port(self.port).with_tls(self.tls);
        if let Some(ip) = self.ip {
            address = address.with_ip(ip);
        }
        let node = Node::new(address, Credentials::new(self.admin_dn.clone(), self.admin_password.clone()));
        match self.server_id {
            Some(id) => Ok(node.with_server_id(ServerId::new(id).map_err(|source| self.invalid(source))?)),
            None => Ok(node),
        }
    }

    fn invalid(&self, source: CoreError) -> ClusterFileError {
        ClusterFileError::Node {
            hostname: self.hostname.clone(),
            source,
        }
    }
}

/// The whole cluster file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterFile {
    /// Replication settings
    #[serde(default)]
    pub replication: RawReplicationSettings,
    /// Orchestrator limits
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// Member nodes in declaration order
    #[serde(default)]
    pub nodes: Vec<NodeEntry>,
}

impl ClusterFile {
    /// Load and validate a cluster file
    ///
    /// # Errors
    ///
    /// Returns error if the file is missing, unreadable or invalid
    pub fn load(path: &Path) -> Result<Self, ClusterFileError> {
        if !path.exists() {
            return Err(ClusterFileError::NotFound {
                path: path.display().to_string(),
            });
        }
        let contents = std::fs::read_to_string(path)?;
        let file: Self = toml::from_str(&contents)?;
        file.validate()?;
        Ok(file)
    }

    /// Write the file back
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be rendered or written
    pub fn save(&self, path: &Path) -> Result<(), ClusterFileError> {
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Check settings and node entries
    ///
    /// # Errors
    ///
    /// Returns error on the first invalid setting or node entry
    pub fn validate(&self) -> Result<(), ClusterFileError> {
        self.settings().validate()?;
        self.orchestrator.validate()?;
        let mut seen = HashSet::new();
        for entry in &self.nodes {
            let node = entry.to_node()?;
            if !seen.insert(node.id().clone()) {
                return Err(ClusterFileError::DuplicateNode {
                    hostname: entry.hostname.clone(),
                });
            }
        }
        Ok(())
    }

    /// Replication settings
    #[must_use]
    pub fn settings(&self) -> ReplicationSettings {
        self.replication.clone().into()
    }

    /// Member nodes
    ///
    /// # Errors
    ///
    /// Returns error if an entry is invalid
    pub fn to_nodes(&self) -> Result<Vec<Node>, ClusterFileError> {
        self.nodes.iter().map(NodeEntry::to_node).collect()
    }

    /// Look up an entry by node identity
    #[must_use]
    pub fn entry(&self, id: &NodeId) -> Option<&NodeEntry> {
        self.nodes.iter().find(|e| e.id().is_ok_and(|n| n == *id))
    }

    /// Record server IDs assigned by the membership
    ///
    /// Returns how many entries changed.
    pub fn record_server_ids(&mut self, assigned: &[(NodeId, ServerId)]) -> usize {
        let mut changed = 0;
        for entry in &mut self.nodes {
            let Ok(id) = entry.id() else { continue };
            if let Some((_, server_id)) = assigned.iter().find(|(n, _)| *n == id) {
                if entry.server_id != Some(server_id.get()) {
                    entry.server_id = Some(server_id.get());
                    changed += 1;
                }
            }
        }
        changed
    }

    /// Drop an entry, returning it
    pub fn remove_entry(&mut self, id: &NodeId) -> Option<NodeEntry> {
        let position = self.nodes.iter().position(|e| e.id().is_ok_and(|n| n == *id))?;
        Some(self.nodes.remove(position))
    }
}

fn default_port() -> u16 {
    ldapmesh_core::node::DEFAULT_PORT
}

fn default_admin_dn() -> String {
    "cn=config".to_string()
}
