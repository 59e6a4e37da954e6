//! Directory node model.

use crate::error::{CoreError, CoreResult};
use crate::id::{NodeId, ServerId};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Default LDAPS port used by the directory nodes
pub const DEFAULT_PORT: u16 = 1636;

/// Transport security mode of a node's LDAP listener
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// TLS from the first byte (`ldaps://`)
    #[default]
    Ldaps,
    /// Plain connection upgraded with StartTLS
    StartTls,
    /// No transport security
    Plain,
}

impl TlsMode {
    /// URL scheme for this mode
    #[must_use]
    pub const fn scheme(self) -> &'static str {
        match self {
            Self::Ldaps => "ldaps",
            Self::StartTls | Self::Plain => "ldap",
        }
    }

    /// Whether the connection is protected by TLS
    #[must_use]
    pub const fn requires_tls(self) -> bool {
        !matches!(self, Self::Plain)
    }
}

/// Network address of a node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddress {
    /// Canonical hostname
    pub host: NodeId,
    /// IP literal used when the hostname cannot be reached
    pub ip: Option<IpAddr>,
    /// LDAP port
    pub port: u16,
    /// Transport security
    pub tls: TlsMode,
}

impl NodeAddress {
    /// Create an address with the default port and LDAPS
    #[must_use]
    pub fn new(host: NodeId) -> Self {
        Self {
            host,
            ip: None,
            port: DEFAULT_PORT,
            tls: TlsMode::default(),
        }
    }

    /// Set the IP fallback
    #[must_use]
    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    /// Set the port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the TLS mode
    #[must_use]
    pub fn with_tls(mut self, tls: TlsMode) -> Self {
        self.tls = tls;
        self
    }

    /// LDAP URL using the hostname
    #[must_use]
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.tls.scheme(), self.host, self.port)
    }

    /// LDAP URL using the IP fallback, if any
    #[must_use]
    pub fn fallback_url(&self) -> Option<String> {
        self.ip.map(|ip| match ip {
            IpAddr::V4(v4) => format!("{}://{}:{}", self.tls.scheme(), v4, self.port),
            IpAddr::V6(v6) => format!("{}://[{}]:{}", self.tls.scheme(), v6, self.port),
        })
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

/// Bind identity and password
pub struct Credentials {
    /// Bind DN
    pub bind_dn: String,
    /// Bind password
    password: SecretString,
}

impl Credentials {
    /// Create credentials
    #[must_use]
    pub fn new(bind_dn: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            bind_dn: bind_dn.into(),
            password: SecretString::from(password.into()),
        }
    }

    /// Administrative credentials for the configuration namespace
    #[must_use]
    pub fn config_admin(password: impl Into<String>) -> Self {
        Self::new("cn=config", password)
    }

    /// Expose the password for a bind or a directive
    #[must_use]
    pub fn password(&self) -> &str {
        self.password.expose_secret()
    }
}

impl Clone for Credentials {
    fn clone(&self) -> Self {
        Self::new(self.bind_dn.clone(), self.password().to_owned())
    }
}

impl PartialEq for Credentials {
    fn eq(&self, other: &Self) -> bool {
        self.bind_dn == other.bind_dn && self.password() == other.password()
    }
}

impl Eq for Credentials {}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("bind_dn", &self.bind_dn)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// A directory server participating in replication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Network address
    pub address: NodeAddress,
    /// Administrative credentials for `cn=config`
    pub admin: Credentials,
    /// Cluster-unique server ID, assigned at first provisioning
    pub server_id: Option<ServerId>,
}

impl Node {
    /// Create a node without a server ID
    #[must_use]
    pub fn new(address: NodeAddress, admin: Credentials) -> Self {
        Self {
            address,
            admin,
            server_id: None,
        }
    }

    /// Set the server ID
    #[must_use]
    pub fn with_server_id(mut self, server_id: ServerId) -> Self {
        self.server_id = Some(server_id);
        self
    }

    /// Node identity
    #[must_use]
    pub fn id(&self) -> &NodeId {
        &self.address.host
    }

    /// Server ID, failing if none has been assigned yet
    ///
    /// # Errors
    ///
    /// Returns error if the node has no server ID
    pub fn require_server_id(&self) -> CoreResult<ServerId> {
        self.server_id.ok_or_else(|| CoreError::Validation {
            field: "server_id".to_string(),
            reason: format!("node {} has no server ID", self.id()),
        })
    }
}
