//! Identifiers for LDAPMESH entities.
//!
//! Node identities are canonical hostnames. Server IDs and replication IDs
//! are small positive integers that the directory engine stores as text.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Largest server ID accepted.
///
/// Server IDs double as the `rid` of every link that uses the node as a
/// provider, and a `rid` has at most three decimal digits.
pub const MAX_SERVER_ID: u16 = 999;

/// Largest replication ID accepted by the directory engine.
pub const MAX_RID: u16 = 999;

/// Node identifier - the canonical (lower-cased) hostname of a directory node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(String);

impl NodeId {
    /// Create a node ID from a hostname
    ///
    /// # Errors
    ///
    /// Returns error if the hostname is empty or contains whitespace,
    /// a scheme, a port or a path.
    pub fn new(hostname: &str) -> CoreResult<Self> {
        let host = hostname.trim().trim_end_matches('.');
        if host.is_empty() {
            return Err(CoreError::InvalidId {
                reason: "hostname cannot be empty".to_string(),
            });
        }
        if host
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '/' | ':' | '@'))
        {
            return Err(CoreError::InvalidId {
                reason: format!("'{}' is not a bare hostname", hostname),
            });
        }
        Ok(Self(host.to_ascii_lowercase()))
    }

    /// Get the hostname
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for NodeId {
    type Error = CoreError;

    fn try_from(value: String) -> CoreResult<Self> {
        Self::new(&value)
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl FromStr for NodeId {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        Self::new(s)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Server identifier - the cluster-unique `olcServerID` of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct ServerId(u16);

impl ServerId {
    /// Create a server ID
    ///
    /// # Errors
    ///
    /// Returns error if the value is zero or above [`MAX_SERVER_ID`]
    pub fn new(value: u16) -> CoreResult<Self> {
        if value == 0 {
            return Err(CoreError::InvalidId {
                reason: "server ID must be non-zero".to_string(),
            });
        }
        if value > MAX_SERVER_ID {
            return Err(CoreError::InvalidId {
                reason: format!("server ID {} exceeds {}", value, MAX_SERVER_ID),
            });
        }
        Ok(Self(value))
    }

    /// Get the raw value
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }

    /// The replication ID used by consumers that pull from this server
    #[must_use]
    pub const fn as_rid(self) -> Rid {
        Rid(self.0)
    }
}

impl TryFrom<u16> for ServerId {
    type Error = CoreError;

    fn try_from(value: u16) -> CoreResult<Self> {
        Self::new(value)
    }
}

impl From<ServerId> for u16 {
    fn from(id: ServerId) -> Self {
        id.0
    }
}

impl FromStr for ServerId {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        let value = s.trim().parse::<u16>().map_err(|e| CoreError::InvalidId {
            reason: format!("server ID '{}': {}", s, e),
        })?;
        Self::new(value)
    }
}

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Replication identifier - identifies one replication directive on its consumer
///
/// Displayed zero-padded to three digits, the form the directory engine
/// itself writes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct Rid(u16);

impl Rid {
    /// Create a replication ID
    ///
    /// # Errors
    ///
    /// Returns error if the value is zero or above [`MAX_RID`]
    pub fn new(value: u16) -> CoreResult<Self> {
        if value == 0 || value > MAX_RID {
            return Err(CoreError::InvalidId {
                reason: format!("rid {} outside 1..={}", value, MAX_RID),
            });
        }
        Ok(Self(value))
    }

    /// Get the raw value
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }
}

impl From<ServerId> for Rid {
    fn from(id: ServerId) -> Self {
        id.as_rid()
    }
}

impl TryFrom<u16> for Rid {
    type Error = CoreError;

    fn try_from(value: u16) -> CoreResult<Self> {
        Self::new(value)
    }
}

impl From<Rid> for u16 {
    fn from(rid: Rid) -> Self {
        rid.0
    }
}

impl FromStr for Rid {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        let value = s.trim().parse::<u16>().map_err(|e| CoreError::InvalidId {
            reason: format!("rid '{}': {}", s, e),
        })?;
        Self::new(value)
    }
}

impl std::fmt::Display for Rid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:03}", self.0)
    }
}

/// Run identifier - identifies a single convergence run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl RunId {
    /// Create a new random RunId
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get as UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "run_{}", self.0)
    }
}
