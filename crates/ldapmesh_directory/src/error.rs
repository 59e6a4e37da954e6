//! Directory client errors.

use ldapmesh_core::NodeId;
use serde::{Deserialize, Serialize};

/// Connection-level failure: the node cannot be used for the rest of the run
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnError {
    /// Node could not be reached on any address
    #[error("Node {node} unreachable: {reason}")]
    Unreachable {
        /// Target node
        node: NodeId,
        /// Transport message
        reason: String,
    },

    /// Bind was refused
    #[error("Bind as {bind_dn} rejected by {node}: {reason}")]
    BindRejected {
        /// Target node
        node: NodeId,
        /// Bind DN used
        bind_dn: String,
        /// Server diagnostic
        reason: String,
    },

    /// Connect or operation timeout
    #[error("Timeout talking to {node} after {timeout_ms}ms")]
    Timeout {
        /// Target node
        node: NodeId,
        /// Timeout that expired
        timeout_ms: u64,
    },

    /// Established connection dropped mid-session
    #[error("Connection to {node} lost: {reason}")]
    Lost {
        /// Target node
        node: NodeId,
        /// Transport message
        reason: String,
    },
}

impl ConnError {
    /// Node the failure refers to
    #[must_use]
    pub fn node(&self) -> &NodeId {
        match self {
            Self::Unreachable { node, .. }
            | Self::BindRejected { node, .. }
            | Self::Timeout { node, .. }
            | Self::Lost { node, .. } => node,
        }
    }
}

/// Classified protocol result code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpErrorKind {
    /// entryAlreadyExists (68)
    AlreadyExists,
    /// noSuchObject (32)
    NoSuchObject,
    /// noSuchAttribute (16)
    NoSuchAttribute,
    /// attributeOrValueExists (20)
    AttributeOrValueExists,
    /// constraintViolation (19)
    ConstraintViolation,
    /// unwillingToPerform (53)
    UnwillingToPerform,
    /// Anything else
    Other,
}

impl OpErrorKind {
    /// Classify an LDAP result code
    #[must_use]
    pub const fn from_result_code(rc: u32) -> Self {
        match rc {
            16 => Self::NoSuchAttribute,
            19 => Self::ConstraintViolation,
            20 => Self::AttributeOrValueExists,
            32 => Self::NoSuchObject,
            53 => Self::UnwillingToPerform,
            68 => Self::AlreadyExists,
            _ => Self::Other,
        }
    }
}

/// Protocol-level rejection of a single operation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation} {dn} rejected ({kind:?}, rc={code}): {message}")]
pub struct OpError {
    /// Operation name (search, add, modify, delete)
    pub operation: &'static str,
    /// Target DN
    pub dn: String,
    /// Classified result code
    pub kind: OpErrorKind,
    /// Raw result code
    pub code: u32,
    /// Server diagnostic text
    pub message: String,
}

impl OpError {
    /// Create an operation error from a raw result code
    #[must_use]
    pub fn new(operation: &'static str, dn: &str, code: u32, message: impl Into<String>) -> Self {
        Self {
            operation,
            dn: dn.to_string(),
            kind: OpErrorKind::from_result_code(code),
            code,
            message: message.into(),
        }
    }
}

/// Any failure of a session call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    /// Connection-level failure
    #[error(transparent)]
    Conn(#[from] ConnError),

    /// Protocol rejection
    #[error(transparent)]
    Op(#[from] OpError),
}

impl DirectoryError {
    /// Whether this failure makes the node unusable for the rest of the run
    #[must_use]
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Conn(_))
    }

    /// Protocol rejection kind, if any
    #[must_use]
    pub fn op_kind(&self) -> Option<OpErrorKind> {
        match self {
            Self::Op(op) => Some(op.kind),
            Self::Conn(_) => None,
        }
    }
}
