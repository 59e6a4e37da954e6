//! Core error types for LDAPMESH.

use std::fmt;

/// Core result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Core error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Invalid identifier (node ID, server ID, rid)
    InvalidId {
        /// Why the identifier was rejected
        reason: String,
    },

    /// Validation error
    Validation {
        /// Field that failed validation
        field: String,
        /// Why it failed
        reason: String,
    },
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidId { reason } => write!(f, "Invalid ID: {}", reason),
            Self::Validation { field, reason } => {
                write!(f, "Validation failed for {}: {}", field, reason)
            }
        }
    }
}

impl std::error::Error for CoreError {}
