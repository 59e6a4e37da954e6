//! LDAPMESH Core Types
//!
//! Pure types shared by the directory client and the topology manager.
//! Nothing in this crate performs I/O.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod id;
pub mod node;

// Re-exports
pub use error::{CoreError, CoreResult};
pub use id::{NodeId, Rid, RunId, ServerId};
pub use node::{Credentials, Node, NodeAddress, TlsMode};
