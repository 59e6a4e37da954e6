//! LDAPMESH Directory Config Client
//!
//! Sessions against one node's `cn=config` namespace: search, add, modify
//! and delete of configuration entries. No operation spans nodes.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod entry;
pub mod error;
pub mod filter;
pub mod ldap;
pub mod memory;
pub mod session;

pub use entry::{Attributes, Entry, ModOp, Modification, Scope, normalize_dn, strip_ordering_prefix};
pub use error::{ConnError, DirectoryError, OpError, OpErrorKind};
pub use filter::Filter;
pub use ldap::LdapConnector;
pub use memory::MemoryDirectory;
pub use session::{ConfigSession, DirectoryConnector};
