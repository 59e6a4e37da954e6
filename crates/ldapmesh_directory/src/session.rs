//! Session traits implemented by every directory backend.

use crate::entry::{Attributes, Entry, Modification, Scope};
use crate::error::{ConnError, DirectoryError};
use async_trait::async_trait;
use ldapmesh_core::{Node, NodeId};

/// Opens authenticated sessions to a node's configuration namespace
#[async_trait]
pub trait DirectoryConnector: Send + Sync {
    /// Connect and bind with the node's administrative credentials
    ///
    /// # Errors
    ///
    /// Returns [`ConnError`] if the node cannot be reached or the bind fails
    async fn connect(&self, node: &Node) -> Result<Box<dyn ConfigSession>, ConnError>;
}

/// An open session against one node
///
/// Every call is synchronous from the caller's point of view and applies to
/// this node only. A `modify` is atomic: either every change in the list is
/// applied or none is.
#[async_trait]
pub trait ConfigSession: Send {
    /// Node this session talks to
    fn node(&self) -> &NodeId;

    /// Search below `base`. A missing base yields an empty result.
    ///
    /// # Errors
    ///
    /// Returns error on connection failure or protocol rejection
    async fn search(
        &mut self,
        base: &str,
        scope: Scope,
        filter: &str,
        attrs: &[&str],
    ) -> Result<Vec<Entry>, DirectoryError>;

    /// Add an entry
    ///
    /// # Errors
    ///
    /// Returns error on connection failure or protocol rejection
    async fn add(&mut self, dn: &str, attrs: Attributes) -> Result<(), DirectoryError>;

    /// Apply an ordered list of changes to an entry
    ///
    /// # Errors
    ///
    /// Returns error on connection failure or protocol rejection
    async fn modify(&mut self, dn: &str, changes: Vec<Modification>) -> Result<(), DirectoryError>;

    /// Delete an entry
    ///
    /// # Errors
    ///
    /// Returns error on connection failure or protocol rejection
    async fn delete(&mut self, dn: &str) -> Result<(), DirectoryError>;

    /// Unbind and release the connection
    ///
    /// # Errors
    ///
    /// Returns error if the unbind cannot be sent
    async fn close(&mut self) -> Result<(), DirectoryError>;

    /// Read one entry by DN
    ///
    /// # Errors
    ///
    /// Returns error on connection failure or protocol rejection
    async fn read(&mut self, dn: &str, attrs: &[&str]) -> Result<Option<Entry>, DirectoryError> {
        let mut entries = self.search(dn, Scope::Base, "(objectClass=*)", attrs).await?;
        Ok(if entries.is_empty() {
            None
        } else {
            Some(entries.swap_remove(0))
        })
    }

    /// Values of one attribute of one entry; empty if the entry or attribute is absent
    ///
    /// # Errors
    ///
    /// Returns error on connection failure or protocol rejection
    async fn read_values(&mut self, dn: &str, attr: &str) -> Result<Vec<String>, DirectoryError> {
        Ok(self
            .read(dn, &[attr])
            .await?
            .map(|entry| entry.get(attr).to_vec())
            .unwrap_or_default())
    }

    /// Whether any entry matches
    ///
    /// # Errors
    ///
    /// Returns error on connection failure or protocol rejection
    async fn exists(&mut self, base: &str, scope: Scope, filter: &str) -> Result<bool, DirectoryError> {
        Ok(!self.search(base, scope, filter, &["1.1"]).await?.is_empty())
    }
}
