//! In-process directory backend.
//!
//! Each simulated node owns a configuration tree seeded like a freshly
//! installed server. Nodes can be made unreachable, made to time out, or made
//! to reject writes to a DN, and every successful write is counted so callers
//! can assert that a converged cluster is left untouched.

use crate::entry::{Attributes, Entry, ModOp, Modification, Scope, normalize_dn, strip_ordering_prefix};
use crate::error::{ConnError, DirectoryError, OpError};
use crate::filter::Filter;
use crate::session::{ConfigSession, DirectoryConnector};
use async_trait::async_trait;
use indexmap::IndexMap;
use ldapmesh_core::{Node, NodeId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Attributes whose values the engine keeps in `{n}`-prefixed order
const ORDERED_ATTRS: &[&str] = &["olcSyncrepl", "olcModuleLoad", "olcLimits", "olcAccess"];

/// Primary database DN on a fresh node
pub const SEED_PRIMARY_DB: &str = "olcDatabase={1}mdb,cn=config";

/// Primary database suffix on a fresh node
pub const SEED_SUFFIX: &str = "o=gluu";

/// Health of a simulated node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeHealth {
    /// Answers every call
    Running,
    /// Refuses connections and drops open sessions
    Unreachable,
    /// Accepts connections but never answers
    Hanging,
}

/// One recorded write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    /// Operation name
    pub operation: &'static str,
    /// Target DN
    pub dn: String,
}

#[derive(Debug, Clone)]
struct NodeTree {
    entries: IndexMap<String, Entry>,
    health: NodeHealth,
    password: Option<String>,
    rejected: HashSet<String>,
    writes: Vec<WriteRecord>,
}

impl NodeTree {
    fn fresh() -> Self {
        let mut entries = IndexMap::new();
        let seed = [
            Entry::new("cn=config").with_attr("objectClass", vec!["olcGlobal".into()]),
            Entry::new("cn=module{0},cn=config")
                .with_attr("objectClass", vec!["olcModuleList".into()])
                .with_attr("cn", vec!["module{0}".into()])
                .with_attr("olcModulePath", vec!["/opt/symas/lib64/openldap".into()])
                .with_attr("olcModuleLoad", vec!["{0}back_mdb.la".into()]),
            Entry::new("olcDatabase={0}config,cn=config")
                .with_attr("objectClass", vec!["olcDatabaseConfig".into()])
                .with_attr("olcDatabase", vec!["{0}config".into()]),
            Entry::new(SEED_PRIMARY_DB)
                .with_attr(
                    "objectClass",
                    vec!["olcDatabaseConfig".into(), "olcMdbConfig".into()],
                )
                .with_attr("olcDatabase", vec!["{1}mdb".into()])
                .with_attr("olcSuffix", vec![SEED_SUFFIX.into()])
                .with_attr("olcDbDirectory", vec!["/opt/gluu/data/main_db".into()])
                .with_attr("olcDbIndex", vec!["objectClass eq".into()]),
        ];
        for entry in seed {
            entries.insert(normalize_dn(&entry.dn), entry);
        }
        Self {
            entries,
            health: NodeHealth::Running,
            password: None,
            rejected: HashSet::new(),
            writes: Vec::new(),
        }
    }
}

/// Shared set of simulated nodes
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    nodes: Arc<RwLock<HashMap<NodeId, NodeTree>>>,
}

impl MemoryDirectory {
    /// Create an empty directory
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a directory with a fresh tree for each node
    pub async fn with_nodes<'a>(ids: impl IntoIterator<Item = &'a NodeId>) -> Self {
        let dir = Self::new();
        for id in ids {
            dir.add_node(id).await;
        }
        dir
    }

    /// Add (or reset) a node with a fresh configuration tree
    pub async fn add_node(&self, id: &NodeId) {
        self.nodes.write().await.insert(id.clone(), NodeTree::fresh());
    }

    /// Set a node's health
    pub async fn set_health(&self, id: &NodeId, health: NodeHealth) {
        if let Some(tree) = self.nodes.write().await.get_mut(id) {
            tree.health = health;
        }
    }

    /// Require a specific bind password for a node
    pub async fn set_password(&self, id: &NodeId, password: &str) {
        if let Some(tree) = self.nodes.write().await.get_mut(id) {
            tree.password = Some(password.to_string());
        }
    }

    /// Reject every write that targets `dn` on a node
    pub async fn reject_writes(&self, id: &NodeId, dn: &str) {
        if let Some(tree) = self.nodes.write().await.get_mut(id) {
            tree.rejected.insert(normalize_dn(dn));
        }
    }

    /// Number of successful writes on a node
    pub async fn write_count(&self, id: &NodeId) -> usize {
        self.nodes.read().await.get(id).map_or(0, |t| t.writes.len())
    }

    /// Number of successful writes across all nodes
    pub async fn total_writes(&self) -> usize {
        self.nodes.read().await.values().map(|t| t.writes.len()).sum()
    }

    /// Recorded writes on a node
    pub async fn writes(&self, id: &NodeId) -> Vec<WriteRecord> {
        self.nodes
            .read()
            .await
            .get(id)
            .map(|t| t.writes.clone())
            .unwrap_or_default()
    }

    /// Snapshot of one entry
    pub async fn entry(&self, id: &NodeId, dn: &str) -> Option<Entry> {
        self.nodes
            .read()
            .await
            .get(id)
            .and_then(|t| t.entries.get(&normalize_dn(dn)).cloned())
    }

    /// Values of one attribute, with ordering prefixes as stored
    pub async fn values(&self, id: &NodeId, dn: &str, attr: &str) -> Vec<String> {
        self.entry(id, dn)
            .await
            .map(|e| e.get(attr).to_vec())
            .unwrap_or_default()
    }

    /// Overwrite an attribute without recording a write (simulates manual edits)
    pub async fn put_values(&self, id: &NodeId, dn: &str, attr: &str, values: Vec<String>) {
        if let Some(entry) = self
            .nodes
            .write()
            .await
            .get_mut(id)
            .and_then(|t| t.entries.get_mut(&normalize_dn(dn)))
        {
            let values = if is_ordered(attr) { renumber(values) } else { values };
            entry.set(attr, values);
        }
    }

    async fn check_health(&self, id: &NodeId) -> Result<(), ConnError> {
        // The read guard must be gone before a hanging node stalls.
        let health = self.nodes.read().await.get(id).map(|t| t.health);
        match health {
            Some(NodeHealth::Running) => Ok(()),
            Some(NodeHealth::Hanging) => std::future::pending().await,
            Some(NodeHealth::Unreachable) | None => Err(ConnError::Unreachable {
                node: id.clone(),
                reason: "no route to host".to_string(),
            }),
        }
    }
}

#[async_trait]
impl DirectoryConnector for MemoryDirectory {
    async fn connect(&self, node: &Node) -> Result<Box<dyn ConfigSession>, ConnError> {
        let id = node.id().clone();
        self.check_health(&id).await?;
        let expected = self.nodes.read().await.get(&id).and_then(|t| t.password.clone());
        if let Some(expected) = expected {
            if expected != node.admin.password() {
                return Err(ConnError::BindRejected {
                    node: id,
                    bind_dn: node.admin.bind_dn.clone(),
                    reason: "invalidCredentials".to_string(),
                });
            }
        }
        Ok(Box::new(MemorySession {
            node: id,
            dir: self.clone(),
            open: true,
        }))
    }
}

/// Session against one simulated node
pub struct MemorySession {
    node: NodeId,
    dir: MemoryDirectory,
    open: bool,
}

impl MemorySession {
    async fn ensure_usable(&self) -> Result<(), DirectoryError> {
        if !self.open {
            return Err(ConnError::Lost {
                node: self.node.clone(),
                reason: "session closed".to_string(),
            }
            .into());
        }
        self.dir.check_health(&self.node).await?;
        Ok(())
    }

    async fn write<F>(&mut self, operation: &'static str, dn: &str, apply: F) -> Result<(), DirectoryError>
    where
        F: FnOnce(&mut IndexMap<String, Entry>, &str) -> Result<(), OpError> + Send,
    {
        self.ensure_usable().await?;
        let mut nodes = self.dir.nodes.write().await;
        let tree = nodes.get_mut(&self.node).ok_or_else(|| ConnError::Lost {
            node: self.node.clone(),
            reason: "node removed".to_string(),
        })?;
        let key = normalize_dn(dn);
        if tree.rejected.contains(&key) {
            return Err(OpError::new(operation, dn, 53, "write rejected by server policy").into());
        }
        // Work on a copy so a failing change leaves the tree untouched.
        let mut staged = tree.entries.clone();
        apply(&mut staged, &key)?;
        tree.entries = staged;
        tree.writes.push(WriteRecord {
            operation,
            dn: dn.to_string(),
        });
        tracing::debug!(node = %self.node, operation, dn, "memory directory write");
        Ok(())
    }
}

#[async_trait]
impl ConfigSession for MemorySession {
    fn node(&self) -> &NodeId {
        &self.node
    }

    async fn search(
        &mut self,
        base: &str,
        scope: Scope,
        filter: &str,
        attrs: &[&str],
    ) -> Result<Vec<Entry>, DirectoryError> {
        self.ensure_usable().await?;
        let filter = Filter::parse(filter).map_err(|e| OpError::new("search", base, 87, e))?;
        let base_key = normalize_dn(base);
        let nodes = self.dir.nodes.read().await;
        let Some(tree) = nodes.get(&self.node) else {
            return Ok(Vec::new());
        };
        if !tree.entries.contains_key(&base_key) {
            return Ok(Vec::new());
        }
        let suffix = format!(",{}", base_key);
        Ok(tree
            .entries
            .iter()
            .filter(|(key, _)| match scope {
                Scope::Base => **key == base_key,
                Scope::OneLevel => parent(key) == Some(base_key.as_str()),
                Scope::Subtree => **key == base_key || key.ends_with(&suffix),
            })
            .filter(|(_, entry)| filter.matches(entry))
            .map(|(_, entry)| project(entry, attrs))
            .collect())
    }

    async fn add(&mut self, dn: &str, attrs: Attributes) -> Result<(), DirectoryError> {
        let dn_owned = dn.to_string();
        self.write("add", dn, move |entries, key| {
            if entries.contains_key(key) {
                return Err(OpError::new("add", &dn_owned, 68, "Already exists"));
            }
            if let Some(parent_key) = parent(key) {
                if !entries.contains_key(parent_key) {
                    return Err(OpError::new("add", &dn_owned, 32, "parent does not exist"));
                }
            }
            let mut entry = Entry::new(dn_owned.clone());
            for (name, values) in attrs {
                let values = if is_ordered(&name) { renumber(values) } else { values };
                entry.set(&name, values);
            }
            entries.insert(key.to_string(), entry);
            Ok(())
        })
        .await
    }

    async fn modify(&mut self, dn: &str, changes: Vec<Modification>) -> Result<(), DirectoryError> {
        let dn_owned = dn.to_string();
        self.write("modify", dn, move |entries, key| {
            let entry = entries
                .get_mut(key)
                .ok_or_else(|| OpError::new("modify", &dn_owned, 32, "No such object"))?;
            for change in changes {
                apply_change(entry, &change, &dn_owned)?;
            }
            Ok(())
        })
        .await
    }

    async fn delete(&mut self, dn: &str) -> Result<(), DirectoryError> {
        let dn_owned = dn.to_string();
        self.write("delete", dn, move |entries, key| {
            if !entries.contains_key(key) {
                return Err(OpError::new("delete", &dn_owned, 32, "No such object"));
            }
            if entries.keys().any(|k| parent(k) == Some(key)) {
                return Err(OpError::new("delete", &dn_owned, 66, "subordinate objects must be deleted first"));
            }
            entries.shift_remove(key);
            Ok(())
        })
        .await
    }

    async fn close(&mut self) -> Result<(), DirectoryError> {
        self.open = false;
        Ok(())
    }
}

fn apply_change(entry: &mut Entry, change: &Modification, dn: &str) -> Result<(), OpError> {
    let ordered = is_ordered(&change.attr);
    let current: Vec<String> = entry.get(&change.attr).to_vec();
    let next = match change.op {
        ModOp::Add => {
            let mut next = current;
            for value in &change.values {
                let bare = strip_ordering_prefix(value);
                if next.iter().any(|v| strip_ordering_prefix(v) == bare) {
                    return Err(OpError::new("modify", dn, 20, format!("{}: value #0 provided more than once", change.attr)));
                }
                next.push(bare.to_string());
            }
            next
        }
        ModOp::Replace => change.values.clone(),
        ModOp::Delete if change.values.is_empty() => {
            if current.is_empty() {
                return Err(OpError::new("modify", dn, 16, format!("{}: no such attribute", change.attr)));
            }
            Vec::new()
        }
        ModOp::Delete => {
            let mut next = current;
            for value in &change.values {
                let bare = strip_ordering_prefix(value);
                let pos = next
                    .iter()
                    .position(|v| v == value || strip_ordering_prefix(v) == bare)
                    .ok_or_else(|| OpError::new("modify", dn, 16, format!("{}: no such value", change.attr)))?;
                next.remove(pos);
            }
            next
        }
    };
    entry.set(&change.attr, if ordered { renumber(next) } else { next });
    Ok(())
}

fn is_ordered(attr: &str) -> bool {
    ORDERED_ATTRS.iter().any(|a| a.eq_ignore_ascii_case(attr))
}

fn renumber(values: Vec<String>) -> Vec<String> {
    values
        .iter()
        .enumerate()
        .map(|(i, v)| format!("{{{}}}{}", i, strip_ordering_prefix(v)))
        .collect()
}

fn parent(key: &str) -> Option<&str> {
    key.split_once(',').map(|(_, rest)| rest)
}

fn project(entry: &Entry, attrs: &[&str]) -> Entry {
    if attrs.is_empty() || attrs.contains(&"*") {
        return entry.clone();
    }
    let mut out = Entry::new(entry.dn.clone());
    for (name, values) in &entry.attrs {
        if attrs.iter().any(|a| a.eq_ignore_ascii_case(name)) {
            out.attrs.insert(name.clone(), values.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ldapmesh_core::{Credentials, NodeAddress};

    fn node(host: &str) -> Node {
        Node::new(
            NodeAddress::new(NodeId::new(host).unwrap()),
            Credentials::config_admin("secret"),
        )
    }

    async fn session(dir: &MemoryDirectory, host: &str) -> Box<dyn ConfigSession> {
        dir.connect(&node(host)).await.unwrap()
    }

    #[tokio::test]
    async fn test_connect_unknown_node_unreachable() {
        let dir = MemoryDirectory::new();
        let err = dir.connect(&node("ldap1")).await.err().unwrap();
        assert!(matches!(err, ConnError::Unreachable { .. }));
    }

    #[tokio::test]
    async fn test_connect_bind_rejected() {
        let id = NodeId::new("ldap1").unwrap();
        let dir = MemoryDirectory::with_nodes([&id]).await;
        dir.set_password(&id, "other").await;
        let err = dir.connect(&node("ldap1")).await.err().unwrap();
        assert!(matches!(err, ConnError::BindRejected { .. }));
    }

    #[tokio::test]
    async fn test_fresh_tree_search() {
        let id = NodeId::new("ldap1").unwrap();
        let dir = MemoryDirectory::with_nodes([&id]).await;
        let mut s = session(&dir, "ldap1").await;

        let dbs = s
            .search("cn=config", Scope::OneLevel, "(objectClass=olcMdbConfig)", &["olcSuffix"])
            .await
            .unwrap();
        assert_eq!(dbs.len(), 1);
        assert_eq!(dbs[0].first("olcSuffix"), Some(SEED_SUFFIX));
        assert!(dbs[0].get("olcDbIndex").is_empty());

        let missing = s
            .search("cn=nothing,cn=config", Scope::Base, "(objectClass=*)", &[])
            .await
            .unwrap();
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn test_ordered_values_renumbered() {
        let id = NodeId::new("ldap1").unwrap();
        let dir = MemoryDirectory::with_nodes([&id]).await;
        let mut s = session(&dir, "ldap1").await;

        s.modify(
            SEED_PRIMARY_DB,
            vec![Modification::add("olcSyncrepl", vec!["rid=001 a".into(), "rid=002 b".into()])],
        )
        .await
        .unwrap();
        assert_eq!(
            dir.values(&id, SEED_PRIMARY_DB, "olcSyncRepl").await,
            vec!["{0}rid=001 a".to_string(), "{1}rid=002 b".to_string()]
        );

        s.modify(SEED_PRIMARY_DB, vec![Modification::delete("olcSyncrepl", vec!["{0}rid=001 a".into()])])
            .await
            .unwrap();
        assert_eq!(
            dir.values(&id, SEED_PRIMARY_DB, "olcSyncrepl").await,
            vec!["{0}rid=002 b".to_string()]
        );
        assert_eq!(dir.write_count(&id).await, 2);
    }

    #[tokio::test]
    async fn test_modify_is_atomic() {
        let id = NodeId::new("ldap1").unwrap();
        let dir = MemoryDirectory::with_nodes([&id]).await;
        let mut s = session(&dir, "ldap1").await;

        let err = s
            .modify(
                SEED_PRIMARY_DB,
                vec![
                    Modification::add("olcMirrorMode", vec!["TRUE".into()]),
                    Modification::delete("olcSyncrepl", vec!["rid=009 x".into()]),
                ],
            )
            .await
            .unwrap_err();
        assert_eq!(err.op_kind(), Some(crate::OpErrorKind::NoSuchAttribute));
        assert!(dir.values(&id, SEED_PRIMARY_DB, "olcMirrorMode").await.is_empty());
        assert_eq!(dir.write_count(&id).await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_value_rejected() {
        let id = NodeId::new("ldap1").unwrap();
        let dir = MemoryDirectory::with_nodes([&id]).await;
        let mut s = session(&dir, "ldap1").await;

        let err = s
            .modify(
                "cn=module{0},cn=config",
                vec![Modification::add("olcModuleLoad", vec!["back_mdb.la".into()])],
            )
            .await
            .unwrap_err();
        assert_eq!(err.op_kind(), Some(crate::OpErrorKind::AttributeOrValueExists));
    }

    #[tokio::test]
    async fn test_add_entry_rules() {
        let id = NodeId::new("ldap1").unwrap();
        let dir = MemoryDirectory::with_nodes([&id]).await;
        let mut s = session(&dir, "ldap1").await;

        let attrs = vec![("objectClass".to_string(), vec!["olcOverlayConfig".to_string()])];
        s.add("olcOverlay=syncprov,olcDatabase={1}mdb,cn=config", attrs.clone())
            .await
            .unwrap();

        let err = s
            .add("olcOverlay=syncprov,olcDatabase={1}mdb,cn=config", attrs.clone())
            .await
            .unwrap_err();
        assert_eq!(err.op_kind(), Some(crate::OpErrorKind::AlreadyExists));

        let err = s
            .add("olcOverlay=syncprov,olcDatabase={7}mdb,cn=config", attrs)
            .await
            .unwrap_err();
        assert_eq!(err.op_kind(), Some(crate::OpErrorKind::NoSuchObject));

        let err = s.delete(SEED_PRIMARY_DB).await.unwrap_err();
        assert_eq!(err.op_kind(), Some(crate::OpErrorKind::Other));
    }

    #[tokio::test]
    async fn test_rejected_writes_and_health() {
        let id = NodeId::new("ldap1").unwrap();
        let dir = MemoryDirectory::with_nodes([&id]).await;
        dir.reject_writes(&id, "cn=config").await;
        let mut s = session(&dir, "ldap1").await;

        let err = s
            .modify("cn=config", vec![Modification::add("olcServerID", vec!["1".into()])])
            .await
            .unwrap_err();
        assert_eq!(err.op_kind(), Some(crate::OpErrorKind::UnwillingToPerform));

        dir.set_health(&id, NodeHealth::Hanging).await;
        let stalled = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            s.read_values("cn=config", "olcServerID"),
        )
        .await;
        assert!(stalled.is_err());

        // A hanging node must not block the others
        let other = NodeId::new("ldap2").unwrap();
        dir.add_node(&other).await;
        let mut s2 = session(&dir, "ldap2").await;
        assert!(s2.exists("cn=config", Scope::Base, "(objectClass=*)").await.unwrap());

        dir.set_health(&id, NodeHealth::Unreachable).await;
        let err = s.read_values("cn=config", "olcServerID").await.unwrap_err();
        assert!(matches!(err, DirectoryError::Conn(ConnError::Unreachable { .. })));
    }

    #[tokio::test]
    async fn test_closed_session_unusable() {
        let id = NodeId::new("ldap1").unwrap();
        let dir = MemoryDirectory::with_nodes([&id]).await;
        let mut s = session(&dir, "ldap1").await;
        s.close().await.unwrap();
        assert!(s.exists("cn=config", Scope::Base, "(objectClass=*)").await.is_err());
    }
}
