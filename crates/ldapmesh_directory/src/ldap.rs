//! LDAP wire backend.

use crate::entry::{Attributes, Entry, ModOp, Modification, Scope};
use crate::error::{ConnError, DirectoryError, OpError};
use crate::session::{ConfigSession, DirectoryConnector};
use async_trait::async_trait;
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, LdapResult, Mod, SearchEntry, SearchResult};
use ldapmesh_core::{Node, NodeId, TlsMode};
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Result code for a missing base object
const RC_NO_SUCH_OBJECT: u32 = 32;

/// Connector that speaks LDAP to real directory nodes
#[derive(Debug, Clone)]
pub struct LdapConnector {
    connect_timeout: Duration,
    operation_timeout: Duration,
    verify_certificates: bool,
}

impl LdapConnector {
    /// Create a connector with 10s connect and 30s operation timeouts
    #[must_use]
    pub fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(30),
            verify_certificates: false,
        }
    }

    /// Set the connect timeout
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the per-operation timeout
    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Verify server certificates (nodes usually carry self-signed ones)
    #[must_use]
    pub fn with_certificate_verification(mut self, verify: bool) -> Self {
        self.verify_certificates = verify;
        self
    }

    async fn open(&self, node: &Node, url: &str) -> Result<Ldap, ConnError> {
        let settings = LdapConnSettings::new()
            .set_conn_timeout(self.connect_timeout)
            .set_starttls(node.address.tls == TlsMode::StartTls)
            .set_no_tls_verify(!self.verify_certificates);

        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, url)
            .await
            .map_err(|e| ConnError::Unreachable {
                node: node.id().clone(),
                reason: e.to_string(),
            })?;

        let target = node.id().clone();
        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                warn!(node = %target, error = %e, "LDAP connection driver stopped");
            }
        });

        let bind = tokio::time::timeout(
            self.operation_timeout,
            ldap.simple_bind(&node.admin.bind_dn, node.admin.password()),
        )
        .await
        .map_err(|_| ConnError::Timeout {
            node: node.id().clone(),
            timeout_ms: self.operation_timeout.as_millis() as u64,
        })?
        .map_err(|e| ConnError::Unreachable {
            node: node.id().clone(),
            reason: e.to_string(),
        })?;

        if bind.rc != 0 {
            return Err(ConnError::BindRejected {
                node: node.id().clone(),
                bind_dn: node.admin.bind_dn.clone(),
                reason: bind.text,
            });
        }
        Ok(ldap)
    }
}

impl Default for LdapConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DirectoryConnector for LdapConnector {
    async fn connect(&self, node: &Node) -> Result<Box<dyn ConfigSession>, ConnError> {
        let primary = node.address.url();
        let ldap = match self.open(node, &primary).await {
            Ok(ldap) => ldap,
            Err(err @ ConnError::BindRejected { .. }) => return Err(err),
            Err(err) => match node.address.fallback_url() {
                Some(fallback) => {
                    warn!(node = %node.id(), error = %err, url = %fallback, "retrying with IP address");
                    self.open(node, &fallback).await?
                }
                None => return Err(err),
            },
        };
        debug!(node = %node.id(), "bound to configuration namespace");
        Ok(Box::new(LdapSession {
            node: node.id().clone(),
            ldap,
            timeout: self.operation_timeout,
        }))
    }
}

/// Session over an LDAP connection
pub struct LdapSession {
    node: NodeId,
    ldap: Ldap,
    timeout: Duration,
}

impl LdapSession {
    async fn timed<T, F>(&self, fut: F) -> Result<T, DirectoryError>
    where
        F: Future<Output = ldap3::result::Result<T>> + Send,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| ConnError::Timeout {
                node: self.node.clone(),
                timeout_ms: self.timeout.as_millis() as u64,
            })?
            .map_err(|e| {
                ConnError::Lost {
                    node: self.node.clone(),
                    reason: e.to_string(),
                }
                .into()
            })
    }

    fn check(operation: &'static str, dn: &str, res: LdapResult) -> Result<(), DirectoryError> {
        if res.rc == 0 {
            Ok(())
        } else {
            Err(OpError::new(operation, dn, res.rc, res.text).into())
        }
    }
}

fn value_set(values: Vec<String>) -> HashSet<String> {
    values.into_iter().collect()
}

/// Wire form of a change list
///
/// `ldap3` carries values as sets, so additions go out one value per
/// modification to keep the `{n}` positions of ordered attributes in the
/// order given. A replace becomes a replace with the first value followed by
/// additions.
fn wire_mods(changes: Vec<Modification>) -> Vec<Mod<String>> {
    let mut mods = Vec::new();
    for change in changes {
        match change.op {
            ModOp::Delete => mods.push(Mod::Delete(change.attr, value_set(change.values))),
            ModOp::Add => mods.extend(
                change
                    .values
                    .into_iter()
                    .map(|v| Mod::Add(change.attr.clone(), HashSet::from([v]))),
            ),
            ModOp::Replace => {
                let mut values = change.values.into_iter();
                mods.push(Mod::Replace(change.attr.clone(), values.next().into_iter().collect()));
                mods.extend(values.map(|v| Mod::Add(change.attr.clone(), HashSet::from([v]))));
            }
        }
    }
    mods
}

#[async_trait]
impl ConfigSession for LdapSession {
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
        let scope = match scope {
            Scope::Base => ldap3::Scope::Base,
            Scope::OneLevel => ldap3::Scope::OneLevel,
            Scope::Subtree => ldap3::Scope::Subtree,
        };
        let attrs: Vec<String> = attrs.iter().map(|a| (*a).to_string()).collect();
        let mut ldap = self.ldap.clone();
        let SearchResult(entries, res) = self.timed(ldap.search(base, scope, filter, attrs)).await?;
        debug!(node = %self.node, base, filter, rc = res.rc, found = entries.len(), "search");
        if res.rc == RC_NO_SUCH_OBJECT {
            return Ok(Vec::new());
        }
        Self::check("search", base, res)?;
        Ok(entries
            .into_iter()
            .map(|raw| {
                let se = SearchEntry::construct(raw);
                let mut entry = Entry::new(se.dn);
                for (name, values) in se.attrs {
                    entry.attrs.insert(name, values);
                }
                entry
            })
            .collect())
    }

    async fn add(&mut self, dn: &str, attrs: Attributes) -> Result<(), DirectoryError> {
        let attrs: Vec<(String, HashSet<String>)> =
            attrs.into_iter().map(|(name, values)| (name, value_set(values))).collect();
        let mut ldap = self.ldap.clone();
        let res = self.timed(ldap.add(dn, attrs)).await?;
        debug!(node = %self.node, dn, rc = res.rc, "add");
        Self::check("add", dn, res)
    }

    async fn modify(&mut self, dn: &str, changes: Vec<Modification>) -> Result<(), DirectoryError> {
        let mods = wire_mods(changes);
        let mut ldap = self.ldap.clone();
        let res = self.timed(ldap.modify(dn, mods)).await?;
        debug!(node = %self.node, dn, rc = res.rc, "modify");
        Self::check("modify", dn, res)
    }

    async fn delete(&mut self, dn: &str) -> Result<(), DirectoryError> {
        let mut ldap = self.ldap.clone();
        let res = self.timed(ldap.delete(dn)).await?;
        debug!(node = %self.node, dn, rc = res.rc, "delete");
        Self::check("delete", dn, res)
    }

    async fn close(&mut self) -> Result<(), DirectoryError> {
        let mut ldap = self.ldap.clone();
        self.timed(ldap.unbind()).await
    }
}
