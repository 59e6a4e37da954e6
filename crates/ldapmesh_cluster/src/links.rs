//! Replication link management.
//!
//! A link is one value of the consumer's `olcSyncrepl` attribute on the
//! primary database. The engine has no in-place update for a single value,
//! so replacing a link is a delete of every value carrying its rid followed
//! by an add. Mirror mode is on exactly when the consumer has at least one
//! link: it is switched on after links are written and off after the last
//! one is deleted.

use crate::directive::{DirectiveError, ParsedDirective, ProviderUrl, SyncDirective, parse_directive};
use crate::report::LinkChange;
use crate::resolver::NameResolver;
use crate::settings::ReplicationSettings;
use ldapmesh_core::{Node, NodeAddress, Rid};
use ldapmesh_directory::{ConfigSession, DirectoryError, Modification};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

const SYNCREPL: &str = "olcSyncrepl";
const MIRROR_MODE: &str = "olcMirrorMode";

/// Link management errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    /// A directory call failed
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    /// The desired links would break a topology invariant
    #[error("Invariant violation: {reason}")]
    InvariantViolation {
        /// What would break
        reason: String,
    },

    /// A stored directive cannot be parsed
    #[error("Malformed directive at position {position}: {source}")]
    MalformedDirective {
        /// Index of the value in the attribute
        position: usize,
        /// Parse failure
        #[source]
        source: DirectiveError,
    },
}

impl LinkError {
    /// Whether the node could not be talked to at all
    #[must_use]
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Directory(e) if e.is_connectivity())
    }
}

/// A link as stored on a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationLink {
    /// Replica ID
    pub rid: Rid,
    /// Provider as written in the directive
    pub provider: ProviderUrl,
    directive: ParsedDirective,
}

impl ReplicationLink {
    /// Value exactly as stored, ordering prefix included
    #[must_use]
    pub fn stored(&self) -> &str {
        &self.directive.stored
    }

    /// Value without its ordering prefix
    #[must_use]
    pub fn body(&self) -> &str {
        &self.directive.body
    }

    /// Parsed directive
    #[must_use]
    pub fn directive(&self) -> &ParsedDirective {
        &self.directive
    }
}

/// A link a consumer should have
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredLink {
    /// Replica ID
    pub rid: Rid,
    /// Provider node address
    pub provider: NodeAddress,
    directive: SyncDirective,
}

impl DesiredLink {
    /// Link pulling from `provider` under `rid`
    #[must_use]
    pub fn new(rid: Rid, provider: NodeAddress, settings: &ReplicationSettings) -> Self {
        let directive = SyncDirective::for_provider(rid, &provider, settings);
        Self {
            rid,
            provider,
            directive,
        }
    }

    /// Link pulling from a node, with the node's server ID as rid
    ///
    /// # Errors
    ///
    /// Returns error if the provider has no server ID
    pub fn from_provider(provider: &Node, settings: &ReplicationSettings) -> Result<Self, LinkError> {
        let server_id = provider
            .require_server_id()
            .map_err(|e| LinkError::InvariantViolation { reason: e.to_string() })?;
        Ok(Self::new(Rid::from(server_id), provider.address.clone(), settings))
    }

    /// Directive to be written
    #[must_use]
    pub fn directive(&self) -> &SyncDirective {
        &self.directive
    }

    fn change(&self) -> LinkChange {
        LinkChange::new(self.rid, self.directive.provider.to_string())
    }
}

/// What a link operation did on one consumer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkReport {
    /// Links written
    pub added: Vec<LinkChange>,
    /// Links deleted
    pub removed: Vec<LinkChange>,
    /// Mirror mode after the operation
    pub mirror_mode: bool,
    /// Modify operations issued
    pub writes: usize,
}

impl LinkReport {
    /// Whether anything was written
    #[must_use]
    pub fn changed(&self) -> bool {
        self.writes > 0
    }
}

struct StoredLinks {
    links: Vec<ReplicationLink>,
    malformed: Vec<(usize, String, DirectiveError)>,
}

/// Reads and rewrites replication links on consumers
#[derive(Clone)]
pub struct LinkManager {
    settings: ReplicationSettings,
    resolver: Arc<dyn NameResolver>,
}

impl LinkManager {
    /// Create a link manager
    #[must_use]
    pub fn new(settings: ReplicationSettings, resolver: Arc<dyn NameResolver>) -> Self {
        Self { settings, resolver }
    }

    /// Settings in use
    #[must_use]
    pub fn settings(&self) -> &ReplicationSettings {
        &self.settings
    }

    /// Desired link from a provider node
    ///
    /// # Errors
    ///
    /// Returns error if the provider has no server ID
    pub fn desired_link(&self, provider: &Node) -> Result<DesiredLink, LinkError> {
        DesiredLink::from_provider(provider, &self.settings)
    }

    /// Links stored on a consumer, in attribute order
    ///
    /// # Errors
    ///
    /// Returns error if the node cannot be read or a stored value is malformed
    pub async fn list_links(&self, session: &mut dyn ConfigSession) -> Result<Vec<ReplicationLink>, LinkError> {
        let stored = self.read(session).await?;
        if let Some((position, _, source)) = stored.malformed.into_iter().next() {
            return Err(LinkError::MalformedDirective { position, source });
        }
        Ok(stored.links)
    }

    /// Whether mirror mode is on
    ///
    /// # Errors
    ///
    /// Returns error if the node cannot be read
    pub async fn mirror_mode(&self, session: &mut dyn ConfigSession) -> Result<bool, LinkError> {
        let values = session
            .read_values(&self.settings.primary_db_dn, MIRROR_MODE)
            .await?;
        Ok(values.iter().any(|v| v.eq_ignore_ascii_case("TRUE")))
    }

    /// Switch mirror mode; returns whether anything was written
    ///
    /// # Errors
    ///
    /// Returns error if the node cannot be read or rejects the change
    pub async fn set_mirror_mode(&self, session: &mut dyn ConfigSession, on: bool) -> Result<bool, LinkError> {
        let dn = &self.settings.primary_db_dn;
        let values = session.read_values(dn, MIRROR_MODE).await?;
        let current = values.iter().any(|v| v.eq_ignore_ascii_case("TRUE"));
        if on {
            if current && values.len() == 1 {
                return Ok(false);
            }
            session
                .modify(dn, vec![Modification::replace(MIRROR_MODE, vec!["TRUE".to_string()])])
                .await?;
        } else {
            if values.is_empty() {
                return Ok(false);
            }
            session
                .modify(dn, vec![Modification::delete(MIRROR_MODE, Vec::new())])
                .await?;
        }
        info!(node = %session.node(), mirror_mode = on, "mirror mode switched");
        Ok(true)
    }

    /// Write one link, replacing any directive with the same rid
    ///
    /// Nothing is written when the stored directive is already identical.
    ///
    /// # Errors
    ///
    /// Returns error if the link points at the consumer itself or the node
    /// rejects a change
    pub async fn add_link(
        &self,
        session: &mut dyn ConfigSession,
        desired: &DesiredLink,
    ) -> Result<LinkReport, LinkError> {
        self.check_not_self(session, desired)?;
        let stored = self.read(session).await?;
        let rendered = desired.directive.render();
        let same_rid: Vec<&ReplicationLink> =
            stored.links.iter().filter(|l| l.rid == desired.rid).collect();

        let mut report = LinkReport::default();
        let identical = same_rid.len() == 1 && same_rid[0].body() == rendered;
        if !identical {
            let mut change = desired.change();
            if !same_rid.is_empty() {
                let values: Vec<String> = same_rid.iter().map(|l| l.stored().to_string()).collect();
                self.delete_values(session, values).await?;
                report.writes += 1;
                change = change.replacing();
            }
            session
                .modify(
                    &self.settings.primary_db_dn,
                    vec![Modification::add(SYNCREPL, vec![rendered])],
                )
                .await?;
            report.writes += 1;
            info!(node = %session.node(), rid = %desired.rid, provider = %desired.provider, replaced = change.replaced, "link written");
            report.added.push(change);
        } else {
            debug!(node = %session.node(), rid = %desired.rid, "link already present");
        }

        if self.set_mirror_mode(session, true).await? {
            report.writes += 1;
        }
        report.mirror_mode = true;
        Ok(report)
    }

    /// Remove the first link whose provider designates `provider`
    ///
    /// No-op when no link matches.
    ///
    /// # Errors
    ///
    /// Returns error if the node cannot be read or rejects the change
    pub async fn remove_link(
        &self,
        session: &mut dyn ConfigSession,
        provider: &NodeAddress,
    ) -> Result<LinkReport, LinkError> {
        let stored = self.read(session).await?;
        let matching: Vec<&ReplicationLink> = stored
            .links
            .iter()
            .filter(|l| l.provider.designates(provider, self.resolver.as_ref()))
            .collect();
        let Some(target) = matching.first() else {
            debug!(node = %session.node(), provider = %provider, "no link to remove");
            return Ok(LinkReport {
                mirror_mode: self.mirror_mode(session).await?,
                ..LinkReport::default()
            });
        };
        if matching.len() > 1 {
            warn!(
                node = %session.node(),
                provider = %provider,
                count = matching.len(),
                "several links designate one provider, removing the first"
            );
        }
        let removed = LinkChange::new(target.rid, target.provider.to_string());
        self.delete_values(session, vec![target.stored().to_string()]).await?;
        info!(node = %session.node(), rid = %target.rid, provider = %provider, "link removed");
        let remaining = stored.links.len() + stored.malformed.len() - 1;
        self.finish_removal(session, vec![removed], remaining).await
    }

    /// Remove every link carrying `rid`
    ///
    /// # Errors
    ///
    /// Returns error if the node cannot be read or rejects the change
    pub async fn remove_link_by_rid(&self, session: &mut dyn ConfigSession, rid: Rid) -> Result<LinkReport, LinkError> {
        let stored = self.read(session).await?;
        let (targets, kept): (Vec<&ReplicationLink>, Vec<&ReplicationLink>) =
            stored.links.iter().partition(|l| l.rid == rid);
        if targets.is_empty() {
            debug!(node = %session.node(), rid = %rid, "no link to remove");
            return Ok(LinkReport {
                mirror_mode: self.mirror_mode(session).await?,
                ..LinkReport::default()
            });
        }
        let removed = targets
            .iter()
            .map(|l| LinkChange::new(l.rid, l.provider.to_string()))
            .collect();
        self.delete_values(session, targets.iter().map(|l| l.stored().to_string()).collect())
            .await?;
        info!(node = %session.node(), rid = %rid, "link removed");
        let remaining = kept.len() + stored.malformed.len();
        self.finish_removal(session, removed, remaining).await
    }

    /// Make the consumer's links exactly `desired`
    ///
    /// Links whose rid is not desired are deleted, drifted ones replaced and
    /// missing ones added; mirror mode follows. Unparseable values are
    /// deleted since no desired link can match them.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::InvariantViolation`] without writing if two
    /// desired links share a rid or one points at the consumer; otherwise
    /// returns error if the node rejects a change
    pub async fn converge(
        &self,
        session: &mut dyn ConfigSession,
        desired: &[DesiredLink],
    ) -> Result<LinkReport, LinkError> {
        let mut seen = HashSet::new();
        for link in desired {
            self.check_not_self(session, link)?;
            if !seen.insert(link.rid) {
                return Err(LinkError::InvariantViolation {
                    reason: format!("rid {} assigned to more than one provider", link.rid),
                });
            }
        }

        let stored = self.read(session).await?;
        let mut report = LinkReport::default();
        let mut to_delete: Vec<String> = Vec::new();
        let mut to_add: Vec<String> = Vec::new();
        let mut kept: HashSet<Rid> = HashSet::new();

        for (position, value, error) in &stored.malformed {
            warn!(node = %session.node(), position, error = %error, "deleting unparseable directive");
            to_delete.push(value.clone());
        }

        for link in &stored.links {
            match desired.iter().find(|d| d.rid == link.rid) {
                None => {
                    info!(node = %session.node(), rid = %link.rid, provider = %link.provider, "removing undesired link");
                    report
                        .removed
                        .push(LinkChange::new(link.rid, link.provider.to_string()));
                    to_delete.push(link.stored().to_string());
                }
                Some(d) if link.body() == d.directive.render() && !kept.contains(&link.rid) => {
                    kept.insert(link.rid);
                }
                Some(_) => {
                    warn!(node = %session.node(), rid = %link.rid, "link drifted, replacing");
                    to_delete.push(link.stored().to_string());
                }
            }
        }

        for d in desired {
            if kept.contains(&d.rid) {
                continue;
            }
            let mut change = d.change();
            if stored.links.iter().any(|l| l.rid == d.rid) {
                change = change.replacing();
            }
            to_add.push(d.directive.render());
            report.added.push(change);
        }

        if !to_delete.is_empty() {
            self.delete_values(session, to_delete).await?;
            report.writes += 1;
        }
        if !to_add.is_empty() {
            session
                .modify(&self.settings.primary_db_dn, vec![Modification::add(SYNCREPL, to_add)])
                .await?;
            report.writes += 1;
        }

        let want_mirror = !desired.is_empty();
        if self.set_mirror_mode(session, want_mirror).await? {
            report.writes += 1;
        }
        report.mirror_mode = want_mirror;
        if report.changed() {
            info!(
                node = %session.node(),
                added = report.added.len(),
                removed = report.removed.len(),
                "links converged"
            );
        }
        Ok(report)
    }

    /// Remove every link and mirror mode from a node leaving the mesh
    ///
    /// The change-log database and overlays stay; the engine cannot delete
    /// database entries online.
    ///
    /// # Errors
    ///
    /// Returns error if the node cannot be read or rejects the change
    pub async fn teardown(&self, session: &mut dyn ConfigSession) -> Result<LinkReport, LinkError> {
        let stored = self.read(session).await?;
        let mut report = LinkReport::default();
        if !stored.links.is_empty() || !stored.malformed.is_empty() {
            report.removed = stored
                .links
                .iter()
                .map(|l| LinkChange::new(l.rid, l.provider.to_string()))
                .collect();
            session
                .modify(
                    &self.settings.primary_db_dn,
                    vec![Modification::delete(SYNCREPL, Vec::new())],
                )
                .await?;
            report.writes += 1;
        }
        if self.set_mirror_mode(session, false).await? {
            report.writes += 1;
        }
        info!(node = %session.node(), removed = report.removed.len(), "replication torn down");
        Ok(report)
    }

    async fn read(&self, session: &mut dyn ConfigSession) -> Result<StoredLinks, LinkError> {
        let values = session
            .read_values(&self.settings.primary_db_dn, SYNCREPL)
            .await?;
        let mut stored = StoredLinks {
            links: Vec::with_capacity(values.len()),
            malformed: Vec::new(),
        };
        for (position, value) in values.into_iter().enumerate() {
            match parse_directive(&value) {
                Ok(directive) => stored.links.push(ReplicationLink {
                    rid: directive.rid,
                    provider: directive.provider.clone(),
                    directive,
                }),
                Err(e) => stored.malformed.push((position, value, e)),
            }
        }
        Ok(stored)
    }

    async fn delete_values(&self, session: &mut dyn ConfigSession, values: Vec<String>) -> Result<(), LinkError> {
        session
            .modify(
                &self.settings.primary_db_dn,
                vec![Modification::delete(SYNCREPL, values)],
            )
            .await?;
        Ok(())
    }

    async fn finish_removal(
        &self,
        session: &mut dyn ConfigSession,
        removed: Vec<LinkChange>,
        remaining: usize,
    ) -> Result<LinkReport, LinkError> {
        let mut report = LinkReport {
            removed,
            writes: 1,
            ..LinkReport::default()
        };
        if remaining == 0 {
            if self.set_mirror_mode(session, false).await? {
                report.writes += 1;
            }
            report.mirror_mode = false;
        } else {
            report.mirror_mode = self.mirror_mode(session).await?;
        }
        Ok(report)
    }

    fn check_not_self(&self, session: &dyn ConfigSession, desired: &DesiredLink) -> Result<(), LinkError> {
        if desired.provider.host == *session.node() {
            return Err(LinkError::InvariantViolation {
                reason: format!("node {} cannot replicate from itself", session.node()),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{NoopResolver, StaticResolver};
    use ldapmesh_core::{Credentials, NodeId, ServerId};
    use ldapmesh_directory::memory::SEED_PRIMARY_DB;
    use ldapmesh_directory::{DirectoryConnector, MemoryDirectory};

    fn settings() -> ReplicationSettings {
        ReplicationSettings::new(Credentials::new("cn=replicator,o=gluu", "replpw"))
    }

    fn manager() -> LinkManager {
        LinkManager::new(settings(), Arc::new(NoopResolver))
    }

    fn node(host: &str, server_id: u16) -> Node {
        Node::new(
            NodeAddress::new(NodeId::new(host).unwrap()),
            Credentials::config_admin("secret"),
        )
        .with_server_id(ServerId::new(server_id).unwrap())
    }

    fn link(provider: &Node) -> DesiredLink {
        DesiredLink::from_provider(provider, &settings()).unwrap()
    }

    async fn consumer() -> (MemoryDirectory, Node, Box<dyn ConfigSession>) {
        let n = node("ldap1", 1);
        let dir = MemoryDirectory::with_nodes([n.id()]).await;
        let session = dir.connect(&n).await.unwrap();
        (dir, n, session)
    }

    async fn stored(dir: &MemoryDirectory, n: &Node) -> Vec<String> {
        dir.values(n.id(), SEED_PRIMARY_DB, SYNCREPL).await
    }

    #[tokio::test]
    async fn test_add_link_enables_mirror_mode() {
        let (dir, n, mut s) = consumer().await;
        let m = manager();
        let report = m.add_link(s.as_mut(), &link(&node("ldap2", 2))).await.unwrap();

        assert_eq!(report.added.len(), 1);
        assert!(!report.added[0].replaced);
        assert!(report.mirror_mode);
        assert_eq!(report.writes, 2);
        assert!(m.mirror_mode(s.as_mut()).await.unwrap());

        let links = m.list_links(s.as_mut()).await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].rid.to_string(), "002");
        assert!(links[0].stored().starts_with("{0}rid=002 "));
        assert_eq!(stored(&dir, &n).await.len(), 1);
    }

    #[tokio::test]
    async fn test_add_link_identical_is_noop() {
        let (dir, n, mut s) = consumer().await;
        let m = manager();
        let desired = link(&node("ldap2", 2));
        m.add_link(s.as_mut(), &desired).await.unwrap();
        let before = dir.write_count(n.id()).await;

        let report = m.add_link(s.as_mut(), &desired).await.unwrap();
        assert!(!report.changed());
        assert!(report.added.is_empty());
        assert_eq!(dir.write_count(n.id()).await, before);
    }

    #[tokio::test]
    async fn test_add_link_replaces_same_rid() {
        let (dir, n, mut s) = consumer().await;
        let m = manager();
        m.add_link(s.as_mut(), &link(&node("ldap2", 2))).await.unwrap();
        m.add_link(s.as_mut(), &link(&node("ldap3", 3))).await.unwrap();

        let moved = node("ldap2-new", 2);
        let report = m.add_link(s.as_mut(), &link(&moved)).await.unwrap();
        assert!(report.added[0].replaced);
        assert_eq!(report.writes, 2);

        let links = m.list_links(s.as_mut()).await.unwrap();
        assert_eq!(links.len(), 2);
        let rid2: Vec<_> = links.iter().filter(|l| l.rid.get() == 2).collect();
        assert_eq!(rid2.len(), 1);
        assert_eq!(rid2[0].provider.host, "ldap2-new");
        assert_eq!(stored(&dir, &n).await.len(), 2);
    }

    #[tokio::test]
    async fn test_add_link_to_self_rejected() {
        let (dir, n, mut s) = consumer().await;
        let err = manager().add_link(s.as_mut(), &link(&n)).await.unwrap_err();
        assert!(matches!(err, LinkError::InvariantViolation { .. }));
        assert_eq!(dir.write_count(n.id()).await, 0);
    }

    #[tokio::test]
    async fn test_remove_last_link_disables_mirror_mode() {
        let (dir, n, mut s) = consumer().await;
        let m = manager();
        let p2 = node("ldap2", 2);
        let p3 = node("ldap3", 3);
        m.add_link(s.as_mut(), &link(&p2)).await.unwrap();
        m.add_link(s.as_mut(), &link(&p3)).await.unwrap();

        let report = m.remove_link(s.as_mut(), &p2.address).await.unwrap();
        assert_eq!(report.removed.len(), 1);
        assert!(report.mirror_mode);
        assert!(m.mirror_mode(s.as_mut()).await.unwrap());

        let report = m.remove_link(s.as_mut(), &p3.address).await.unwrap();
        assert!(!report.mirror_mode);
        assert_eq!(report.writes, 2);
        assert!(!m.mirror_mode(s.as_mut()).await.unwrap());
        assert!(dir.values(n.id(), SEED_PRIMARY_DB, MIRROR_MODE).await.is_empty());
        assert!(stored(&dir, &n).await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_absent_link_is_noop() {
        let (dir, n, mut s) = consumer().await;
        let report = manager()
            .remove_link(s.as_mut(), &node("ldap9", 9).address)
            .await
            .unwrap();
        assert!(!report.changed());
        assert_eq!(dir.write_count(n.id()).await, 0);
    }

    #[tokio::test]
    async fn test_remove_link_by_ip_provider() {
        let (dir, n, mut s) = consumer().await;
        dir.put_values(
            n.id(),
            SEED_PRIMARY_DB,
            SYNCREPL,
            vec!["rid=002 provider=ldaps://10.0.0.2:1636 binddn=\"cn=replicator,o=gluu\"".to_string()],
        )
        .await;
        let resolver = StaticResolver::new().with_entry("10.0.0.2".parse().unwrap(), "ldap2");
        let m = LinkManager::new(settings(), Arc::new(resolver));

        let report = m.remove_link(s.as_mut(), &node("ldap2", 2).address).await.unwrap();
        assert_eq!(report.removed.len(), 1);
        assert!(stored(&dir, &n).await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_link_first_of_duplicates() {
        let (dir, n, mut s) = consumer().await;
        dir.put_values(
            n.id(),
            SEED_PRIMARY_DB,
            SYNCREPL,
            vec![
                "rid=002 provider=ldaps://ldap2:1636".to_string(),
                "rid=012 provider=ldaps://ldap2:1636".to_string(),
            ],
        )
        .await;
        let m = manager();
        let report = m.remove_link(s.as_mut(), &node("ldap2", 2).address).await.unwrap();
        assert_eq!(report.removed[0].rid.get(), 2);
        let left = m.list_links(s.as_mut()).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].rid.get(), 12);
    }

    #[tokio::test]
    async fn test_remove_link_by_rid() {
        let (_dir, _n, mut s) = consumer().await;
        let m = manager();
        m.add_link(s.as_mut(), &link(&node("ldap2", 2))).await.unwrap();
        let report = m.remove_link_by_rid(s.as_mut(), Rid::new(2).unwrap()).await.unwrap();
        assert_eq!(report.removed.len(), 1);
        assert!(!report.mirror_mode);
        assert!(m.list_links(s.as_mut()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_converge_rejects_duplicate_rid() {
        let (dir, n, mut s) = consumer().await;
        let desired = vec![link(&node("ldap2", 2)), link(&node("ldap2b", 2))];
        let err = manager().converge(s.as_mut(), &desired).await.unwrap_err();
        assert!(matches!(err, LinkError::InvariantViolation { .. }));
        assert_eq!(dir.write_count(n.id()).await, 0);
    }

    #[tokio::test]
    async fn test_converge_repairs_drift() {
        let (dir, n, mut s) = consumer().await;
        let m = manager();
        let desired = vec![link(&node("ldap2", 2)), link(&node("ldap3", 3))];
        dir.put_values(
            n.id(),
            SEED_PRIMARY_DB,
            SYNCREPL,
            vec![
                "rid=002 provider=ldaps://ldap2:1636 credentials=old".to_string(),
                "rid=007 provider=ldaps://ldap7:1636".to_string(),
                "garbage".to_string(),
            ],
        )
        .await;
        assert!(matches!(
            m.list_links(s.as_mut()).await,
            Err(LinkError::MalformedDirective { position: 2, .. })
        ));

        let report = m.converge(s.as_mut(), &desired).await.unwrap();
        assert_eq!(report.removed.len(), 1);
        assert_eq!(report.removed[0].rid.get(), 7);
        assert_eq!(report.added.len(), 2);
        assert!(report.added.iter().any(|c| c.rid.get() == 2 && c.replaced));
        assert!(report.mirror_mode);

        let links = m.list_links(s.as_mut()).await.unwrap();
        let mut rids: Vec<u16> = links.iter().map(|l| l.rid.get()).collect();
        rids.sort_unstable();
        assert_eq!(rids, vec![2, 3]);

        let before = dir.write_count(n.id()).await;
        let again = m.converge(s.as_mut(), &desired).await.unwrap();
        assert!(!again.changed());
        assert_eq!(dir.write_count(n.id()).await, before);
    }

    #[tokio::test]
    async fn test_converge_to_empty_disables_mirror_mode() {
        let (dir, n, mut s) = consumer().await;
        let m = manager();
        m.add_link(s.as_mut(), &link(&node("ldap2", 2))).await.unwrap();
        let report = m.converge(s.as_mut(), &[]).await.unwrap();
        assert_eq!(report.removed.len(), 1);
        assert!(!report.mirror_mode);
        assert!(dir.values(n.id(), SEED_PRIMARY_DB, MIRROR_MODE).await.is_empty());
    }

    #[tokio::test]
    async fn test_converge_restores_missing_mirror_mode() {
        let (dir, n, mut s) = consumer().await;
        let m = manager();
        let desired = vec![link(&node("ldap2", 2))];
        m.converge(s.as_mut(), &desired).await.unwrap();
        dir.put_values(n.id(), SEED_PRIMARY_DB, MIRROR_MODE, Vec::new()).await;

        let report = m.converge(s.as_mut(), &desired).await.unwrap();
        assert_eq!(report.writes, 1);
        assert!(report.added.is_empty());
        assert!(m.mirror_mode(s.as_mut()).await.unwrap());
    }

    #[tokio::test]
    async fn test_teardown() {
        let (dir, n, mut s) = consumer().await;
        let m = manager();
        m.add_link(s.as_mut(), &link(&node("ldap2", 2))).await.unwrap();
        m.add_link(s.as_mut(), &link(&node("ldap3", 3))).await.unwrap();

        let report = m.teardown(s.as_mut()).await.unwrap();
        assert_eq!(report.removed.len(), 2);
        assert_eq!(report.writes, 2);
        assert!(stored(&dir, &n).await.is_empty());
        assert!(!m.mirror_mode(s.as_mut()).await.unwrap());

        let again = m.teardown(s.as_mut()).await.unwrap();
        assert!(!again.changed());
    }
}
