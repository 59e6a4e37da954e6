//! Inventory name resolution.
//!
//! Providers are sometimes recorded by IP literal. Comparisons between a
//! stored directive and a desired link go through the canonical hostname so
//! both spellings of one node compare equal.

use ldapmesh_core::Node;
use std::collections::HashMap;
use std::net::IpAddr;

/// Maps IP addresses to inventory hostnames
pub trait NameResolver: Send + Sync {
    /// Canonical hostname for an IP address, if known
    fn resolve_hostname(&self, ip: IpAddr) -> Option<String>;
}

/// Resolver that knows nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopResolver;

impl NameResolver for NoopResolver {
    fn resolve_hostname(&self, _ip: IpAddr) -> Option<String> {
        None
    }
}

/// Resolver backed by a fixed table
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    table: HashMap<IpAddr, String>,
}

impl StaticResolver {
    /// Create an empty resolver
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a mapping
    #[must_use]
    pub fn with_entry(mut self, ip: IpAddr, hostname: impl Into<String>) -> Self {
        self.table.insert(ip, hostname.into().to_ascii_lowercase());
        self
    }

    /// Build from the IP fallbacks of an inventory
    #[must_use]
    pub fn from_nodes<'a>(nodes: impl IntoIterator<Item = &'a Node>) -> Self {
        let table = nodes
            .into_iter()
            .filter_map(|node| {
                node.address
                    .ip
                    .map(|ip| (ip, node.id().as_str().to_string()))
            })
            .collect();
        Self { table }
    }

    /// Number of known addresses
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl NameResolver for StaticResolver {
    fn resolve_hostname(&self, ip: IpAddr) -> Option<String> {
        self.table.get(&ip).cloned()
    }
}

/// Canonical comparison form of a host: IP literals resolved when possible,
/// everything lower-cased
#[must_use]
pub fn canonical_host(host: &str, resolver: &dyn NameResolver) -> String {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    match bare.parse::<IpAddr>() {
        Ok(ip) => resolver
            .resolve_hostname(ip)
            .unwrap_or_else(|| ip.to_string())
            .to_ascii_lowercase(),
        Err(_) => bare.to_ascii_lowercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ldapmesh_core::{Credentials, NodeAddress, NodeId};

    #[test]
    fn test_static_resolver_from_nodes() {
        let with_ip = Node::new(
            NodeAddress::new(NodeId::new("ldap1.example.org").unwrap()).with_ip("10.0.0.1".parse().unwrap()),
            Credentials::config_admin("secret"),
        );
        let without_ip = Node::new(
            NodeAddress::new(NodeId::new("ldap2.example.org").unwrap()),
            Credentials::config_admin("secret"),
        );
        let resolver = StaticResolver::from_nodes([&with_ip, &without_ip]);
        assert_eq!(resolver.len(), 1);
        assert_eq!(
            resolver.resolve_hostname("10.0.0.1".parse().unwrap()),
            Some("ldap1.example.org".to_string())
        );
        assert_eq!(resolver.resolve_hostname("10.0.0.2".parse().unwrap()), None);
    }

    #[test]
    fn test_canonical_host() {
        let resolver = StaticResolver::new()
            .with_entry("10.0.0.1".parse().unwrap(), "LDAP1.example.org")
            .with_entry("fd00::1".parse().unwrap(), "ldap6.example.org");

        assert_eq!(canonical_host("10.0.0.1", &resolver), "ldap1.example.org");
        assert_eq!(canonical_host("[fd00::1]", &resolver), "ldap6.example.org");
        assert_eq!(canonical_host("LDAP2.Example.Org", &resolver), "ldap2.example.org");
        assert_eq!(canonical_host("10.0.0.9", &resolver), "10.0.0.9");
        assert_eq!(canonical_host("10.0.0.1", &NoopResolver), "10.0.0.1");
    }
}
