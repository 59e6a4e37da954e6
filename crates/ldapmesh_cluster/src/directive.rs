//! Replication directive codec.
//!
//! A directive is one value of a consumer's `olcSyncrepl` attribute: a
//! whitespace-separated list of `key=value` pairs where values may be
//! double-quoted to carry spaces. Rendering is canonical so that a directive
//! built from the same inputs is byte-identical to the stored value.

use crate::resolver::{NameResolver, canonical_host};
use crate::settings::ReplicationSettings;
use indexmap::IndexMap;
use ldapmesh_core::{NodeAddress, Rid};
use ldapmesh_directory::strip_ordering_prefix;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::str::FromStr;

static PROVIDER_URL: Lazy<Result<Regex, regex::Error>> = Lazy::new(|| {
    Regex::new(r"^(?i)(ldaps?|ldapi)://(\[[0-9A-Fa-f:.]+\]|[^:/\[\]\s]+)(?::(\d{1,5}))?/?$")
});

/// Directive parse errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectiveError {
    /// A quoted value never closes
    #[error("Unterminated quote in directive")]
    UnterminatedQuote,

    /// A required key is absent
    #[error("Directive has no {key}")]
    MissingKey {
        /// Missing key
        key: &'static str,
    },

    /// The rid is not a valid replica ID
    #[error("Invalid rid '{value}'")]
    InvalidRid {
        /// Raw value
        value: String,
    },

    /// The provider is not an LDAP URL
    #[error("Invalid provider '{value}': {reason}")]
    InvalidProvider {
        /// Raw value
        value: String,
        /// Why it was rejected
        reason: String,
    },
}

/// Provider address embedded in a directive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderUrl {
    /// URL scheme, lower-cased
    pub scheme: String,
    /// Host as written, without IPv6 brackets
    pub host: String,
    /// Explicit port, if any
    pub port: Option<u16>,
}

impl ProviderUrl {
    /// Provider URL of a node address
    #[must_use]
    pub fn from_address(address: &NodeAddress) -> Self {
        Self {
            scheme: address.tls.scheme().to_string(),
            host: address.host.as_str().to_string(),
            port: Some(address.port),
        }
    }

    /// Whether this provider designates the node at `address`
    ///
    /// Hosts compare in canonical form; a missing port matches any port.
    #[must_use]
    pub fn designates(&self, address: &NodeAddress, resolver: &dyn NameResolver) -> bool {
        let ours = canonical_host(&self.host, resolver);
        let theirs = canonical_host(address.host.as_str(), resolver);
        let by_ip = address
            .ip
            .is_some_and(|ip| canonical_host(&ip.to_string(), resolver) == ours);
        (ours == theirs || by_ip) && self.port.is_none_or(|port| port == address.port)
    }

    /// Canonical `host:port` form used as a comparison key
    #[must_use]
    pub fn canonical(&self, resolver: &dyn NameResolver) -> String {
        match self.port {
            Some(port) => format!("{}:{}", canonical_host(&self.host, resolver), port),
            None => canonical_host(&self.host, resolver),
        }
    }
}

impl FromStr for ProviderUrl {
    type Err = DirectiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| DirectiveError::InvalidProvider {
            value: s.to_string(),
            reason,
        };
        let pattern = PROVIDER_URL.as_ref().map_err(|e| invalid(e.to_string()))?;
        let caps = pattern
            .captures(s.trim())
            .ok_or_else(|| invalid("expected scheme://host[:port]".to_string()))?;
        let host = caps
            .get(2)
            .map(|m| m.as_str().trim_start_matches('[').trim_end_matches(']'))
            .unwrap_or_default()
            .to_string();
        let port = match caps.get(3) {
            Some(m) => Some(
                m.as_str()
                    .parse::<u16>()
                    .map_err(|_| invalid(format!("port {} out of range", m.as_str())))?,
            ),
            None => None,
        };
        Ok(Self {
            scheme: caps
                .get(1)
                .map(|m| m.as_str().to_ascii_lowercase())
                .unwrap_or_default(),
            host,
            port,
        })
    }
}

impl fmt::Display for ProviderUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        match self.port {
            Some(port) => write!(f, "{}://{}:{}", self.scheme, host, port),
            None => write!(f, "{}://{}", self.scheme, host),
        }
    }
}

/// A directive to be written to a consumer
#[derive(Clone, PartialEq, Eq)]
pub struct SyncDirective {
    /// Replica ID
    pub rid: Rid,
    /// Provider to pull from
    pub provider: ProviderUrl,
    bind_dn: String,
    credentials: String,
    verify_provider_cert: bool,
    tls_cacert: Option<String>,
    search_base: String,
    log_base: String,
    log_filter: String,
    retry: String,
}

impl SyncDirective {
    /// Directive pulling from `provider` under replica ID `rid`
    #[must_use]
    pub fn for_provider(rid: Rid, provider: &NodeAddress, settings: &ReplicationSettings) -> Self {
        let tls_cacert = if provider.tls.requires_tls() {
            settings
                .tls_cacert
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned())
        } else {
            None
        };
        Self {
            rid,
            provider: ProviderUrl::from_address(provider),
            bind_dn: settings.replicator.bind_dn.clone(),
            credentials: settings.replicator.password().to_string(),
            verify_provider_cert: settings.verify_provider_cert,
            tls_cacert,
            search_base: settings.search_base.clone(),
            log_base: settings.log_base.clone(),
            log_filter: settings.log_filter.clone(),
            retry: settings.retry.clone(),
        }
    }

    /// Canonical attribute value
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = format!(
            "rid={} provider={} bindmethod=simple binddn=\"{}\" tls_reqcert={}",
            self.rid,
            self.provider,
            self.bind_dn,
            if self.verify_provider_cert { "demand" } else { "never" },
        );
        if let Some(path) = &self.tls_cacert {
            out.push_str(&format!(" tls_cacert=\"{}\"", path));
        }
        out.push_str(&format!(
            " credentials={} searchbase=\"{}\" logbase=\"{}\" logfilter=\"{}\" schemachecking=on type=refreshAndPersist retry=\"{}\" syncdata=accesslog sizelimit=unlimited timelimit=unlimited",
            self.credentials, self.search_base, self.log_base, self.log_filter, self.retry,
        ));
        out
    }
}

impl fmt::Display for SyncDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl fmt::Debug for SyncDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncDirective")
            .field("rid", &self.rid)
            .field("provider", &self.provider.to_string())
            .field("bind_dn", &self.bind_dn)
            .field("credentials", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

/// A directive read back from a consumer
#[derive(Clone, PartialEq, Eq)]
pub struct ParsedDirective {
    /// Value exactly as stored, ordering prefix included
    pub stored: String,
    /// Value with the ordering prefix removed
    pub body: String,
    /// Replica ID
    pub rid: Rid,
    /// Provider address
    pub provider: ProviderUrl,
    /// Every key=value pair, quotes removed, in stored order
    pub params: IndexMap<String, String>,
}

impl ParsedDirective {
    /// Value of a parameter
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Debug for ParsedDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParsedDirective")
            .field("rid", &self.rid)
            .field("provider", &self.provider.to_string())
            .field("params", &self.params.len())
            .finish_non_exhaustive()
    }
}

/// Split a directive into `key=value` pairs
///
/// Whitespace separates tokens except inside double quotes; the quotes are
/// removed from the value. Tokens without `=` are kept with an empty value.
///
/// # Errors
///
/// Returns error if a quote is left open
pub fn tokenize(input: &str) -> Result<Vec<(String, String)>, DirectiveError> {
    let mut pairs = Vec::new();
    let mut chars = input.chars().peekable();
    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.peek().is_none() {
            return Ok(pairs);
        }
        let mut key = String::new();
        let mut value = String::new();
        let mut in_value = false;
        let mut quoted = false;
        while let Some(&c) = chars.peek() {
            if !quoted && c.is_whitespace() {
                break;
            }
            chars.next();
            match c {
                '"' if in_value => quoted = !quoted,
                '=' if !in_value => in_value = true,
                _ if in_value => value.push(c),
                _ => key.push(c),
            }
        }
        if quoted {
            return Err(DirectiveError::UnterminatedQuote);
        }
        pairs.push((key, value));
    }
}

/// Parse one stored `olcSyncrepl` value
///
/// # Errors
///
/// Returns error if the value cannot be tokenized or lacks a valid rid or
/// provider
pub fn parse_directive(stored: &str) -> Result<ParsedDirective, DirectiveError> {
    let body = strip_ordering_prefix(stored).trim();
    let params: IndexMap<String, String> = tokenize(body)?
        .into_iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v))
        .collect();
    let rid_raw = params
        .get("rid")
        .ok_or(DirectiveError::MissingKey { key: "rid" })?;
    let rid = rid_raw
        .parse::<Rid>()
        .map_err(|_| DirectiveError::InvalidRid {
            value: rid_raw.clone(),
        })?;
    let provider = params
        .get("provider")
        .ok_or(DirectiveError::MissingKey { key: "provider" })?
        .parse::<ProviderUrl>()?;
    Ok(ParsedDirective {
        stored: stored.to_string(),
        body: body.to_string(),
        rid,
        provider,
        params,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{NoopResolver, StaticResolver};
    use ldapmesh_core::{Credentials, NodeId, ServerId, TlsMode};
    use proptest::prelude::*;

    fn settings() -> ReplicationSettings {
        ReplicationSettings::new(Credentials::new("cn=replicator,o=gluu", "s3cret"))
    }

    fn address(host: &str) -> NodeAddress {
        NodeAddress::new(NodeId::new(host).unwrap())
    }

    #[test]
    fn test_render_exact_wire_format() {
        let rid = Rid::from(ServerId::new(2).unwrap());
        let directive = SyncDirective::for_provider(rid, &address("ldap2.example.org"), &settings());
        assert_eq!(
            directive.render(),
            "rid=002 provider=ldaps://ldap2.example.org:1636 bindmethod=simple binddn=\"cn=replicator,o=gluu\" \
             tls_reqcert=never credentials=s3cret searchbase=\"o=gluu\" logbase=\"cn=accesslog\" \
             logfilter=\"(&(objectClass=auditWriteObject)(reqResult=0))\" schemachecking=on \
             type=refreshAndPersist retry=\"60 +\" syncdata=accesslog sizelimit=unlimited timelimit=unlimited"
        );
    }

    #[test]
    fn test_render_cacert_only_for_tls() {
        let settings = settings().with_tls_cacert("/etc/certs/ca.pem");
        let rid = Rid::from(ServerId::new(3).unwrap());

        let tls = SyncDirective::for_provider(rid, &address("ldap3"), &settings).render();
        assert!(tls.contains("tls_reqcert=never tls_cacert=\"/etc/certs/ca.pem\" credentials="));

        let plain = address("ldap3").with_tls(TlsMode::Plain).with_port(389);
        let plain = SyncDirective::for_provider(rid, &plain, &settings).render();
        assert!(!plain.contains("tls_cacert"));
        assert!(plain.contains("provider=ldap://ldap3:389"));
    }

    #[test]
    fn test_debug_redacts_credentials() {
        let rid = Rid::from(ServerId::new(1).unwrap());
        let directive = SyncDirective::for_provider(rid, &address("ldap1"), &settings());
        assert!(!format!("{:?}", directive).contains("s3cret"));
        let parsed = parse_directive(&directive.render()).unwrap();
        assert!(!format!("{:?}", parsed).contains("s3cret"));
    }

    #[test]
    fn test_parse_rendered_directive() {
        let rid = Rid::from(ServerId::new(12).unwrap());
        let rendered = SyncDirective::for_provider(rid, &address("ldap12"), &settings()).render();
        let parsed = parse_directive(&format!("{{4}}{}", rendered)).unwrap();
        assert_eq!(parsed.rid, rid);
        assert_eq!(parsed.body, rendered);
        assert_eq!(parsed.provider.host, "ldap12");
        assert_eq!(parsed.provider.port, Some(1636));
        assert_eq!(parsed.param("retry"), Some("60 +"));
        assert_eq!(
            parsed.param("logfilter"),
            Some("(&(objectClass=auditWriteObject)(reqResult=0))")
        );
    }

    #[test]
    fn test_parse_legacy_directive() {
        let parsed = parse_directive(
            "{0}rid=7 provider=LDAPS://10.0.0.7 binddn=\"cn=replicator,o=gluu\" credentials=x",
        )
        .unwrap();
        assert_eq!(parsed.rid.to_string(), "007");
        assert_eq!(parsed.provider.scheme, "ldaps");
        assert_eq!(parsed.provider.port, None);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            parse_directive("provider=ldaps://a:1636"),
            Err(DirectiveError::MissingKey { key: "rid" })
        );
        assert_eq!(
            parse_directive("rid=001"),
            Err(DirectiveError::MissingKey { key: "provider" })
        );
        assert!(matches!(
            parse_directive("rid=0 provider=ldaps://a"),
            Err(DirectiveError::InvalidRid { .. })
        ));
        assert!(matches!(
            parse_directive("rid=001 provider=http://a"),
            Err(DirectiveError::InvalidProvider { .. })
        ));
        assert_eq!(
            parse_directive("rid=001 provider=ldaps://a retry=\"60 +"),
            Err(DirectiveError::UnterminatedQuote)
        );
    }

    #[test]
    fn test_provider_ipv6() {
        let url: ProviderUrl = "ldaps://[fd00::7]:1636".parse().unwrap();
        assert_eq!(url.host, "fd00::7");
        assert_eq!(url.to_string(), "ldaps://[fd00::7]:1636");
    }

    #[test]
    fn test_provider_designates() {
        let resolver = StaticResolver::new().with_entry("10.0.0.2".parse().unwrap(), "ldap2.example.org");
        let target = address("ldap2.example.org");

        let by_name: ProviderUrl = "ldaps://LDAP2.example.org:1636".parse().unwrap();
        let by_ip: ProviderUrl = "ldaps://10.0.0.2:1636".parse().unwrap();
        let no_port: ProviderUrl = "ldaps://ldap2.example.org".parse().unwrap();
        let wrong_port: ProviderUrl = "ldaps://ldap2.example.org:636".parse().unwrap();

        assert!(by_name.designates(&target, &resolver));
        assert!(by_ip.designates(&target, &resolver));
        assert!(!by_ip.designates(&target, &NoopResolver));
        assert!(by_ip.designates(&target.clone().with_ip("10.0.0.2".parse().unwrap()), &NoopResolver));
        assert!(no_port.designates(&target, &resolver));
        assert!(!wrong_port.designates(&target, &resolver));
        assert_eq!(by_ip.canonical(&resolver), "ldap2.example.org:1636");
    }

    proptest! {
        #[test]
        fn prop_tokenize_preserves_values(
            pairs in proptest::collection::vec(("[a-z]{1,8}", "[a-zA-Z0-9=,+() ]{0,16}"), 0..8)
        ) {
            let rendered: Vec<String> = pairs.iter().map(|(k, v)| format!("{}=\"{}\"", k, v)).collect();
            let tokens = tokenize(&rendered.join("  ")).unwrap();
            prop_assert_eq!(tokens, pairs);
        }

        #[test]
        fn prop_rid_survives_prefix(id in 1u16..=999, prefix in 0u32..50) {
            let rid = Rid::from(ServerId::new(id).unwrap());
            let value = format!("{{{}}}rid={} provider=ldaps://h:1636", prefix, rid);
            let parsed = parse_directive(&value).unwrap();
            prop_assert_eq!(parsed.rid, rid);
        }
    }
}
