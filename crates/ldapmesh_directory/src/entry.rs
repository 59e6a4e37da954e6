//! Configuration entries and modifications.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Attribute list for an add operation, in insertion order
pub type Attributes = Vec<(String, Vec<String>)>;

/// Search scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    /// The base entry only
    Base,
    /// Direct children of the base
    OneLevel,
    /// The base and all descendants
    Subtree,
}

/// Modification operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModOp {
    /// Add values
    Add,
    /// Replace all values (empty list removes the attribute)
    Replace,
    /// Delete the listed values (empty list removes the attribute)
    Delete,
}

/// One change inside a modify call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modification {
    /// Attribute name
    pub attr: String,
    /// Operation
    pub op: ModOp,
    /// Values
    pub values: Vec<String>,
}

impl Modification {
    /// Add values
    #[must_use]
    pub fn add(attr: &str, values: Vec<String>) -> Self {
        Self {
            attr: attr.to_string(),
            op: ModOp::Add,
            values,
        }
    }

    /// Replace values
    #[must_use]
    pub fn replace(attr: &str, values: Vec<String>) -> Self {
        Self {
            attr: attr.to_string(),
            op: ModOp::Replace,
            values,
        }
    }

    /// Delete values
    #[must_use]
    pub fn delete(attr: &str, values: Vec<String>) -> Self {
        Self {
            attr: attr.to_string(),
            op: ModOp::Delete,
            values,
        }
    }
}

/// A configuration entry returned by a search
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Entry {
    /// Distinguished name
    pub dn: String,
    /// Attributes with their server-side spelling
    pub attrs: IndexMap<String, Vec<String>>,
}

impl Entry {
    /// Create an entry
    #[must_use]
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attrs: IndexMap::new(),
        }
    }

    /// Builder-style attribute setter
    #[must_use]
    pub fn with_attr(mut self, name: &str, values: Vec<String>) -> Self {
        self.set(name, values);
        self
    }

    /// Values of an attribute, matched case-insensitively
    #[must_use]
    pub fn get(&self, name: &str) -> &[String] {
        self.attrs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map_or(&[], |(_, v)| v.as_slice())
    }

    /// First value of an attribute
    #[must_use]
    pub fn first(&self, name: &str) -> Option<&str> {
        self.get(name).first().map(String::as_str)
    }

    /// Whether the attribute has at least one value
    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        !self.get(name).is_empty()
    }

    /// Set (or with an empty list, remove) an attribute, keeping an existing spelling
    pub fn set(&mut self, name: &str, values: Vec<String>) {
        let key = self
            .attrs
            .keys()
            .find(|k| k.eq_ignore_ascii_case(name))
            .cloned();
        match (key, values.is_empty()) {
            (Some(k), true) => {
                self.attrs.shift_remove(&k);
            }
            (Some(k), false) => {
                self.attrs.insert(k, values);
            }
            (None, true) => {}
            (None, false) => {
                self.attrs.insert(name.to_string(), values);
            }
        }
    }

    /// Values with their `{n}` ordering prefix removed
    #[must_use]
    pub fn unordered(&self, name: &str) -> Vec<&str> {
        self.get(name).iter().map(|v| strip_ordering_prefix(v)).collect()
    }
}

/// Remove the `{n}` ordering prefix the engine adds to ordered values
#[must_use]
pub fn strip_ordering_prefix(value: &str) -> &str {
    if let Some(rest) = value.strip_prefix('{') {
        if let Some(end) = rest.find('}') {
            let digits = &rest[..end];
            if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                return &rest[end + 1..];
            }
        }
    }
    value
}

/// Normalize a DN for comparison: lower-case, no spaces around separators
#[must_use]
pub fn normalize_dn(dn: &str) -> String {
    dn.split(',')
        .map(|rdn| {
            rdn.split('=')
                .map(str::trim)
                .collect::<Vec<_>>()
                .join("=")
                .to_ascii_lowercase()
        })
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_case_insensitive() {
        let entry = Entry::new("olcDatabase={1}mdb,cn=config")
            .with_attr("olcSyncrepl", vec!["{0}rid=001".to_string()]);
        assert_eq!(entry.get("olcSyncRepl").len(), 1);
        assert_eq!(entry.get("OLCSYNCREPL").len(), 1);
        assert!(entry.get("olcMirrorMode").is_empty());
        assert!(entry.has("olcsyncrepl"));
    }

    #[test]
    fn test_set_keeps_spelling_and_removes() {
        let mut entry = Entry::new("cn=config").with_attr("olcServerID", vec!["1".to_string()]);
        entry.set("olcserverid", vec!["2".to_string()]);
        assert_eq!(entry.attrs.keys().next().unwrap(), "olcServerID");
        assert_eq!(entry.first("olcServerID"), Some("2"));

        entry.set("olcServerID", Vec::new());
        assert!(entry.attrs.is_empty());
    }

    #[test]
    fn test_strip_ordering_prefix() {
        assert_eq!(strip_ordering_prefix("{0}syncprov.la"), "syncprov.la");
        assert_eq!(strip_ordering_prefix("{12}rid=001 provider=x"), "rid=001 provider=x");
        assert_eq!(strip_ordering_prefix("rid=001"), "rid=001");
        assert_eq!(strip_ordering_prefix("{x}value"), "{x}value");
        assert_eq!(strip_ordering_prefix("{}value"), "{}value");
    }

    #[test]
    fn test_unordered_values() {
        let entry = Entry::new("cn=module{0},cn=config").with_attr(
            "olcModuleLoad",
            vec!["{0}back_mdb".to_string(), "{1}syncprov.la".to_string()],
        );
        assert_eq!(entry.unordered("olcModuleLoad"), vec!["back_mdb", "syncprov.la"]);
    }

    #[test]
    fn test_normalize_dn() {
        assert_eq!(
            normalize_dn("cn=admin, cn=accesslog"),
            normalize_dn("CN=Admin,cn = accesslog")
        );
        assert_eq!(normalize_dn("olcDatabase={1}mdb,cn=config"), "olcdatabase={1}mdb,cn=config");
    }
}
