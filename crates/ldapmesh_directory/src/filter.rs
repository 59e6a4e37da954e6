//! Search filters over configuration entries.
//!
//! Only the shapes the topology manager issues are supported: presence,
//! equality, conjunction and disjunction.

use crate::entry::{Entry, strip_ordering_prefix};

/// Parsed search filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// `(attr=*)`
    Present(String),
    /// `(attr=value)`
    Equal(String, String),
    /// `(&(..)(..))`
    And(Vec<Filter>),
    /// `(|(..)(..))`
    Or(Vec<Filter>),
}

impl Filter {
    /// Parse a filter string
    ///
    /// # Errors
    ///
    /// Returns a description of the first syntax problem found
    pub fn parse(input: &str) -> Result<Self, String> {
        let input = input.trim();
        let (filter, rest) = parse_one(input)?;
        if !rest.trim().is_empty() {
            return Err(format!("trailing input after filter: '{}'", rest));
        }
        Ok(filter)
    }

    /// Evaluate against an entry
    ///
    /// Attribute names and values compare case-insensitively; ordered
    /// values match with or without their `{n}` prefix.
    #[must_use]
    pub fn matches(&self, entry: &Entry) -> bool {
        match self {
            Self::Present(attr) => attr.eq_ignore_ascii_case("objectClass") || entry.has(attr),
            Self::Equal(attr, value) => entry.get(attr).iter().any(|v| {
                v.eq_ignore_ascii_case(value) || strip_ordering_prefix(v).eq_ignore_ascii_case(value)
            }),
            Self::And(parts) => parts.iter().all(|f| f.matches(entry)),
            Self::Or(parts) => parts.iter().any(|f| f.matches(entry)),
        }
    }
}

fn parse_one(input: &str) -> Result<(Filter, &str), String> {
    let body = input
        .strip_prefix('(')
        .ok_or_else(|| format!("expected '(' at '{}'", input))?;

    if let Some(rest) = body.strip_prefix('&') {
        let (parts, rest) = parse_list(rest)?;
        return Ok((Filter::And(parts), rest));
    }
    if let Some(rest) = body.strip_prefix('|') {
        let (parts, rest) = parse_list(rest)?;
        return Ok((Filter::Or(parts), rest));
    }

    // Simple item: scan to the matching close paren so values may nest parens.
    let mut depth = 0usize;
    let mut end = None;
    for (i, c) in body.char_indices() {
        match c {
            '(' => depth += 1,
            ')' if depth == 0 => {
                end = Some(i);
                break;
            }
            ')' => depth -= 1,
            _ => {}
        }
    }
    let end = end.ok_or_else(|| format!("unterminated filter '{}'", input))?;
    let item = &body[..end];
    let (attr, value) = item
        .split_once('=')
        .ok_or_else(|| format!("missing '=' in '{}'", item))?;
    let attr = attr.trim();
    if attr.is_empty() {
        return Err(format!("empty attribute in '{}'", item));
    }
    let filter = if value == "*" {
        Filter::Present(attr.to_string())
    } else {
        Filter::Equal(attr.to_string(), value.to_string())
    };
    Ok((filter, &body[end + 1..]))
}

fn parse_list(mut input: &str) -> Result<(Vec<Filter>, &str), String> {
    let mut parts = Vec::new();
    loop {
        input = input.trim_start();
        if let Some(rest) = input.strip_prefix(')') {
            if parts.is_empty() {
                return Err("empty filter list".to_string());
            }
            return Ok((parts, rest));
        }
        let (filter, rest) = parse_one(input)?;
        parts.push(filter);
        input = rest;
    }
}
