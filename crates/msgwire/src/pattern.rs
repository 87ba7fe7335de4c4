// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Name patterns used by administrative selectors and the no-log filter.

use std::net::{IpAddr, Ipv4Addr};

/// Match `text` against `pattern`, where `*` matches any run of characters.
///
/// Any number of asterisks may appear. There is no escape character.
///
/// # Examples
///
/// ```
/// use msgwire::pattern::wildcard_match;
/// assert!(wildcard_match("*", "anything"));
/// assert!(wildcard_match("dev-*-east", "dev-12-east"));
/// assert!(!wildcard_match("dev-*", "prod-1"));
/// ```
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    if pattern == "*" || pattern == text {
        return true;
    }

    let mut parts = pattern.split('*');
    // split always yields at least one item
    let first = parts.next().unwrap_or("");
    let Some(mut rest) = text.strip_prefix(first) else {
        return false;
    };

    let tail: Vec<&str> = parts.collect();
    let Some((last, middle)) = tail.split_last() else {
        // No asterisk at all: exact match already failed
        return false;
    };

    for piece in middle {
        if piece.is_empty() {
            continue;
        }
        match rest.find(piece) {
            Some(pos) => rest = &rest[pos + piece.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}

/// Optional pattern: `None` matches everything.
pub(crate) fn matches_opt(pattern: Option<&str>, text: &str) -> bool {
    pattern.map_or(true, |p| wildcard_match(p, text))
}

// ============================================================================
// No-log address ranges
// ============================================================================

/// Set of IPv4 ranges whose connections are logged at debug level only.
///
/// Entries are written as `a.b.c.d` or `a.b.c.d/len` with `len` in 8..=30.
#[derive(Clone, Debug, Default)]
pub struct NoLogRanges {
    ranges: Vec<(u32, u32)>,
}

impl NoLogRanges {
    /// Parse a list of CIDR strings. Malformed entries are skipped with a warning.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Self {
        let mut ranges = Vec::with_capacity(entries.len());
        for entry in entries {
            match parse_cidr(entry.as_ref()) {
                Some(range) => ranges.push(range),
                None => log::warn!("[msgwire] Ignoring invalid nolog entry: {}", entry.as_ref()),
            }
        }
        Self { ranges }
    }

    /// Whether `ip` falls inside one of the ranges.
    pub fn contains(&self, ip: IpAddr) -> bool {
        let IpAddr::V4(v4) = ip else {
            return false;
        };
        let value = u32::from(v4);
        self.ranges
            .iter()
            .any(|(low, high)| value >= *low && value <= *high)
    }

    /// Whether any range is configured.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

fn parse_cidr(entry: &str) -> Option<(u32, u32)> {
    let (addr, scope) = match entry.split_once('/') {
        Some((addr, scope)) => (addr, scope.trim().parse::<u32>().ok()?),
        None => (entry, 32),
    };
    let base = u32::from(addr.trim().parse::<Ipv4Addr>().ok()?);
    if scope == 32 {
        return Some((base, base));
    }
    if !(8..=30).contains(&scope) {
        return None;
    }
    let mask = u32::MAX << (32 - scope);
    let low = base & mask;
    Some((low, low | !mask))
}
