/*
 * SPDX-FileCopyrightText: 2025 HavenDNS contributors
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Domain-to-resolver forwarding rules
//!
//! Routes specific domain subtrees to user-provided plain-DNS resolvers
//! instead of the DoH upstream. Matching is exact or a suffix at a label
//! boundary; the first matching rule wins, and a rule without a domain is
//! the catch-all (conventionally last).

use std::net::SocketAddr;

/// Destination resolvers for one forwarding rule
///
/// Addresses are tried in order; port 53 is implied when absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    pub addrs: Vec<SocketAddr>,
}

#[derive(Debug, Clone)]
pub struct ForwarderRule {
    /// Absolute domain (lowercase, trailing dot); `None` matches everything
    pub domain: Option<String>,
    pub target: ForwardTarget,
}

impl ForwarderRule {
    fn matches(&self, qname: &str) -> bool {
        match &self.domain {
            None => true,
            Some(domain) => {
                qname == domain
                    || qname
                        .strip_suffix(domain.as_str())
                        .is_some_and(|rest| rest.ends_with('.'))
            }
        }
    }
}

/// Immutable, ordered forwarder rule list
#[derive(Debug, Clone, Default)]
pub struct ForwarderMatcher {
    rules: Vec<ForwarderRule>,
}

impl ForwarderMatcher {
    pub fn new(rules: impl IntoIterator<Item = ForwarderRule>) -> Self {
        let mut matcher = Self::default();
        for rule in rules {
            matcher.push(rule);
        }
        matcher
    }

    /// Append a rule; an existing rule for the same domain is replaced in
    /// place so that config reloads are idempotent and order-preserving.
    pub fn push(&mut self, rule: ForwarderRule) {
        if let Some(existing) = self.rules.iter_mut().find(|r| r.domain == rule.domain) {
            existing.target = rule.target;
        } else {
            self.rules.push(rule);
        }
    }

    /// First rule matching `qname` (lowercase, trailing dot)
    pub fn lookup(&self, qname: &str) -> Option<&ForwardTarget> {
        self.rules
            .iter()
            .find(|rule| rule.matches(qname))
            .map(|rule| &rule.target)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(domain: Option<&str>, addr: &str) -> ForwarderRule {
        ForwarderRule {
            domain: domain.map(|d| d.to_string()),
            target: ForwardTarget {
                addrs: vec![addr.parse().unwrap()],
            },
        }
    }

    #[test]
    fn exact_and_subdomain_match() {
        let matcher = ForwarderMatcher::new([rule(Some("corp.example."), "10.0.0.1:53")]);
        assert!(matcher.lookup("corp.example.").is_some());
        assert!(matcher.lookup("host.corp.example.").is_some());
        assert!(matcher.lookup("deep.host.corp.example.").is_some());
    }

    #[test]
    fn suffix_must_fall_on_label_boundary() {
        let matcher = ForwarderMatcher::new([rule(Some("corp.example."), "10.0.0.1:53")]);
        // "notcorp.example." ends with "corp.example." but not at a dot
        assert!(matcher.lookup("notcorp.example.").is_none());
        assert!(matcher.lookup("example.").is_none());
    }

    #[test]
    fn first_match_wins() {
        let matcher = ForwarderMatcher::new([
            rule(Some("a.corp.example."), "10.0.0.1:53"),
            rule(Some("corp.example."), "10.0.0.2:53"),
        ]);
        let target = matcher.lookup("x.a.corp.example.").unwrap();
        assert_eq!(target.addrs[0], "10.0.0.1:53".parse().unwrap());
    }

    #[test]
    fn catch_all_matches_everything() {
        let matcher = ForwarderMatcher::new([
            rule(Some("corp.example."), "10.0.0.1:53"),
            rule(None, "192.168.1.1:53"),
        ]);
        let target = matcher.lookup("unrelated.org.").unwrap();
        assert_eq!(target.addrs[0], "192.168.1.1:53".parse().unwrap());
    }

    #[test]
    fn same_domain_replaces_in_place() {
        let mut matcher = ForwarderMatcher::new([
            rule(Some("a.example."), "10.0.0.1:53"),
            rule(Some("b.example."), "10.0.0.2:53"),
        ]);
        matcher.push(rule(Some("a.example."), "10.9.9.9:53"));
        assert_eq!(matcher.len(), 2);
        let target = matcher.lookup("a.example.").unwrap();
        assert_eq!(target.addrs[0], "10.9.9.9:53".parse().unwrap());
        // Order preserved: a.example. still evaluated before b.example.
        let target = matcher.lookup("x.a.example.").unwrap();
        assert_eq!(target.addrs[0], "10.9.9.9:53".parse().unwrap());
    }

    #[test]
    fn no_match_without_rules() {
        assert!(ForwarderMatcher::default().lookup("example.com.").is_none());
    }
}
