/*
 * SPDX-FileCopyrightText: 2025 HavenDNS contributors
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Client-to-profile matching
//!
//! Each rule maps a source condition (CIDR prefix or hardware address) to
//! an upstream profile id. Lookup returns the first conditional rule that
//! matches; unconditioned rules act as the default, and when several
//! defaults are configured the last one wins.

use ipnet::IpNet;
use std::net::IpAddr;

use crate::dns::MacAddr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// Matches any client
    None,
    /// Matches when the client IP falls inside the prefix
    Cidr(IpNet),
    /// Matches when the client MAC equals the address
    Mac(MacAddr),
}

#[derive(Debug, Clone)]
pub struct ProfileRule {
    pub condition: Condition,
    pub profile_id: String,
}

impl ProfileRule {
    fn matches(&self, peer_ip: IpAddr, peer_mac: Option<MacAddr>) -> bool {
        match &self.condition {
            Condition::None => false, // defaults are handled separately
            Condition::Cidr(net) => net.contains(&peer_ip),
            Condition::Mac(mac) => peer_mac == Some(*mac),
        }
    }
}

/// Immutable, ordered profile rule list
#[derive(Debug, Clone, Default)]
pub struct ProfileMatcher {
    rules: Vec<ProfileRule>,
}

impl ProfileMatcher {
    pub fn new(rules: impl IntoIterator<Item = ProfileRule>) -> Self {
        let mut matcher = Self::default();
        for rule in rules {
            matcher.push(rule);
        }
        matcher
    }

    /// Append a rule, deduplicating by condition
    ///
    /// A rule whose condition is already present replaces the existing one
    /// in place, so re-parsing the same config leaves the list unchanged.
    /// For the unconditioned default this means the last-parsed one wins.
    pub fn push(&mut self, rule: ProfileRule) {
        if let Some(existing) = self.rules.iter_mut().find(|r| r.condition == rule.condition) {
            existing.profile_id = rule.profile_id;
        } else {
            self.rules.push(rule);
        }
    }

    /// Resolve a client to a profile id
    ///
    /// First conditional match wins; otherwise the default applies; with
    /// neither, the empty string selects an unprofiled upstream.
    pub fn lookup(&self, peer_ip: IpAddr, peer_mac: Option<MacAddr>) -> &str {
        let mut default = "";
        for rule in &self.rules {
            if rule.condition == Condition::None {
                default = &rule.profile_id;
            } else if rule.matches(peer_ip, peer_mac) {
                return &rule.profile_id;
            }
        }
        default
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
    use std::net::Ipv4Addr;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn cidr_rule(prefix: &str, profile: &str) -> ProfileRule {
        ProfileRule {
            condition: Condition::Cidr(prefix.parse().unwrap()),
            profile_id: profile.to_string(),
        }
    }

    fn default_rule(profile: &str) -> ProfileRule {
        ProfileRule {
            condition: Condition::None,
            profile_id: profile.to_string(),
        }
    }

    #[test]
    fn first_conditional_match_wins() {
        let matcher = ProfileMatcher::new([
            cidr_rule("10.0.0.0/24", "work"),
            cidr_rule("10.0.0.0/8", "broad"),
            default_rule("home"),
        ]);
        assert_eq!(matcher.lookup(ip("10.0.0.5"), None), "work");
        assert_eq!(matcher.lookup(ip("10.1.0.5"), None), "broad");
        assert_eq!(matcher.lookup(ip("8.8.8.8"), None), "home");
    }

    #[test]
    fn no_rules_yields_empty_profile() {
        let matcher = ProfileMatcher::default();
        assert_eq!(matcher.lookup(ip("10.0.0.5"), None), "");
    }

    #[test]
    fn mac_equality_is_a_match() {
        let mac: MacAddr = "aa:bb:cc:00:11:22".parse().unwrap();
        let matcher = ProfileMatcher::new([
            ProfileRule {
                condition: Condition::Mac(mac),
                profile_id: "kids".to_string(),
            },
            default_rule("home"),
        ]);
        assert_eq!(
            matcher.lookup(IpAddr::V4(Ipv4Addr::LOCALHOST), Some(mac)),
            "kids"
        );
        assert_eq!(matcher.lookup(IpAddr::V4(Ipv4Addr::LOCALHOST), None), "home");
    }

    #[test]
    fn duplicate_condition_replaces_in_place() {
        let mut matcher = ProfileMatcher::new([
            cidr_rule("10.0.0.0/24", "old"),
            default_rule("first-default"),
        ]);
        let before = matcher.len();
        matcher.push(cidr_rule("10.0.0.0/24", "new"));
        matcher.push(default_rule("second-default"));
        assert_eq!(matcher.len(), before);
        assert_eq!(matcher.lookup(ip("10.0.0.1"), None), "new");
        // Last-parsed default wins
        assert_eq!(matcher.lookup(ip("8.8.8.8"), None), "second-default");
    }

    #[test]
    fn absent_mac_does_not_veto_cidr_rule() {
        let matcher = ProfileMatcher::new([cidr_rule("192.168.0.0/16", "lan")]);
        assert_eq!(matcher.lookup(ip("192.168.1.7"), None), "lan");
    }
}
