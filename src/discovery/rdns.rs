/*
 * SPDX-FileCopyrightText: 2025 HavenDNS contributors
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Reverse-DNS source
//!
//! Resolves PTR (and forward A/AAAA) through a private-IP system resolver,
//! when one exists. Results are cached for five minutes. Each in-flight
//! lookup holds a per-key slot acquired by try-insert: a lookup that
//! re-enters itself (a PTR answer that triggers reverse resolution of the
//! same key) finds the slot taken and short-circuits to empty instead of
//! deadlocking.

use async_trait::async_trait;
use dashmap::DashSet;
use hickory_proto::op::{Message, MessageType, Query as ProtoQuery};
use hickory_proto::rr::{Name, RData, RecordType};
use moka::sync::Cache;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::discovery::Source;
use crate::transport::dns53;

const CACHE_TTL: Duration = Duration::from_secs(300);
const CACHE_MAX_ENTRIES: u64 = 10_000;
const QUERY_TIMEOUT: Duration = Duration::from_secs(2);

pub struct RdnsSource {
    /// Private-IP system resolver; absent when none is configured
    upstream: Option<SocketAddr>,
    addr_cache: Cache<IpAddr, Arc<Vec<String>>>,
    host_cache: Cache<String, Arc<Vec<IpAddr>>>,
    inflight: DashSet<String>,
}

impl RdnsSource {
    /// Pick the first private-IP resolver from the system configuration
    pub fn new() -> Arc<Self> {
        let upstream = dns53::system_resolvers()
            .into_iter()
            .find(is_private)
            .map(|ip| SocketAddr::new(ip, 53));
        Self::with_upstream(upstream)
    }

    pub fn with_upstream(upstream: Option<SocketAddr>) -> Arc<Self> {
        Arc::new(Self {
            upstream,
            addr_cache: Cache::builder()
                .max_capacity(CACHE_MAX_ENTRIES)
                .time_to_live(CACHE_TTL)
                .build(),
            host_cache: Cache::builder()
                .max_capacity(CACHE_MAX_ENTRIES)
                .time_to_live(CACHE_TTL)
                .build(),
            inflight: DashSet::new(),
        })
    }

    async fn query(&self, name: Name, rtype: RecordType) -> Vec<Record> {
        let upstream = match self.upstream {
            Some(addr) => addr,
            None => return Vec::new(),
        };
        let mut msg = Message::new();
        msg.set_id(rand::random());
        msg.set_message_type(MessageType::Query);
        msg.set_recursion_desired(true);
        msg.add_query(ProtoQuery::query(name, rtype));
        let payload = match msg.to_vec() {
            Ok(p) => p,
            Err(_) => return Vec::new(),
        };

        let reply = match dns53::exchange_udp(upstream, &payload, QUERY_TIMEOUT).await {
            Ok(reply) => reply,
            Err(e) => {
                debug!(upstream = %upstream, error = %e, "reverse lookup failed");
                return Vec::new();
            }
        };
        let parsed = match Message::from_vec(&reply) {
            Ok(m) => m,
            Err(_) => return Vec::new(),
        };
        parsed
            .answers()
            .iter()
            .filter_map(|rr| match rr.data() {
                RData::PTR(ptr) => Some(Record::Name(ptr.0.to_ascii().to_ascii_lowercase())),
                RData::A(a) => Some(Record::Addr(IpAddr::V4(a.0))),
                RData::AAAA(aaaa) => Some(Record::Addr(IpAddr::V6(aaaa.0))),
                _ => None,
            })
            .collect()
    }
}

enum Record {
    Name(String),
    Addr(IpAddr),
}

fn is_private(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00 || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

#[async_trait]
impl Source for RdnsSource {
    fn name(&self) -> &'static str {
        "rdns"
    }

    async fn lookup_addr(&self, ip: IpAddr) -> Vec<String> {
        if let Some(cached) = self.addr_cache.get(&ip) {
            return cached.as_ref().clone();
        }
        let key = format!("addr:{ip}");
        if !self.inflight.insert(key.clone()) {
            // Re-entrant lookup of the same key: break the cycle.
            return Vec::new();
        }
        let names: Vec<String> = self
            .query(Name::from(ip), RecordType::PTR)
            .await
            .into_iter()
            .filter_map(|r| match r {
                Record::Name(n) => Some(n),
                Record::Addr(_) => None,
            })
            .collect();
        self.inflight.remove(&key);
        self.addr_cache.insert(ip, Arc::new(names.clone()));
        names
    }

    async fn lookup_host(&self, name: &str) -> Vec<IpAddr> {
        let name = name.to_ascii_lowercase();
        if let Some(cached) = self.host_cache.get(&name) {
            return cached.as_ref().clone();
        }
        let proto_name = match Name::from_str(&name) {
            Ok(n) => n,
            Err(_) => return Vec::new(),
        };
        let key = format!("host:{name}");
        if !self.inflight.insert(key.clone()) {
            return Vec::new();
        }
        let mut addrs: Vec<IpAddr> = self
            .query(proto_name.clone(), RecordType::A)
            .await
            .into_iter()
            .filter_map(|r| match r {
                Record::Addr(a) => Some(a),
                Record::Name(_) => None,
            })
            .collect();
        addrs.extend(
            self.query(proto_name, RecordType::AAAA)
                .await
                .into_iter()
                .filter_map(|r| match r {
                    Record::Addr(a) => Some(a),
                    Record::Name(_) => None,
                }),
        );
        self.inflight.remove(&key);
        self.host_cache.insert(name, Arc::new(addrs.clone()));
        addrs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn private_resolver_detection() {
        assert!(is_private(&"192.168.1.1".parse().unwrap()));
        assert!(is_private(&"10.0.0.1".parse().unwrap()));
        assert!(is_private(&"127.0.0.1".parse().unwrap()));
        assert!(is_private(&"fe80::1".parse().unwrap()));
        assert!(is_private(&"fd00::1".parse().unwrap()));
        assert!(!is_private(&"8.8.8.8".parse().unwrap()));
        assert!(!is_private(&"2001:4860:4860::8888".parse().unwrap()));
    }

    #[tokio::test]
    async fn no_upstream_means_empty() {
        let source = RdnsSource::with_upstream(None);
        let names = source
            .lookup_addr(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)))
            .await;
        assert!(names.is_empty());
    }

    #[tokio::test]
    async fn inflight_key_blocks_reentry() {
        let source = RdnsSource::with_upstream(None);
        let ip = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1));
        // Simulate a lookup already in flight for the key
        source.inflight.insert(format!("addr:{ip}"));
        // The cache is empty so this would normally query; the held slot
        // forces the empty short-circuit instead.
        assert!(source.addr_cache.get(&ip).is_none());
        let names = source.lookup_addr(ip).await;
        assert!(names.is_empty());
        // The slot is still owned by the original (simulated) caller
        assert!(source.inflight.contains(&format!("addr:{ip}")));
    }
}
