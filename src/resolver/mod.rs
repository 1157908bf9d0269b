/*
 * SPDX-FileCopyrightText: 2025 HavenDNS contributors
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Query pipeline
//!
//! Order per query: bogus-private guard, hosts short-circuit, cache,
//! forwarder rules, DoH upstream. Forwarder results are never cached
//! (user-controlled resolvers may answer differently per context).
//! Any internal error becomes SERVFAIL for the client; the pipeline
//! itself never panics.

pub mod doh;

use arc_swap::ArcSwap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{cache_key, ResponseCache};
use crate::core::error::ProxyError;
use crate::discovery::Discovery;
use crate::dns::builder::{build_hosts_reply, build_ptr_reply, build_rcode_reply};
use crate::dns::ttl::min_ttl;
use crate::dns::{Query, Rcode, TYPE_A, TYPE_AAAA, TYPE_PTR};
use crate::rules::forwarders::ForwarderMatcher;
use crate::rules::profiles::ProfileMatcher;
use crate::transport::dns53;
use doh::DohClient;

/// Outcome of one resolution, ready for the response writer and the log
pub struct Resolution {
    pub payload: Vec<u8>,
    pub profile: String,
    pub from_cache: bool,
    pub upstream: &'static str,
    pub error: Option<String>,
}

impl Resolution {
    fn local(payload: Vec<u8>, upstream: &'static str) -> Self {
        Self {
            payload,
            profile: String::new(),
            from_cache: false,
            upstream,
            error: None,
        }
    }
}

pub struct Resolver {
    cache: Option<ResponseCache>,
    profiles: ArcSwap<ProfileMatcher>,
    forwarders: ArcSwap<ForwarderMatcher>,
    discovery: Arc<Discovery>,
    doh: DohClient,
    bogus_priv: bool,
    use_hosts: bool,
    timeout: Duration,
}

impl Resolver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: Option<ResponseCache>,
        profiles: ProfileMatcher,
        forwarders: ForwarderMatcher,
        discovery: Arc<Discovery>,
        doh: DohClient,
        bogus_priv: bool,
        use_hosts: bool,
        timeout: Duration,
    ) -> Self {
        Self {
            cache,
            profiles: ArcSwap::from_pointee(profiles),
            forwarders: ArcSwap::from_pointee(forwarders),
            discovery,
            doh,
            bogus_priv,
            use_hosts,
            timeout,
        }
    }

    /// Swap in fresh rule snapshots (config reload)
    pub fn set_rules(&self, profiles: ProfileMatcher, forwarders: ForwarderMatcher) {
        self.profiles.store(Arc::new(profiles));
        self.forwarders.store(Arc::new(forwarders));
    }

    pub fn cache(&self) -> Option<&ResponseCache> {
        self.cache.as_ref()
    }

    /// Resolve one query; always returns a writable response
    pub async fn resolve(&self, query: &Query) -> Resolution {
        // 1. PTRs for private ranges never leave the machine
        if self.bogus_priv && query.qtype == TYPE_PTR {
            if let Some(ip) = reverse_name_ip(&query.qname) {
                if is_private(&ip) {
                    if let Some(resolution) = self.answer_local_ptr(query, ip).await {
                        return resolution;
                    }
                    return Resolution::local(
                        build_rcode_reply(query, Rcode::NxDomain),
                        "local",
                    );
                }
            }
        }

        // 2. Hosts / local-discovery short-circuit
        if self.use_hosts {
            if let Some(resolution) = self.answer_local(query).await {
                return resolution;
            }
        }

        // 3. Cache
        let profile = self
            .profiles
            .load()
            .lookup(query.peer_ip, query.peer_mac)
            .to_string();
        let context = self.doh.cache_context(&profile);
        let key = cache_key(&context, query);
        if let Some(cache) = &self.cache {
            if let Some((payload, upstream)) = cache.get(key, query.id) {
                return Resolution {
                    payload,
                    profile,
                    from_cache: true,
                    upstream,
                    error: None,
                };
            }
        }

        // 4. Forwarder rules bypass both the DoH upstream and the cache
        if let Some(target) = self.forwarders.load().lookup(&query.qname) {
            return self.forward(query, &target.addrs).await;
        }

        // 5. Upstream
        match self.doh.resolve(query, &profile).await {
            Ok((payload, info)) => {
                if let Some(cache) = &self.cache {
                    if should_cache(&payload) {
                        cache.set(key, payload.clone(), info.upstream);
                    }
                }
                Resolution {
                    payload,
                    profile,
                    from_cache: false,
                    upstream: info.upstream,
                    error: None,
                }
            }
            Err(e) => Resolution {
                payload: build_rcode_reply(query, Rcode::ServFail),
                profile,
                from_cache: false,
                upstream: "",
                error: Some(e.to_string()),
            },
        }
    }

    async fn forward(&self, query: &Query, addrs: &[std::net::SocketAddr]) -> Resolution {
        let mut last_err: Option<ProxyError> = None;
        for addr in addrs {
            match dns53::exchange(*addr, &query.payload, self.timeout).await {
                Ok(mut reply) => {
                    if reply.len() >= 2 {
                        reply[0..2].copy_from_slice(&query.id.to_be_bytes());
                    }
                    return Resolution {
                        payload: reply,
                        profile: String::new(),
                        from_cache: false,
                        upstream: "dns53",
                        error: None,
                    };
                }
                Err(e) => last_err = Some(e),
            }
        }
        Resolution {
            payload: build_rcode_reply(query, Rcode::ServFail),
            profile: String::new(),
            from_cache: false,
            upstream: "dns53",
            error: last_err.map(|e| e.to_string()),
        }
    }

    async fn answer_local(&self, query: &Query) -> Option<Resolution> {
        match query.qtype {
            TYPE_A | TYPE_AAAA => {
                let ips = self.discovery.lookup_host(&query.qname).await;
                if ips.is_empty() {
                    return None;
                }
                Some(Resolution::local(build_hosts_reply(query, &ips), "local"))
            }
            TYPE_PTR => {
                let ip = reverse_name_ip(&query.qname)?;
                self.answer_local_ptr(query, ip).await
            }
            _ => None,
        }
    }

    async fn answer_local_ptr(&self, query: &Query, ip: IpAddr) -> Option<Resolution> {
        let names = self.discovery.lookup_addr(ip).await;
        if names.is_empty() {
            return None;
        }
        Some(Resolution::local(build_ptr_reply(query, &names), "local"))
    }
}

/// Worth caching: a complete NOERROR response with a positive minimum TTL
fn should_cache(payload: &[u8]) -> bool {
    if payload.len() < 12 || payload[3] & 0x0F != 0 {
        return false;
    }
    matches!(min_ttl(payload), Some(ttl) if ttl > 0)
}

/// Decode `d.c.b.a.in-addr.arpa.` / nibble `ip6.arpa.` names
pub fn reverse_name_ip(qname: &str) -> Option<IpAddr> {
    if let Some(prefix) = qname.strip_suffix(".in-addr.arpa.") {
        let mut octets = [0u8; 4];
        let mut count = 0;
        for part in prefix.split('.') {
            if count == 4 {
                return None;
            }
            octets[count] = part.parse().ok()?;
            count += 1;
        }
        if count != 4 {
            return None;
        }
        octets.reverse();
        return Some(IpAddr::V4(Ipv4Addr::from(octets)));
    }
    if let Some(prefix) = qname.strip_suffix(".ip6.arpa.") {
        let nibbles: Vec<u8> = prefix
            .split('.')
            .map(|part| {
                if part.len() == 1 {
                    u8::from_str_radix(part, 16).ok()
                } else {
                    None
                }
            })
            .collect::<Option<Vec<u8>>>()?;
        if nibbles.len() != 32 {
            return None;
        }
        let mut octets = [0u8; 16];
        for (i, pair) in nibbles.rchunks(2).enumerate() {
            // Nibbles arrive least-significant first
            octets[i] = (pair[1] << 4) | pair[0];
        }
        return Some(IpAddr::V6(Ipv6Addr::from(octets)));
    }
    None
}

/// Private, loopback and link-local ranges (the RFC 6303 zones)
fn is_private(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverse_v4_names_decode() {
        assert_eq!(
            reverse_name_ip("1.1.168.192.in-addr.arpa."),
            Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)))
        );
        assert_eq!(
            reverse_name_ip("8.8.8.8.in-addr.arpa."),
            Some(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)))
        );
        assert_eq!(reverse_name_ip("1.168.192.in-addr.arpa."), None);
        assert_eq!(reverse_name_ip("example.com."), None);
    }

    #[test]
    fn reverse_v6_names_decode() {
        // ::1
        let name = format!("{}ip6.arpa.", "1.".to_string() + &"0.".repeat(31));
        assert_eq!(
            reverse_name_ip(&name),
            Some(IpAddr::V6(Ipv6Addr::LOCALHOST))
        );
    }

    #[test]
    fn private_ranges() {
        assert!(is_private(&"192.168.1.1".parse().unwrap()));
        assert!(is_private(&"10.1.2.3".parse().unwrap()));
        assert!(is_private(&"172.20.0.1".parse().unwrap()));
        assert!(is_private(&"127.0.0.1".parse().unwrap()));
        assert!(is_private(&"169.254.1.1".parse().unwrap()));
        assert!(is_private(&"fe80::1".parse().unwrap()));
        assert!(!is_private(&"8.8.8.8".parse().unwrap()));
    }

    mod pipeline {
        use super::super::*;
        use crate::cache::ResponseCache;
        use crate::core::app_clock::AppClock;
        use crate::discovery::Source;
        use crate::dns::builder::encode_name;
        use crate::dns::parser::parse_query;
        use crate::endpoint::manager::Manager;
        use crate::endpoint::provider::StaticProvider;
        use crate::endpoint::Endpoint;
        use crate::rules::forwarders::{ForwardTarget, ForwarderRule};
        use crate::rules::profiles::{Condition, ProfileRule};
        use crate::transport::{DohRequest, DohResponse, Transport};
        use async_trait::async_trait;
        use bytes::Bytes;
        use http::Method;
        use std::net::SocketAddr;
        use std::sync::atomic::{AtomicUsize, Ordering};

        /// Upstream that answers every POST with one fixed A record and
        /// counts how many it served (probe GETs are not counted)
        struct CountingUpstream {
            queries: AtomicUsize,
        }

        #[async_trait]
        impl Transport for CountingUpstream {
            fn label(&self) -> &'static str {
                "mock"
            }

            async fn round_trip(&self, req: DohRequest) -> crate::core::error::Result<DohResponse> {
                if req.method == Method::POST {
                    self.queries.fetch_add(1, Ordering::Relaxed);
                }
                Ok(DohResponse {
                    status: 200,
                    body: Bytes::from(answer(300)),
                })
            }
        }

        /// NOERROR response with one 203.0.113.1 answer
        fn answer(ttl: u32) -> Vec<u8> {
            let mut msg = Vec::new();
            msg.extend_from_slice(&[0x99, 0x99, 0x81, 0x80, 0, 1, 0, 1, 0, 0, 0, 0]);
            msg.extend_from_slice(&encode_name("example.com"));
            msg.extend_from_slice(&[0, 1, 0, 1]);
            msg.extend_from_slice(&[0xC0, 0x0C, 0, 1, 0, 1]);
            msg.extend_from_slice(&ttl.to_be_bytes());
            msg.extend_from_slice(&[0, 4, 203, 0, 113, 1]);
            msg
        }

        fn query(name: &str, qtype: u16, peer: &str) -> Query {
            let mut raw = Vec::new();
            raw.extend_from_slice(&0x4242u16.to_be_bytes());
            raw.extend_from_slice(&[0x01, 0x00]);
            raw.extend_from_slice(&[0, 1, 0, 0, 0, 0, 0, 0]);
            raw.extend_from_slice(&encode_name(name));
            raw.extend_from_slice(&qtype.to_be_bytes());
            raw.extend_from_slice(&[0, 1]);
            parse_query(Bytes::from(raw), peer.parse().unwrap()).unwrap()
        }

        async fn resolver_with(
            profiles: ProfileMatcher,
            forwarders: ForwarderMatcher,
            sources: Vec<Arc<dyn Source>>,
            bogus_priv: bool,
        ) -> (Resolver, Arc<CountingUpstream>) {
            AppClock::start();
            let upstream = Arc::new(CountingUpstream {
                queries: AtomicUsize::new(0),
            });
            let endpoint = Endpoint::doh("dns.test.example", "/", vec![]);
            if let Endpoint::Doh(doh) = &endpoint {
                doh.attach_transport(upstream.clone());
            }
            let manager = Manager::new(
                vec![Arc::new(StaticProvider::new(vec![endpoint]))],
                false,
            );
            assert!(manager.test_once().await);
            let discovery = Arc::new(Discovery::new(sources));
            let doh = DohClient::new(
                manager,
                Arc::clone(&discovery),
                false,
                Duration::from_secs(5),
            );
            let resolver = Resolver::new(
                Some(ResponseCache::new(1 << 20, None)),
                profiles,
                forwarders,
                discovery,
                doh,
                bogus_priv,
                true,
                Duration::from_secs(2),
            );
            (resolver, upstream)
        }

        struct FixedHost;

        #[async_trait]
        impl Source for FixedHost {
            fn name(&self) -> &'static str {
                "fixed"
            }

            async fn lookup_host(&self, name: &str) -> Vec<IpAddr> {
                if name == "printer.lan." {
                    vec![IpAddr::V4(Ipv4Addr::new(192, 168, 1, 9))]
                } else {
                    Vec::new()
                }
            }
        }

        #[tokio::test]
        async fn local_names_never_reach_the_upstream() {
            let (resolver, upstream) = resolver_with(
                ProfileMatcher::default(),
                ForwarderMatcher::default(),
                vec![Arc::new(FixedHost)],
                false,
            )
            .await;

            let q = query("printer.lan.", TYPE_A, "192.168.1.20");
            for _ in 0..2 {
                let resolution = resolver.resolve(&q).await;
                assert_eq!(resolution.upstream, "local");
                assert!(!resolution.from_cache);
                assert_eq!(&resolution.payload[0..2], &q.id.to_be_bytes());
            }
            assert_eq!(upstream.queries.load(Ordering::Relaxed), 0);
        }

        #[tokio::test]
        async fn second_lookup_is_a_cache_hit() {
            let (resolver, upstream) = resolver_with(
                ProfileMatcher::default(),
                ForwarderMatcher::default(),
                vec![],
                false,
            )
            .await;

            let q = query("example.com.", TYPE_A, "192.0.2.10");
            let first = resolver.resolve(&q).await;
            assert!(!first.from_cache);
            assert_eq!(first.upstream, "mock");
            assert_eq!(upstream.queries.load(Ordering::Relaxed), 1);

            let second = resolver.resolve(&q).await;
            assert!(second.from_cache);
            assert_eq!(&second.payload[0..2], &q.id.to_be_bytes());
            // The hit did not trigger a second upstream exchange
            assert_eq!(upstream.queries.load(Ordering::Relaxed), 1);
        }

        #[tokio::test]
        async fn forwarder_answers_are_not_cached() {
            let hits = Arc::new(AtomicUsize::new(0));
            let server_hits = Arc::clone(&hits);
            let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let addr: SocketAddr = socket.local_addr().unwrap();
            tokio::spawn(async move {
                let mut buf = [0u8; 512];
                while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
                    server_hits.fetch_add(1, Ordering::Relaxed);
                    let mut reply = buf[..n].to_vec();
                    reply[2] |= 0x80;
                    let _ = socket.send_to(&reply, peer).await;
                }
            });

            let (resolver, upstream) = resolver_with(
                ProfileMatcher::default(),
                ForwarderMatcher::new([ForwarderRule {
                    domain: Some("lan.".to_string()),
                    target: ForwardTarget { addrs: vec![addr] },
                }]),
                vec![],
                false,
            )
            .await;

            let q = query("nas.lan.", TYPE_A, "192.168.1.20");
            for _ in 0..2 {
                let resolution = resolver.resolve(&q).await;
                assert_eq!(resolution.upstream, "dns53");
                assert!(!resolution.from_cache);
            }
            // Both lookups hit the forwarder; none went to DoH
            assert_eq!(hits.load(Ordering::Relaxed), 2);
            assert_eq!(upstream.queries.load(Ordering::Relaxed), 0);
        }

        #[tokio::test]
        async fn private_ptr_is_answered_locally() {
            let (resolver, upstream) = resolver_with(
                ProfileMatcher::default(),
                ForwarderMatcher::default(),
                vec![],
                true,
            )
            .await;

            let q = query("1.1.168.192.in-addr.arpa.", TYPE_PTR, "192.168.1.20");
            let resolution = resolver.resolve(&q).await;
            assert_eq!(resolution.upstream, "local");
            // No local name known: NXDOMAIN, still without an upstream trip
            assert_eq!(resolution.payload[3] & 0x0F, Rcode::NxDomain as u8);
            assert_eq!(upstream.queries.load(Ordering::Relaxed), 0);
        }

        #[tokio::test]
        async fn profiles_route_and_partition_the_cache() {
            let (resolver, upstream) = resolver_with(
                ProfileMatcher::new([
                    ProfileRule {
                        condition: Condition::Cidr("10.0.0.0/8".parse().unwrap()),
                        profile_id: "work".to_string(),
                    },
                    ProfileRule {
                        condition: Condition::None,
                        profile_id: "home".to_string(),
                    },
                ]),
                ForwarderMatcher::default(),
                vec![],
                false,
            )
            .await;

            let work = resolver.resolve(&query("example.com.", TYPE_A, "10.0.0.5")).await;
            assert_eq!(work.profile, "work");
            assert_eq!(upstream.queries.load(Ordering::Relaxed), 1);

            // A different profile misses the first client's cache entry
            let home = resolver.resolve(&query("example.com.", TYPE_A, "192.168.1.5")).await;
            assert_eq!(home.profile, "home");
            assert!(!home.from_cache);
            assert_eq!(upstream.queries.load(Ordering::Relaxed), 2);

            // Same profile again: served from cache
            let again = resolver.resolve(&query("example.com.", TYPE_A, "10.0.0.7")).await;
            assert_eq!(again.profile, "work");
            assert!(again.from_cache);
            assert_eq!(upstream.queries.load(Ordering::Relaxed), 2);
        }
    }

    #[test]
    fn cacheability() {
        use crate::dns::builder::encode_name;
        // NOERROR with one 300s answer
        let mut msg = Vec::new();
        msg.extend_from_slice(&[0, 1, 0x81, 0x80, 0, 1, 0, 1, 0, 0, 0, 0]);
        msg.extend_from_slice(&encode_name("example.com"));
        msg.extend_from_slice(&[0, 1, 0, 1]);
        msg.extend_from_slice(&[0xC0, 0x0C, 0, 1, 0, 1]);
        msg.extend_from_slice(&300u32.to_be_bytes());
        msg.extend_from_slice(&[0, 4, 1, 2, 3, 4]);
        assert!(should_cache(&msg));

        // SERVFAIL is never cached
        let mut servfail = msg.clone();
        servfail[3] = 0x82;
        assert!(!should_cache(&servfail));

        // Zero TTL is not worth storing
        let ttl_off = 12 + 13 + 4 + 2 + 4;
        msg[ttl_off..ttl_off + 4].copy_from_slice(&0u32.to_be_bytes());
        assert!(!should_cache(&msg));
    }
}
