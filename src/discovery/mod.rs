/*
 * SPDX-FileCopyrightText: 2025 HavenDNS contributors
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Local name discovery
//!
//! Aggregates a set of sources (hosts file, mDNS, DHCP leases, reverse
//! DNS) behind one resolver. Each source contributes whatever lookups it
//! implements; the default trait methods return empty so a source only
//! overrides what it knows. The resolver answers local PTR/A/AAAA queries
//! and supplies client identity for upstream request headers.

pub mod arp;
pub mod dhcp;
pub mod hosts;
pub mod mdns;
pub mod rdns;

use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;

use crate::dns::MacAddr;

/// One discovery source
///
/// All lookups default to empty; a source overrides the subset it can
/// answer. Implementations must be cheap on the query path (in-memory
/// map reads); anything slow belongs in the source's refresher.
#[async_trait]
pub trait Source: Send + Sync {
    fn name(&self) -> &'static str;

    /// Names for an address, most specific first
    async fn lookup_addr(&self, _ip: IpAddr) -> Vec<String> {
        Vec::new()
    }

    /// Addresses for a name (lowercase, trailing dot)
    async fn lookup_host(&self, _name: &str) -> Vec<IpAddr> {
        Vec::new()
    }

    /// Names for a hardware address
    async fn lookup_mac(&self, _mac: MacAddr) -> Vec<String> {
        Vec::new()
    }

    /// Walk every known (ip, names) pair
    fn visit(&self, _f: &mut dyn FnMut(IpAddr, &[String])) {}
}

/// Identity attached to upstream requests when `report-client-info` is on
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub id: String,
    pub ip: String,
    pub model: String,
    pub name: String,
}

/// Composite resolver over all configured sources
pub struct Discovery {
    sources: Vec<Arc<dyn Source>>,
}

impl Discovery {
    pub fn new(sources: Vec<Arc<dyn Source>>) -> Self {
        Self { sources }
    }

    /// First non-empty result across sources, in declared order
    pub async fn lookup_addr(&self, ip: IpAddr) -> Vec<String> {
        for source in &self.sources {
            let names = source.lookup_addr(ip).await;
            if !names.is_empty() {
                return names;
            }
        }
        Vec::new()
    }

    pub async fn lookup_host(&self, name: &str) -> Vec<IpAddr> {
        for source in &self.sources {
            let addrs = source.lookup_host(name).await;
            if !addrs.is_empty() {
                return addrs;
            }
        }
        Vec::new()
    }

    pub async fn lookup_mac(&self, mac: MacAddr) -> Vec<String> {
        for source in &self.sources {
            let names = source.lookup_mac(mac).await;
            if !names.is_empty() {
                return names;
            }
        }
        Vec::new()
    }

    /// Fan out to every source
    pub fn visit(&self, f: &mut dyn FnMut(IpAddr, &[String])) {
        for source in &self.sources {
            source.visit(f);
        }
    }

    /// Build the identity headers for a client
    ///
    /// The id is the MAC when known, otherwise the IP; the name comes from
    /// MAC lookup first (DHCP leases know it), then address lookup.
    pub async fn client_info(&self, ip: IpAddr, mac: Option<MacAddr>) -> ClientInfo {
        let mut info = ClientInfo {
            ip: ip.to_string(),
            ..Default::default()
        };
        if let Some(mac) = mac {
            info.id = mac.to_string();
            if let Some(name) = self.lookup_mac(mac).await.into_iter().next() {
                info.name = name;
            }
        } else {
            info.id = info.ip.clone();
        }
        if info.name.is_empty() {
            if let Some(name) = self.lookup_addr(ip).await.into_iter().next() {
                info.name = name;
            }
        }
        info.name = info.name.trim_end_matches('.').to_string();
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    struct Fixed {
        name: &'static str,
        names: Vec<String>,
    }

    #[async_trait]
    impl Source for Fixed {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn lookup_addr(&self, _ip: IpAddr) -> Vec<String> {
            self.names.clone()
        }
    }

    #[tokio::test]
    async fn first_non_empty_source_wins() {
        let discovery = Discovery::new(vec![
            Arc::new(Fixed {
                name: "empty",
                names: vec![],
            }),
            Arc::new(Fixed {
                name: "first",
                names: vec!["printer.local.".to_string()],
            }),
            Arc::new(Fixed {
                name: "second",
                names: vec!["other.local.".to_string()],
            }),
        ]);
        let names = discovery
            .lookup_addr(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 9)))
            .await;
        assert_eq!(names, vec!["printer.local.".to_string()]);
    }

    #[tokio::test]
    async fn client_info_falls_back_to_ip() {
        let discovery = Discovery::new(vec![]);
        let info = discovery
            .client_info(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)), None)
            .await;
        assert_eq!(info.id, "10.0.0.7");
        assert_eq!(info.ip, "10.0.0.7");
        assert!(info.name.is_empty());
    }

    #[tokio::test]
    async fn client_info_prefers_mac_id_and_strips_dot() {
        let mac: MacAddr = "aa:bb:cc:00:11:22".parse().unwrap();
        let discovery = Discovery::new(vec![Arc::new(Fixed {
            name: "fixed",
            names: vec!["laptop.lan.".to_string()],
        })]);
        let info = discovery
            .client_info(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)), Some(mac))
            .await;
        assert_eq!(info.id, "aa:bb:cc:00:11:22");
        assert_eq!(info.name, "laptop.lan");
    }
}
