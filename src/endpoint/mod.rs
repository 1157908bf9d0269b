/*
 * SPDX-FileCopyrightText: 2025 HavenDNS contributors
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Upstream endpoints
//!
//! An endpoint is either a DoH target (hostname + path + bootstrap IPs)
//! or a plain DNS53 address used as last-resort fallback. DoH equality is
//! by (hostname, path): the same service reached through different
//! bootstrap IPs is the same endpoint, which is what lets the manager
//! keep a live connection pool across provider refreshes.

pub mod manager;
pub mod provider;

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock};

use crate::transport::h2::H2Transport;
use crate::transport::Transport;

const DOH_PORT: u16 = 443;

pub struct DohEndpoint {
    pub hostname: String,
    /// URL path, normalized to a leading slash; empty means "/"
    pub path: String,
    pub bootstrap: Vec<IpAddr>,
    pub fastest_ip: Option<IpAddr>,
    /// Attached lazily; owns the connection pool, released with the endpoint
    transport: RwLock<Option<Arc<dyn Transport>>>,
}

impl DohEndpoint {
    pub fn new(hostname: String, path: String, bootstrap: Vec<IpAddr>) -> Self {
        let path = if path.is_empty() || !path.starts_with('/') {
            format!("/{path}")
        } else {
            path
        };
        Self {
            hostname,
            path,
            bootstrap,
            fastest_ip: None,
            transport: RwLock::new(None),
        }
    }

    /// Current transport, attaching an HTTP/2 one on first use
    pub fn transport(&self) -> Arc<dyn Transport> {
        if let Some(t) = self.transport.read().expect("transport lock").as_ref() {
            return Arc::clone(t);
        }
        let mut slot = self.transport.write().expect("transport lock");
        if let Some(t) = slot.as_ref() {
            return Arc::clone(t);
        }
        let t: Arc<dyn Transport> = Arc::new(H2Transport::new(
            self.hostname.clone(),
            DOH_PORT,
            self.bootstrap.clone(),
        ));
        *slot = Some(Arc::clone(&t));
        t
    }

    /// Swap in a different transport (the H3 capability probe uses this)
    pub fn attach_transport(&self, transport: Arc<dyn Transport>) {
        *self.transport.write().expect("transport lock") = Some(transport);
    }
}

impl fmt::Debug for DohEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DohEndpoint")
            .field("hostname", &self.hostname)
            .field("path", &self.path)
            .field("bootstrap", &self.bootstrap)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum Endpoint {
    /// Plain DNS53 fallback
    Dns(SocketAddr),
    Doh(Arc<DohEndpoint>),
}

impl Endpoint {
    pub fn doh(hostname: impl Into<String>, path: impl Into<String>, bootstrap: Vec<IpAddr>) -> Self {
        Endpoint::Doh(Arc::new(DohEndpoint::new(
            hostname.into(),
            path.into(),
            bootstrap,
        )))
    }

    /// Short label for logs
    pub fn label(&self) -> String {
        match self {
            Endpoint::Dns(addr) => format!("dns://{addr}"),
            Endpoint::Doh(doh) => format!("https://{}{}", doh.hostname, doh.path),
        }
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Endpoint::Dns(a), Endpoint::Dns(b)) => a == b,
            // Bootstrap IPs are reachability hints, not identity
            (Endpoint::Doh(a), Endpoint::Doh(b)) => {
                a.hostname == b.hostname && a.path == b.path
            }
            _ => false,
        }
    }
}

impl Eq for Endpoint {}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doh_equality_ignores_bootstrap() {
        let a = Endpoint::doh("dns.example", "/abc", vec!["1.1.1.1".parse().unwrap()]);
        let b = Endpoint::doh("dns.example", "/abc", vec!["9.9.9.9".parse().unwrap()]);
        let c = Endpoint::doh("dns.example", "/other", vec![]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn dns_equality_is_by_address() {
        let a = Endpoint::Dns("1.1.1.1:53".parse().unwrap());
        let b = Endpoint::Dns("1.1.1.1:53".parse().unwrap());
        let c = Endpoint::Dns("8.8.8.8:53".parse().unwrap());
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, Endpoint::doh("dns.example", "/", vec![]));
    }

    #[test]
    fn path_is_normalized() {
        let e = DohEndpoint::new("dns.example".into(), "abc".into(), vec![]);
        assert_eq!(e.path, "/abc");
        let e = DohEndpoint::new("dns.example".into(), "".into(), vec![]);
        assert_eq!(e.path, "/");
    }
}
