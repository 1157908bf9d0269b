/*
 * SPDX-FileCopyrightText: 2025 HavenDNS contributors
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! mDNS source
//!
//! Joins the link-local multicast groups on every up, multicast-capable,
//! non-loopback interface and periodically probes a fixed set of
//! well-known service types. Replies are mined for A/AAAA records, which
//! map device names to their LAN addresses. The probe interval backs off
//! from 4 s to 60 s; entries are capped and the oldest are evicted first.

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, Query as ProtoQuery};
use hickory_proto::rr::{Name, RData, RecordType};
use moka::sync::Cache;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::discovery::Source;

const MDNS_PORT: u16 = 5353;
const MDNS_GROUP_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
const MDNS_GROUP_V6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xfb);

const PROBE_BACKOFF_START: Duration = Duration::from_secs(4);
const PROBE_BACKOFF_MAX: Duration = Duration::from_secs(60);
const DEFAULT_MAX_ENTRIES: u64 = 10_000;

/// Service types worth probing: they cover the bulk of named LAN devices
const SERVICE_TYPES: &[&str] = &[
    "_hap._tcp.local.",
    "_airplay._tcp.local.",
    "_raop._tcp.local.",
    "_googlecast._tcp.local.",
    "_companion-link._tcp.local.",
    "_workstation._tcp.local.",
    "_smb._tcp.local.",
    "_printer._tcp.local.",
];

pub struct MdnsSource {
    by_ip: Cache<IpAddr, String>,
    by_name: Cache<String, Vec<IpAddr>>,
}

impl MdnsSource {
    pub fn new(max_entries: Option<u64>) -> Arc<Self> {
        let cap = max_entries.unwrap_or(DEFAULT_MAX_ENTRIES);
        Arc::new(Self {
            by_ip: Cache::builder().max_capacity(cap).build(),
            by_name: Cache::builder().max_capacity(cap).build(),
        })
    }

    /// Start the reader and prober tasks
    ///
    /// Joining a group can fail per interface (no permission, odd virtual
    /// devices); those interfaces are skipped with a warning rather than
    /// failing discovery outright.
    pub fn start(self: &Arc<Self>) {
        let v4 = match multicast_socket_v4() {
            Ok(socket) => Some(Arc::new(socket)),
            Err(e) => {
                warn!(error = %e, "mdns ipv4 socket unavailable");
                None
            }
        };
        let v6 = match multicast_socket_v6() {
            Ok(socket) => Some(Arc::new(socket)),
            Err(e) => {
                debug!(error = %e, "mdns ipv6 socket unavailable");
                None
            }
        };

        for socket in [v4.clone(), v6.clone()].into_iter().flatten() {
            let source = Arc::clone(self);
            tokio::spawn(async move {
                source.read_loop(socket).await;
            });
        }

        tokio::spawn(async move {
            let mut backoff = PROBE_BACKOFF_START;
            loop {
                for service in SERVICE_TYPES {
                    if let Some(probe) = build_probe(service) {
                        if let Some(socket) = &v4 {
                            let dest =
                                SocketAddr::V4(SocketAddrV4::new(MDNS_GROUP_V4, MDNS_PORT));
                            let _ = socket.send_to(&probe, dest).await;
                        }
                        if let Some(socket) = &v6 {
                            let dest = SocketAddr::V6(SocketAddrV6::new(
                                MDNS_GROUP_V6,
                                MDNS_PORT,
                                0,
                                0,
                            ));
                            let _ = socket.send_to(&probe, dest).await;
                        }
                    }
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(PROBE_BACKOFF_MAX);
            }
        });
    }

    async fn read_loop(&self, socket: Arc<UdpSocket>) {
        let mut buf = vec![0u8; 9000];
        loop {
            let n = match socket.recv_from(&mut buf).await {
                Ok((n, _)) => n,
                Err(e) => {
                    debug!(error = %e, "mdns read error");
                    continue;
                }
            };
            let msg = match Message::from_vec(&buf[..n]) {
                Ok(m) => m,
                Err(_) => continue,
            };
            self.absorb(&msg);
        }
    }

    /// Harvest A/AAAA records from a reply
    ///
    /// Device addresses usually arrive in the additional section alongside
    /// the PTR/SRV answers, but some responders put them in answers.
    fn absorb(&self, msg: &Message) {
        for rr in msg.answers().iter().chain(msg.additionals()) {
            let addr = match rr.data() {
                RData::A(a) => IpAddr::V4(a.0),
                RData::AAAA(aaaa) => IpAddr::V6(aaaa.0),
                _ => continue,
            };
            let name = rr.name().to_ascii().to_ascii_lowercase();
            if name.is_empty() || name == "." {
                continue;
            }
            self.by_ip.insert(addr, name.clone());
            let mut addrs = self.by_name.get(&name).unwrap_or_default();
            if !addrs.contains(&addr) {
                addrs.push(addr);
            }
            self.by_name.insert(name, addrs);
        }
    }
}

fn build_probe(service: &str) -> Option<Vec<u8>> {
    let name = Name::from_str(service).ok()?;
    let mut msg = Message::new();
    msg.set_message_type(MessageType::Query);
    msg.add_query(ProtoQuery::query(name, RecordType::PTR));
    msg.to_vec().ok()
}

fn multicast_socket_v4() -> crate::core::error::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, MDNS_PORT)).into())?;
    for iface in eligible_interfaces() {
        for ipv4 in iface.ipv4 {
            let _ = socket.join_multicast_v4(&MDNS_GROUP_V4, &ipv4.addr());
        }
    }
    Ok(UdpSocket::from_std(socket.into())?)
}

fn multicast_socket_v6() -> crate::core::error::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.set_reuse_address(true)?;
    socket.set_only_v6(true)?;
    socket.bind(
        &SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, MDNS_PORT, 0, 0)).into(),
    )?;
    for iface in eligible_interfaces() {
        let _ = socket.join_multicast_v6(&MDNS_GROUP_V6, iface.index);
    }
    Ok(UdpSocket::from_std(socket.into())?)
}

/// Up, multicast-capable, non-loopback interfaces
fn eligible_interfaces() -> Vec<netdev::Interface> {
    netdev::get_interfaces()
        .into_iter()
        .filter(|iface| !iface.is_loopback() && iface.is_up() && iface.is_multicast())
        .collect()
}

#[async_trait]
impl Source for MdnsSource {
    fn name(&self) -> &'static str {
        "mdns"
    }

    async fn lookup_addr(&self, ip: IpAddr) -> Vec<String> {
        self.by_ip.get(&ip).map(|n| vec![n]).unwrap_or_default()
    }

    async fn lookup_host(&self, name: &str) -> Vec<IpAddr> {
        self.by_name
            .get(&name.to_ascii_lowercase())
            .unwrap_or_default()
    }

    fn visit(&self, f: &mut dyn FnMut(IpAddr, &[String])) {
        for (ip, name) in self.by_ip.iter() {
            f(*ip, &[name]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::Record;

    #[tokio::test]
    async fn absorbs_additional_section_addresses() {
        let source = MdnsSource::new(Some(100));
        let mut msg = Message::new();
        msg.set_message_type(MessageType::Response);
        let name = Name::from_str("Living-Room-TV.local.").unwrap();
        msg.add_additional(Record::from_rdata(
            name,
            120,
            RData::A(A(Ipv4Addr::new(192, 168, 1, 42))),
        ));
        source.absorb(&msg);

        let names = source
            .lookup_addr(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 42)))
            .await;
        assert_eq!(names, vec!["living-room-tv.local.".to_string()]);
        let addrs = source.lookup_host("LIVING-ROOM-TV.local.").await;
        assert_eq!(addrs, vec![IpAddr::V4(Ipv4Addr::new(192, 168, 1, 42))]);
    }

    #[test]
    fn probe_is_a_wire_query() {
        let probe = build_probe("_hap._tcp.local.").unwrap();
        let msg = Message::from_vec(&probe).unwrap();
        assert_eq!(msg.queries().len(), 1);
        assert_eq!(msg.queries()[0].query_type(), RecordType::PTR);
    }
}
