/*
 * SPDX-FileCopyrightText: 2025 HavenDNS contributors
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Inbound listeners
//!
//! Four listeners share one request handler: UDP, TCP, DoT (TCP + TLS) and
//! DoH (HTTP/2 + TLS). Each accepted query runs in its own task; the
//! listeners only differ in framing and in how hard they push back when
//! overloaded (UDP drops packets, TCP refuses connections, DoH answers 429).

pub mod doh;
pub mod tcp;
pub mod tls;
pub mod udp;

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::core::app_clock::AppClock;
use crate::core::log::{Protocol, QueryInfo};
use crate::discovery::arp::ArpTable;
use crate::discovery::Discovery;
use crate::dns::builder::{question_end, truncate_response};
use crate::dns::parser::parse_query;
use crate::dns::{Query, DEFAULT_UDP_SIZE};
use crate::resolver::Resolver;

/// Maximum DNS message over stream transports (2-byte length prefix)
pub const MAX_STREAM_MSG: usize = 65535;

/// Everything a listener needs to turn query bytes into response bytes
pub struct ServerContext {
    pub resolver: Arc<Resolver>,
    pub arp: Arc<ArpTable>,
    pub discovery: Arc<Discovery>,
    pub report_client_info: bool,
}

impl ServerContext {
    /// Handle one raw query and return the wire response.
    ///
    /// UDP responses are capped at the client's advertised payload size,
    /// stream responses at [`MAX_STREAM_MSG`]. The per-query log event is
    /// emitted here, after the response is built. Returns `None` when the
    /// input is too mangled to answer at all.
    pub async fn handle(
        &self,
        payload: Bytes,
        peer: SocketAddr,
        protocol: Protocol,
    ) -> Option<Vec<u8>> {
        let start = AppClock::now();
        let query_size = payload.len();
        let header = payload.slice(0..payload.len().min(12));

        let mut query = match parse_query(payload, peer.ip()) {
            Ok(q) => q,
            Err(e) => {
                tracing::debug!(peer = %peer, error = %e, "answering malformed query");
                return formerr_reply(&header);
            }
        };
        self.restore_peer_ip(&mut query);

        let max_size = match protocol {
            Protocol::Udp => query.msg_size.max(DEFAULT_UDP_SIZE) as usize,
            _ => MAX_STREAM_MSG,
        };
        let resolution = self.resolver.resolve(&query).await;

        let mut response = resolution.payload;
        if response.len() > max_size {
            match question_end(&response) {
                Some(end) => truncate_response(&mut response, end),
                None => response.truncate(max_size),
            }
        }

        let client_name = if self.report_client_info {
            self.discovery
                .client_info(query.peer_ip, query.peer_mac)
                .await
                .name
        } else {
            String::new()
        };

        QueryInfo {
            peer_ip: query.peer_ip,
            protocol,
            qtype: query.qtype_str(),
            qname: query.qname.clone(),
            query_size,
            response_size: response.len(),
            duration: start.elapsed(),
            profile: resolution.profile,
            from_cache: resolution.from_cache,
            upstream: resolution.upstream.to_string(),
            client_name,
            error: resolution.error,
        }
        .emit();

        Some(response)
    }

    /// A forwarder on the same host (dnsmasq) reaches us over loopback but
    /// tags the real client's MAC in EDNS0; map it back to the LAN address
    /// so profiles and discovery see the actual device.
    fn restore_peer_ip(&self, query: &mut Query) {
        if !query.peer_ip.is_loopback() {
            return;
        }
        if let Some(mac) = query.peer_mac {
            if let Some(ip) = self.arp.ip_for_mac(mac) {
                query.peer_ip = ip;
            }
        }
    }
}

/// Minimal FORMERR for a query we could not parse: echo the id when the
/// header is intact, otherwise stay silent.
fn formerr_reply(raw: &[u8]) -> Option<Vec<u8>> {
    if raw.len() < 12 {
        return None;
    }
    let mut reply = vec![0u8; 12];
    reply[0..2].copy_from_slice(&raw[0..2]);
    reply[2] = 0x80 | (raw[2] & 0x01);
    // RA set, like every other synthetic reply
    reply[3] = 0x80 | 0x01;
    Some(reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formerr_echoes_id_and_rd() {
        let mut raw = vec![0u8; 12];
        raw[0] = 0xAB;
        raw[1] = 0xCD;
        raw[2] = 0x01;
        let reply = formerr_reply(&raw).unwrap();
        assert_eq!(&reply[0..2], &[0xAB, 0xCD]);
        assert_eq!(reply[2], 0x81);
        assert_eq!(reply[3] & 0x0F, 1);
        // RA is set, matching the other synthetic replies
        assert_eq!(reply[3] & 0x80, 0x80);
    }

    #[test]
    fn formerr_silent_on_short_input() {
        assert!(formerr_reply(&[0u8; 5]).is_none());
        assert!(formerr_reply(&[]).is_none());
    }
}
