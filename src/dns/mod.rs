/*
 * SPDX-FileCopyrightText: 2025 HavenDNS contributors
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! DNS wire codec and query object
//!
//! The hot path works on raw message bytes: queries are parsed just enough
//! to extract the routing-relevant fields (id, question, EDNS0 options) and
//! the original payload is kept so it can be forwarded upstream without
//! re-encoding. Synthetic replies (FORMERR/SERVFAIL/NXDOMAIN, hosts answers)
//! are built directly in wire format.

pub mod builder;
pub mod parser;
pub mod ttl;

use bytes::Bytes;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::core::error::ProxyError;

/// Record type OPT (EDNS0 pseudo-RR)
pub const TYPE_OPT: u16 = 41;
/// Record type A
pub const TYPE_A: u16 = 1;
/// Record type AAAA
pub const TYPE_AAAA: u16 = 28;
/// Record type PTR
pub const TYPE_PTR: u16 = 12;
/// Class IN
pub const CLASS_IN: u16 = 1;

/// Response codes used by the synthetic reply builders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rcode {
    NoError = 0,
    FormErr = 1,
    ServFail = 2,
    NxDomain = 3,
}

/// Default maximum UDP payload when the client does not advertise EDNS0
pub const DEFAULT_UDP_SIZE: u16 = 512;

/// A 48-bit hardware address carried by the dnsmasq EDNS0 option or
/// discovered from the local ARP/NDP table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut count = 0;
        for part in s.split([':', '-']) {
            if count == 6 {
                return Err(ProxyError::config(format!("invalid MAC address: {s}")));
            }
            octets[count] = u8::from_str_radix(part, 16)
                .map_err(|_| ProxyError::config(format!("invalid MAC address: {s}")))?;
            count += 1;
        }
        if count != 6 {
            return Err(ProxyError::config(format!("invalid MAC address: {s}")));
        }
        Ok(MacAddr(octets))
    }
}

/// Parsed DNS query plus the transport-level context the resolver needs
///
/// `payload` holds the exact bytes received from the client so the resolver
/// can forward them upstream without re-encoding.
#[derive(Debug, Clone)]
pub struct Query {
    /// Message id from the client (echoed in the response)
    pub id: u16,
    /// Question class (usually IN)
    pub class: u16,
    /// Question type
    pub qtype: u16,
    /// Question name, lowercased, with trailing dot
    pub qname: String,
    /// Maximum response size the client advertised (EDNS0), default 512
    pub msg_size: u16,
    /// Client address; replaced by the ECS address when a full-length
    /// prefix was present, or by an ARP/NDP lookup for loopback+MAC
    pub peer_ip: IpAddr,
    /// Client hardware address when known
    pub peer_mac: Option<MacAddr>,
    /// Raw query bytes as received
    pub payload: Bytes,
}

impl Query {
    /// Human-readable question type for logging
    pub fn qtype_str(&self) -> String {
        match self.qtype {
            1 => "A".to_string(),
            2 => "NS".to_string(),
            5 => "CNAME".to_string(),
            6 => "SOA".to_string(),
            12 => "PTR".to_string(),
            15 => "MX".to_string(),
            16 => "TXT".to_string(),
            28 => "AAAA".to_string(),
            33 => "SRV".to_string(),
            65 => "HTTPS".to_string(),
            255 => "ANY".to_string(),
            other => format!("TYPE{other}"),
        }
    }
}

/// True when `payload` starts with a syntactically plausible DNS response
/// header (12 bytes minimum, QR bit set). Used by the endpoint probe to
/// reject captive-portal HTML that arrives with a 200 status.
pub fn is_response(payload: &[u8]) -> bool {
    payload.len() >= 12 && payload[2] & 0x80 != 0
}
