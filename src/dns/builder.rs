/*
 * SPDX-FileCopyrightText: 2025 HavenDNS contributors
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Synthetic response construction
//!
//! Builds the short replies the proxy produces locally: rcode-only replies
//! (FORMERR, SERVFAIL, NXDOMAIN), hosts-file A/AAAA answers and PTR answers.
//! All answers use a compression pointer to the question name.

use std::net::IpAddr;

use crate::dns::{Query, Rcode, CLASS_IN, TYPE_A, TYPE_AAAA, TYPE_PTR};

/// TTL for locally synthesized answers
const LOCAL_TTL: u32 = 60;

/// Pointer to offset 12, where the question name starts
const QNAME_POINTER: [u8; 2] = [0xC0, 0x0C];

/// Encode a dotted name into wire-format labels
pub(crate) fn encode_name(name: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(name.len() + 2);
    for label in name.split('.') {
        if label.is_empty() {
            continue;
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    out
}

/// Write the response header and copy of the question section
fn reply_base(query: &Query, rcode: Rcode, ancount: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(&query.id.to_be_bytes());
    // QR=1, RD=1 (we behave recursively toward the client), RA=1
    out.push(0x81);
    out.push(0x80 | (rcode as u8));
    out.extend_from_slice(&1u16.to_be_bytes()); // qdcount
    out.extend_from_slice(&ancount.to_be_bytes());
    out.extend_from_slice(&[0, 0, 0, 0]); // nscount, arcount
    out.extend_from_slice(&encode_name(&query.qname));
    out.extend_from_slice(&query.qtype.to_be_bytes());
    out.extend_from_slice(&query.class.to_be_bytes());
    out
}

/// Build a reply with the given rcode and no answers
///
/// Used for FORMERR, SERVFAIL and the bogus-private NXDOMAIN.
pub fn build_rcode_reply(query: &Query, rcode: Rcode) -> Vec<u8> {
    reply_base(query, rcode, 0)
}

/// Build an A/AAAA reply from hosts-file addresses
///
/// Only addresses matching the question type are included; an empty match
/// yields a no-answer NOERROR reply.
pub fn build_hosts_reply(query: &Query, ips: &[IpAddr]) -> Vec<u8> {
    let selected: Vec<&IpAddr> = ips
        .iter()
        .filter(|ip| match query.qtype {
            TYPE_A => ip.is_ipv4(),
            TYPE_AAAA => ip.is_ipv6(),
            _ => false,
        })
        .collect();

    let mut out = reply_base(query, Rcode::NoError, selected.len() as u16);
    for ip in selected {
        out.extend_from_slice(&QNAME_POINTER);
        match ip {
            IpAddr::V4(v4) => {
                out.extend_from_slice(&TYPE_A.to_be_bytes());
                out.extend_from_slice(&CLASS_IN.to_be_bytes());
                out.extend_from_slice(&LOCAL_TTL.to_be_bytes());
                out.extend_from_slice(&4u16.to_be_bytes());
                out.extend_from_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                out.extend_from_slice(&TYPE_AAAA.to_be_bytes());
                out.extend_from_slice(&CLASS_IN.to_be_bytes());
                out.extend_from_slice(&LOCAL_TTL.to_be_bytes());
                out.extend_from_slice(&16u16.to_be_bytes());
                out.extend_from_slice(&v6.octets());
            }
        }
    }
    out
}

/// Build a PTR reply from locally discovered names
pub fn build_ptr_reply(query: &Query, names: &[String]) -> Vec<u8> {
    let mut out = reply_base(query, Rcode::NoError, names.len() as u16);
    for name in names {
        let rdata = encode_name(name);
        out.extend_from_slice(&QNAME_POINTER);
        out.extend_from_slice(&TYPE_PTR.to_be_bytes());
        out.extend_from_slice(&CLASS_IN.to_be_bytes());
        out.extend_from_slice(&LOCAL_TTL.to_be_bytes());
        out.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        out.extend_from_slice(&rdata);
    }
    out
}

/// Truncate a response that exceeds the client's advertised UDP size
///
/// Sets TC=1 and cuts the message after the question section, zeroing the
/// answer/authority/additional counts. The client is expected to retry over
/// TCP.
pub fn truncate_response(response: &mut Vec<u8>, question_end: usize) {
    if response.len() < 12 {
        return;
    }
    response[2] |= 0x02;
    for i in 6..12 {
        response[i] = 0;
    }
    if question_end >= 12 && question_end <= response.len() {
        response.truncate(question_end);
    } else {
        response.truncate(12);
    }
}

/// Offset of the first byte after the question section, if parseable
pub fn question_end(response: &[u8]) -> Option<usize> {
    if response.len() < 12 {
        return None;
    }
    let qdcount = u16::from_be_bytes([response[4], response[5]]);
    let mut pos = 12;
    for _ in 0..qdcount {
        crate::dns::parser::skip_name(response, &mut pos).ok()?;
        pos += 4;
        if pos > response.len() {
            return None;
        }
    }
    Some(pos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::parser::parse_query;
    use bytes::Bytes;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    fn query_for(name: &str, qtype: u16) -> Query {
        let mut raw = Vec::new();
        raw.extend_from_slice(&0x1234u16.to_be_bytes());
        raw.extend_from_slice(&[0x01, 0x00]);
        raw.extend_from_slice(&[0, 1, 0, 0, 0, 0, 0, 0]);
        raw.extend_from_slice(&encode_name(name));
        raw.extend_from_slice(&qtype.to_be_bytes());
        raw.extend_from_slice(&[0, 1]);
        parse_query(Bytes::from(raw), IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap()
    }

    #[test]
    fn rcode_reply_echoes_question() {
        let q = query_for("example.com", TYPE_A);
        let reply = build_rcode_reply(&q, Rcode::NxDomain);
        assert_eq!(&reply[0..2], &0x1234u16.to_be_bytes());
        assert_eq!(reply[2] & 0x80, 0x80); // QR
        assert_eq!(reply[3] & 0x80, 0x80); // RA
        assert_eq!(reply[3] & 0x0F, 3); // NXDOMAIN
        assert_eq!(u16::from_be_bytes([reply[4], reply[5]]), 1);
        assert_eq!(u16::from_be_bytes([reply[6], reply[7]]), 0);
    }

    #[test]
    fn hosts_reply_filters_by_qtype() {
        let q = query_for("router.local", TYPE_A);
        let ips = vec![
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)),
            IpAddr::V6(Ipv6Addr::LOCALHOST),
        ];
        let reply = build_hosts_reply(&q, &ips);
        // Only the IPv4 answer survives for an A question
        assert_eq!(u16::from_be_bytes([reply[6], reply[7]]), 1);
        assert_eq!(&reply[reply.len() - 4..], &[192, 168, 1, 1]);
    }

    #[test]
    fn ptr_reply_carries_names() {
        let q = query_for("1.1.168.192.in-addr.arpa", TYPE_PTR);
        let reply = build_ptr_reply(&q, &["router.local.".to_string()]);
        assert_eq!(u16::from_be_bytes([reply[6], reply[7]]), 1);
        // rdata ends with the encoded name
        let encoded = encode_name("router.local.");
        assert_eq!(&reply[reply.len() - encoded.len()..], &encoded[..]);
    }

    #[test]
    fn truncation_sets_tc_and_cuts_answers() {
        let q = query_for("example.com", TYPE_A);
        let mut reply = build_hosts_reply(&q, &[IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))]);
        let qend = question_end(&reply).unwrap();
        truncate_response(&mut reply, qend);
        assert_eq!(reply.len(), qend);
        assert_eq!(reply[2] & 0x02, 0x02);
        assert_eq!(u16::from_be_bytes([reply[6], reply[7]]), 0);
    }
}
