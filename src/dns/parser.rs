/*
 * SPDX-FileCopyrightText: 2025 HavenDNS contributors
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Query parsing and EDNS0 client extraction
//!
//! Extracts the minimum from an incoming query: message id, first question,
//! advertised UDP size and the two OPT options the proxy understands
//! (EDNS0-Client-Subnet and the dnsmasq MAC extension). Everything else in
//! the message is skipped, including trailing garbage after the OPT RR.

use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::core::error::{ProxyError, Result};
use crate::dns::{MacAddr, Query, DEFAULT_UDP_SIZE, TYPE_OPT};

/// EDNS0 Client Subnet option code (RFC 7871)
const OPT_ECS: u16 = 8;
/// dnsmasq EDNS0 MAC option code
const OPT_MAC: u16 = 0xfde9;

/// Parse an incoming DNS query
///
/// `peer_ip` is the transport-level source address; it is replaced by the
/// ECS address when the query carries a full-length prefix (/32 or /128).
/// Any other prefix length leaves the peer IP unchanged.
pub fn parse_query(payload: Bytes, peer_ip: IpAddr) -> Result<Query> {
    let buf = payload.as_ref();
    if buf.len() < 12 {
        return Err(ProxyError::malformed("header shorter than 12 bytes"));
    }

    let id = u16::from_be_bytes([buf[0], buf[1]]);
    let qdcount = u16::from_be_bytes([buf[4], buf[5]]);
    let ancount = u16::from_be_bytes([buf[6], buf[7]]) as usize;
    let nscount = u16::from_be_bytes([buf[8], buf[9]]) as usize;
    let arcount = u16::from_be_bytes([buf[10], buf[11]]) as usize;

    if qdcount == 0 {
        return Err(ProxyError::malformed("no question"));
    }

    // First question: name, type, class
    let mut pos = 12;
    let qname = read_qname(buf, &mut pos)?;
    if pos + 4 > buf.len() {
        return Err(ProxyError::malformed("truncated question"));
    }
    let qtype = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
    let class = u16::from_be_bytes([buf[pos + 2], buf[pos + 3]]);
    pos += 4;

    // Remaining questions are skipped, as are answer and authority records.
    for _ in 1..qdcount {
        skip_name(buf, &mut pos)?;
        pos = pos
            .checked_add(4)
            .filter(|p| *p <= buf.len())
            .ok_or_else(|| ProxyError::malformed("truncated question"))?;
    }
    for _ in 0..ancount + nscount {
        skip_rr(buf, &mut pos)?;
    }

    // Additional section: look for the OPT pseudo-RR.
    let mut msg_size = DEFAULT_UDP_SIZE;
    let mut ecs_ip: Option<IpAddr> = None;
    let mut peer_mac: Option<MacAddr> = None;

    for _ in 0..arcount {
        let rr_start = pos;
        skip_name(buf, &mut pos)?;
        if pos + 10 > buf.len() {
            return Err(ProxyError::malformed("truncated additional record"));
        }
        let rtype = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
        let rdlen = u16::from_be_bytes([buf[pos + 8], buf[pos + 9]]) as usize;
        if rtype != TYPE_OPT {
            pos += 10 + rdlen;
            if pos > buf.len() {
                return Err(ProxyError::malformed("truncated additional record"));
            }
            continue;
        }

        // OPT: class field carries the advertised UDP payload size
        let advertised = u16::from_be_bytes([buf[pos + 2], buf[pos + 3]]);
        if advertised > msg_size {
            msg_size = advertised;
        }
        pos += 10;
        if pos + rdlen > buf.len() {
            return Err(ProxyError::malformed("truncated OPT rdata"));
        }
        parse_opt_options(&buf[pos..pos + rdlen], &mut ecs_ip, &mut peer_mac)
            .map_err(|_| ProxyError::malformed(format!("bad OPT rdata at {rr_start}")))?;
        pos += rdlen;
        // Trailing garbage after the OPT RR is tolerated.
        break;
    }

    Ok(Query {
        id,
        class,
        qtype,
        qname,
        msg_size,
        peer_ip: ecs_ip.unwrap_or(peer_ip),
        peer_mac,
        payload,
    })
}

/// Walk the EDNS0 option list extracting ECS and MAC
///
/// ECS is only honored for full-length prefixes: family 1 with /32 or
/// family 2 with /128. Any other prefix is ignored (the transport peer IP
/// stays in effect). Both options are kept when both are present.
fn parse_opt_options(
    mut rdata: &[u8],
    ecs_ip: &mut Option<IpAddr>,
    peer_mac: &mut Option<MacAddr>,
) -> Result<()> {
    while !rdata.is_empty() {
        if rdata.len() < 4 {
            return Err(ProxyError::malformed("short OPT option header"));
        }
        let code = u16::from_be_bytes([rdata[0], rdata[1]]);
        let len = u16::from_be_bytes([rdata[2], rdata[3]]) as usize;
        rdata = &rdata[4..];
        if rdata.len() < len {
            return Err(ProxyError::malformed("short OPT option data"));
        }
        let data = &rdata[..len];
        match code {
            OPT_ECS => {
                if data.len() >= 4 {
                    let family = u16::from_be_bytes([data[0], data[1]]);
                    let source_prefix = data[2];
                    let addr = &data[4..];
                    match (family, source_prefix) {
                        (1, 32) if addr.len() >= 4 => {
                            *ecs_ip = Some(IpAddr::V4(Ipv4Addr::new(
                                addr[0], addr[1], addr[2], addr[3],
                            )));
                        }
                        (2, 128) if addr.len() >= 16 => {
                            let mut octets = [0u8; 16];
                            octets.copy_from_slice(&addr[..16]);
                            *ecs_ip = Some(IpAddr::V6(Ipv6Addr::from(octets)));
                        }
                        // Partial prefixes carry a network, not a client.
                        _ => {}
                    }
                }
            }
            OPT_MAC => {
                if data.len() == 6 {
                    let mut octets = [0u8; 6];
                    octets.copy_from_slice(data);
                    *peer_mac = Some(MacAddr(octets));
                }
            }
            _ => {}
        }
        rdata = &rdata[len..];
    }
    Ok(())
}

/// Read the question name at `pos`, lowercased, with trailing dot
///
/// Question names are never compressed on the wire; a compression pointer
/// here is treated as malformed.
fn read_qname(buf: &[u8], pos: &mut usize) -> Result<String> {
    let mut name = String::new();
    loop {
        let len = *buf
            .get(*pos)
            .ok_or_else(|| ProxyError::malformed("truncated name"))? as usize;
        *pos += 1;
        if len == 0 {
            break;
        }
        if len & 0xC0 != 0 {
            return Err(ProxyError::malformed("compressed question name"));
        }
        if *pos + len > buf.len() {
            return Err(ProxyError::malformed("truncated label"));
        }
        if name.len() + len + 1 > 254 {
            return Err(ProxyError::malformed("name too long"));
        }
        for &b in &buf[*pos..*pos + len] {
            name.push(b.to_ascii_lowercase() as char);
        }
        name.push('.');
        *pos += len;
    }
    if name.is_empty() {
        name.push('.');
    }
    Ok(name)
}

/// Skip a (possibly compressed) name without materializing it
///
/// The first two bits of a label-length byte distinguish a literal label
/// (00) from a compression pointer (11); a pointer terminates the name.
pub(crate) fn skip_name(buf: &[u8], pos: &mut usize) -> Result<()> {
    loop {
        let len = *buf
            .get(*pos)
            .ok_or_else(|| ProxyError::malformed("truncated name"))? as usize;
        match len & 0xC0 {
            0x00 => {
                *pos += 1 + len;
                if len == 0 {
                    return Ok(());
                }
                if *pos > buf.len() {
                    return Err(ProxyError::malformed("truncated label"));
                }
            }
            0xC0 => {
                // Pointer: two bytes, name ends here without following it.
                *pos += 2;
                if *pos > buf.len() {
                    return Err(ProxyError::malformed("truncated pointer"));
                }
                return Ok(());
            }
            _ => return Err(ProxyError::malformed("reserved label type")),
        }
    }
}

/// Skip one resource record (name + fixed header + rdata)
fn skip_rr(buf: &[u8], pos: &mut usize) -> Result<()> {
    skip_name(buf, pos)?;
    if *pos + 10 > buf.len() {
        return Err(ProxyError::malformed("truncated record header"));
    }
    let rdlen = u16::from_be_bytes([buf[*pos + 8], buf[*pos + 9]]) as usize;
    *pos += 10 + rdlen;
    if *pos > buf.len() {
        return Err(ProxyError::malformed("truncated rdata"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::builder::encode_name;

    /// Build a minimal A query for the given name
    pub(crate) fn make_query(id: u16, name: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&id.to_be_bytes());
        buf.extend_from_slice(&[0x01, 0x00]); // RD
        buf.extend_from_slice(&[0, 1, 0, 0, 0, 0, 0, 0]);
        buf.extend_from_slice(&encode_name(name));
        buf.extend_from_slice(&[0, 1, 0, 1]); // A IN
        buf
    }

    fn with_opt(mut msg: Vec<u8>, options: &[u8], udp_size: u16) -> Vec<u8> {
        msg[11] = 1; // arcount
        msg.push(0); // root name
        msg.extend_from_slice(&41u16.to_be_bytes());
        msg.extend_from_slice(&udp_size.to_be_bytes());
        msg.extend_from_slice(&[0, 0, 0, 0]); // ttl
        msg.extend_from_slice(&(options.len() as u16).to_be_bytes());
        msg.extend_from_slice(options);
        msg
    }

    fn loopback() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    #[test]
    fn parses_basic_query() {
        let raw = make_query(0xABCD, "Example.COM");
        let q = parse_query(Bytes::from(raw), loopback()).unwrap();
        assert_eq!(q.id, 0xABCD);
        assert_eq!(q.qname, "example.com.");
        assert_eq!(q.qtype, 1);
        assert_eq!(q.class, 1);
        assert_eq!(q.msg_size, 512);
        assert_eq!(q.peer_ip, loopback());
    }

    #[test]
    fn header_only_is_malformed() {
        // Exactly 12 bytes: header with qdcount=1 but no question bytes
        let mut raw = make_query(1, "a.");
        raw.truncate(12);
        assert!(parse_query(Bytes::from(raw), loopback()).is_err());
    }

    #[test]
    fn short_header_is_malformed() {
        assert!(parse_query(Bytes::from(vec![0u8; 11]), loopback()).is_err());
    }

    #[test]
    fn ecs_full_prefix_overrides_peer_ip() {
        let mut opt = Vec::new();
        opt.extend_from_slice(&8u16.to_be_bytes()); // ECS
        opt.extend_from_slice(&8u16.to_be_bytes()); // len
        opt.extend_from_slice(&[0, 1, 32, 0]); // family 1, /32
        opt.extend_from_slice(&[192, 0, 2, 55]);
        let raw = with_opt(make_query(1, "example.com"), &opt, 1232);
        let q = parse_query(Bytes::from(raw), loopback()).unwrap();
        assert_eq!(q.peer_ip, IpAddr::V4(Ipv4Addr::new(192, 0, 2, 55)));
        assert_eq!(q.msg_size, 1232);
    }

    #[test]
    fn ecs_partial_prefix_is_ignored() {
        let mut opt = Vec::new();
        opt.extend_from_slice(&8u16.to_be_bytes());
        opt.extend_from_slice(&7u16.to_be_bytes());
        opt.extend_from_slice(&[0, 1, 24, 0]); // /24: a network, not a client
        opt.extend_from_slice(&[192, 0, 2]);
        let raw = with_opt(make_query(1, "example.com"), &opt, 1232);
        let q = parse_query(Bytes::from(raw), loopback()).unwrap();
        assert_eq!(q.peer_ip, loopback());
    }

    #[test]
    fn mac_option_is_extracted() {
        let mut opt = Vec::new();
        opt.extend_from_slice(&0xfde9u16.to_be_bytes());
        opt.extend_from_slice(&6u16.to_be_bytes());
        opt.extend_from_slice(&[0xaa, 0xbb, 0xcc, 0, 1, 2]);
        let raw = with_opt(make_query(1, "example.com"), &opt, 512);
        let q = parse_query(Bytes::from(raw), loopback()).unwrap();
        assert_eq!(q.peer_mac, Some(MacAddr([0xaa, 0xbb, 0xcc, 0, 1, 2])));
    }

    #[test]
    fn ecs_and_mac_are_both_kept() {
        let mut opt = Vec::new();
        opt.extend_from_slice(&8u16.to_be_bytes());
        opt.extend_from_slice(&8u16.to_be_bytes());
        opt.extend_from_slice(&[0, 1, 32, 0, 10, 0, 0, 9]);
        opt.extend_from_slice(&0xfde9u16.to_be_bytes());
        opt.extend_from_slice(&6u16.to_be_bytes());
        opt.extend_from_slice(&[1, 2, 3, 4, 5, 6]);
        let raw = with_opt(make_query(1, "example.com"), &opt, 512);
        let q = parse_query(Bytes::from(raw), loopback()).unwrap();
        assert_eq!(q.peer_ip, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)));
        assert_eq!(q.peer_mac, Some(MacAddr([1, 2, 3, 4, 5, 6])));
    }

    #[test]
    fn trailing_garbage_after_opt_is_tolerated() {
        let mut raw = with_opt(make_query(1, "example.com"), &[], 512);
        raw.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        assert!(parse_query(Bytes::from(raw), loopback()).is_ok());
    }

    #[test]
    fn bad_opt_is_malformed() {
        // Option header claims 10 bytes of data but only 2 follow
        let mut opt = Vec::new();
        opt.extend_from_slice(&8u16.to_be_bytes());
        opt.extend_from_slice(&10u16.to_be_bytes());
        opt.extend_from_slice(&[0, 1]);
        let raw = with_opt(make_query(1, "example.com"), &opt, 512);
        assert!(parse_query(Bytes::from(raw), loopback()).is_err());
    }
}
