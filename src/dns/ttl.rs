/*
 * SPDX-FileCopyrightText: 2025 HavenDNS contributors
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! TTL adjustment for cached responses
//!
//! A cached message is replayed by rewriting its id and subtracting the
//! entry's age from every RR TTL. The walk has to handle label compression
//! and must skip the OPT pseudo-RR, whose TTL field carries flags.

use crate::dns::parser::skip_name;
use crate::dns::TYPE_OPT;

/// Copy `msg` with a new id and every RR TTL reduced by `age_secs`
///
/// `ttl_cap` bounds each RR's original TTL before aging, so a clamped
/// cache never hands out lifetimes longer than its own retention.
/// Returns the adjusted bytes and the minimum remaining TTL across all
/// RRs. Returns `None` when any RR has no lifetime left (`age >= ttl`) or
/// when the stored message no longer walks cleanly; the caller treats both
/// as a cache miss, so a served response always has a positive TTL.
pub fn adjusted_response(
    msg: &[u8],
    new_id: u16,
    age_secs: u32,
    ttl_cap: Option<u32>,
) -> Option<(Vec<u8>, u32)> {
    if msg.len() < 12 {
        return None;
    }
    let mut out = msg.to_vec();
    out[0..2].copy_from_slice(&new_id.to_be_bytes());

    let qdcount = u16::from_be_bytes([msg[4], msg[5]]) as usize;
    let ancount = u16::from_be_bytes([msg[6], msg[7]]) as usize;
    let nscount = u16::from_be_bytes([msg[8], msg[9]]) as usize;
    let arcount = u16::from_be_bytes([msg[10], msg[11]]) as usize;

    let mut pos = 12;
    for _ in 0..qdcount {
        skip_name(msg, &mut pos).ok()?;
        pos = pos.checked_add(4).filter(|p| *p <= msg.len())?;
    }

    let mut min_ttl = u32::MAX;
    for _ in 0..ancount + nscount + arcount {
        skip_name(msg, &mut pos).ok()?;
        if pos + 10 > msg.len() {
            return None;
        }
        let rtype = u16::from_be_bytes([msg[pos], msg[pos + 1]]);
        let rdlen = u16::from_be_bytes([msg[pos + 8], msg[pos + 9]]) as usize;
        if rtype != TYPE_OPT {
            let mut ttl =
                u32::from_be_bytes([msg[pos + 4], msg[pos + 5], msg[pos + 6], msg[pos + 7]]);
            if let Some(cap) = ttl_cap {
                ttl = ttl.min(cap);
            }
            if age_secs >= ttl {
                return None;
            }
            let remaining = ttl - age_secs;
            out[pos + 4..pos + 8].copy_from_slice(&remaining.to_be_bytes());
            if remaining < min_ttl {
                min_ttl = remaining;
            }
        }
        pos += 10 + rdlen;
        if pos > msg.len() {
            return None;
        }
    }

    if min_ttl == u32::MAX {
        // No TTL-bearing RRs (e.g. NXDOMAIN without SOA); nothing to age.
        min_ttl = 0;
    }
    Some((out, min_ttl))
}

/// Minimum TTL across all non-OPT RRs of a fresh response
///
/// Used at insert time to decide whether a response is worth caching.
/// Returns `None` when the message does not walk cleanly or any RR
/// arrives with TTL 0.
pub fn min_ttl(msg: &[u8]) -> Option<u32> {
    adjusted_response(msg, id_of(msg)?, 0, None).map(|(_, ttl)| ttl)
}

fn id_of(msg: &[u8]) -> Option<u16> {
    if msg.len() < 2 {
        return None;
    }
    Some(u16::from_be_bytes([msg[0], msg[1]]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::builder::encode_name;

    /// Response with one compressed A answer and an OPT RR
    fn sample_response(id: u16, ttl: u32) -> Vec<u8> {
        let mut msg = Vec::new();
        msg.extend_from_slice(&id.to_be_bytes());
        msg.extend_from_slice(&[0x81, 0x80]);
        msg.extend_from_slice(&[0, 1, 0, 1, 0, 0, 0, 1]);
        msg.extend_from_slice(&encode_name("example.com"));
        msg.extend_from_slice(&[0, 1, 0, 1]);
        // Answer: pointer to the question name
        msg.extend_from_slice(&[0xC0, 0x0C]);
        msg.extend_from_slice(&[0, 1, 0, 1]);
        msg.extend_from_slice(&ttl.to_be_bytes());
        msg.extend_from_slice(&[0, 4, 93, 184, 216, 34]);
        // OPT pseudo-RR; its TTL bytes are extension flags, not a lifetime
        msg.push(0);
        msg.extend_from_slice(&[0, 41, 0x04, 0xD0, 0, 0, 0, 0, 0, 0]);
        msg
    }

    #[test]
    fn id_is_rewritten_and_ttl_reduced() {
        let msg = sample_response(0x1111, 300);
        let (out, min) = adjusted_response(&msg, 0xBEEF, 120, None).unwrap();
        assert_eq!(&out[0..2], &0xBEEFu16.to_be_bytes());
        assert_eq!(min, 180);
        // TTL bytes of the answer were rewritten in place
        let ttl_off = 12 + 13 + 4 + 2 + 4;
        assert_eq!(
            u32::from_be_bytes([out[ttl_off], out[ttl_off + 1], out[ttl_off + 2], out[ttl_off + 3]]),
            180
        );
    }

    #[test]
    fn expired_entry_is_none() {
        let msg = sample_response(1, 60);
        assert!(adjusted_response(&msg, 1, 61, None).is_none());
        // Exactly at the TTL is a miss too; a hit never carries TTL 0
        assert!(adjusted_response(&msg, 1, 60, None).is_none());
        assert_eq!(adjusted_response(&msg, 1, 59, None).unwrap().1, 1);
    }

    #[test]
    fn opt_ttl_is_untouched() {
        let msg = sample_response(1, 300);
        let (out, _) = adjusted_response(&msg, 1, 100, None).unwrap();
        // OPT RR occupies the last 11 bytes; flags field must be unchanged
        assert_eq!(&out[out.len() - 11..], &msg[msg.len() - 11..]);
    }

    #[test]
    fn truncated_message_is_none() {
        let mut msg = sample_response(1, 300);
        msg.truncate(msg.len() - 5);
        assert!(adjusted_response(&msg, 1, 0, None).is_none());
    }

    #[test]
    fn ttl_cap_bounds_served_lifetime() {
        let msg = sample_response(1, 3600);
        // Cap 60, age 10: served TTL is 50, not 3590
        assert_eq!(adjusted_response(&msg, 1, 10, Some(60)).unwrap().1, 50);
        // At the cap the entry is expired even though the RR TTL is not
        assert!(adjusted_response(&msg, 1, 60, Some(60)).is_none());
    }

    #[test]
    fn min_ttl_of_fresh_response() {
        let msg = sample_response(1, 42);
        assert_eq!(min_ttl(&msg), Some(42));
    }
}
