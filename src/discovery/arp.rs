/*
 * SPDX-FileCopyrightText: 2025 HavenDNS contributors
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! ARP/NDP table snapshot
//!
//! Used to map a hardware address back to its LAN IP when a query arrives
//! from loopback with an EDNS0 MAC option (the dnsmasq-in-front setup: the
//! LAN IP is the real client, not 127.0.0.1). The table is an immutable
//! snapshot refreshed at most once a second, triggered by reads.

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::core::app_clock::AppClock;
use crate::dns::MacAddr;

const REFRESH_MS: u64 = 1000;

#[derive(Default)]
struct Table {
    by_mac: HashMap<MacAddr, IpAddr>,
    by_ip: HashMap<IpAddr, MacAddr>,
}

pub struct ArpTable {
    table: ArcSwap<Table>,
    last_refresh_ms: AtomicU64,
}

impl ArpTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            table: ArcSwap::from_pointee(Table::default()),
            last_refresh_ms: AtomicU64::new(0),
        })
    }

    /// LAN IP currently associated with `mac`, if the kernel knows one
    pub fn ip_for_mac(&self, mac: MacAddr) -> Option<IpAddr> {
        self.maybe_refresh();
        self.table.load().by_mac.get(&mac).copied()
    }

    /// Hardware address for a LAN IP
    pub fn mac_for_ip(&self, ip: IpAddr) -> Option<MacAddr> {
        self.maybe_refresh();
        self.table.load().by_ip.get(&ip).copied()
    }

    fn maybe_refresh(&self) {
        let now = AppClock::elapsed_millis();
        let last = self.last_refresh_ms.load(Ordering::Relaxed);
        if last != 0 && now.saturating_sub(last) < REFRESH_MS {
            return;
        }
        // First caller past the deadline wins; losers read the old snapshot.
        if self
            .last_refresh_ms
            .compare_exchange(last, now.max(1), Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        self.table.store(Arc::new(load_table()));
    }
}

#[cfg(target_os = "linux")]
fn load_table() -> Table {
    match std::fs::read_to_string("/proc/net/arp") {
        Ok(content) => parse_proc_arp(&content),
        Err(_) => Table::default(),
    }
}

#[cfg(not(target_os = "linux"))]
fn load_table() -> Table {
    Table::default()
}

/// Parse /proc/net/arp: `IP address  HW type  Flags  HW address ...`
///
/// Entries with flags 0x0 are incomplete and skipped, as is the all-zero
/// hardware address.
#[cfg(any(target_os = "linux", test))]
fn parse_proc_arp(content: &str) -> Table {
    let mut table = Table::default();
    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }
        let ip: IpAddr = match fields[0].parse() {
            Ok(ip) => ip,
            Err(_) => continue,
        };
        if fields[2] == "0x0" {
            continue;
        }
        let mac: MacAddr = match fields[3].parse() {
            Ok(mac) => mac,
            Err(_) => continue,
        };
        if mac.0 == [0; 6] {
            continue;
        }
        table.by_mac.insert(mac, ip);
        table.by_ip.insert(ip, mac);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const PROC_ARP: &str = "\
IP address       HW type     Flags       HW address            Mask     Device
192.168.1.1      0x1         0x2         aa:bb:cc:dd:ee:ff     *        eth0
192.168.1.50     0x1         0x0         00:00:00:00:00:00     *        eth0
192.168.1.51     0x1         0x2         00:00:00:00:00:00     *        eth0
";

    #[test]
    fn parses_complete_entries_only() {
        let table = parse_proc_arp(PROC_ARP);
        let mac: MacAddr = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        assert_eq!(
            table.by_mac.get(&mac),
            Some(&IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)))
        );
        // Incomplete (0x0) and zero-MAC entries are dropped
        assert_eq!(table.by_mac.len(), 1);
        assert_eq!(table.by_ip.len(), 1);
    }
}
