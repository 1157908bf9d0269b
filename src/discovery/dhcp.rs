/*
 * SPDX-FileCopyrightText: 2025 HavenDNS contributors
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! DHCP lease source
//!
//! Reads lease files written by dnsmasq and ISC dhcpd from their usual
//! locations. Files are re-parsed only when mtime or size changed, at most
//! every five seconds. Leases map both ways (ip ↔ name) and by hardware
//! address, which is how dnsmasq-fronted clients get their names.

use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use tracing::debug;

use crate::core::app_clock::AppClock;
use crate::discovery::Source;
use crate::dns::MacAddr;

const REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Lease-file locations tried in order; the first that exists is used
const LEASE_PATHS: &[&str] = &[
    "/var/lib/misc/dnsmasq.leases",
    "/var/lib/dnsmasq/dnsmasq.leases",
    "/var/db/dnsmasq.leases",
    "/tmp/dnsmasq.leases",
    "/var/lib/dhcp/dhcpd.leases",
    "/var/db/dhcpd.leases",
];

#[derive(Default)]
struct LeaseMaps {
    by_ip: HashMap<IpAddr, Vec<String>>,
    by_name: HashMap<String, Vec<IpAddr>>,
    by_mac: HashMap<MacAddr, Vec<String>>,
}

struct FileStamp {
    path: PathBuf,
    mtime: SystemTime,
    size: u64,
}

pub struct DhcpSource {
    paths: Vec<PathBuf>,
    maps: ArcSwap<LeaseMaps>,
    refresh: Mutex<Option<FileStamp>>,
    last_check_ms: AtomicU64,
}

impl DhcpSource {
    pub fn new() -> Arc<Self> {
        Self::with_paths(LEASE_PATHS.iter().map(PathBuf::from).collect())
    }

    pub fn with_paths(paths: Vec<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            paths,
            maps: ArcSwap::from_pointee(LeaseMaps::default()),
            refresh: Mutex::new(None),
            last_check_ms: AtomicU64::new(0),
        })
    }

    async fn maybe_refresh(&self) {
        let now = AppClock::elapsed_millis();
        let last = self.last_check_ms.load(Ordering::Relaxed);
        if last != 0 && now.saturating_sub(last) < REFRESH_INTERVAL.as_millis() as u64 {
            return;
        }
        let mut stamp = match self.refresh.try_lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        self.last_check_ms.store(now.max(1), Ordering::Relaxed);

        for path in &self.paths {
            let meta = match tokio::fs::metadata(path).await {
                Ok(m) => m,
                Err(_) => continue,
            };
            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            let size = meta.len();
            if let Some(prev) = stamp.as_ref() {
                if prev.path == *path && prev.mtime == mtime && prev.size == size {
                    return;
                }
            }
            match tokio::fs::read_to_string(path).await {
                Ok(content) => {
                    let maps = parse_leases(&content);
                    debug!(
                        path = %path.display(),
                        leases = maps.by_ip.len(),
                        "reloaded dhcp leases"
                    );
                    self.maps.store(Arc::new(maps));
                    *stamp = Some(FileStamp {
                        path: path.clone(),
                        mtime,
                        size,
                    });
                }
                Err(e) => debug!(path = %path.display(), error = %e, "lease read failed"),
            }
            return;
        }
    }
}

/// Parse lease-file content, auto-detecting the format
///
/// dnsmasq writes one lease per line (`expiry mac ip hostname client-id`);
/// ISC dhcpd writes `lease <ip> { ... }` blocks with `hardware ethernet`
/// and `client-hostname` statements.
fn parse_leases(content: &str) -> LeaseMaps {
    if content.contains("lease ") && content.contains('{') {
        parse_isc(content)
    } else {
        parse_dnsmasq(content)
    }
}

fn add_lease(maps: &mut LeaseMaps, ip: IpAddr, mac: Option<MacAddr>, hostname: &str) {
    if hostname.is_empty() || hostname == "*" {
        return;
    }
    let mut name = hostname.to_ascii_lowercase();
    if !name.ends_with('.') {
        name.push('.');
    }
    maps.by_ip.entry(ip).or_default().push(name.clone());
    maps.by_name.entry(name.clone()).or_default().push(ip);
    if let Some(mac) = mac {
        maps.by_mac.entry(mac).or_default().push(name);
    }
}

fn parse_dnsmasq(content: &str) -> LeaseMaps {
    let mut maps = LeaseMaps::default();
    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }
        let mac = fields[1].parse::<MacAddr>().ok();
        let ip: IpAddr = match fields[2].parse() {
            Ok(ip) => ip,
            Err(_) => continue,
        };
        add_lease(&mut maps, ip, mac, fields[3]);
    }
    maps
}

fn parse_isc(content: &str) -> LeaseMaps {
    let mut maps = LeaseMaps::default();
    let mut ip: Option<IpAddr> = None;
    let mut mac: Option<MacAddr> = None;
    let mut hostname = String::new();
    for line in content.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("lease ") {
            ip = rest.split_whitespace().next().and_then(|s| s.parse().ok());
            mac = None;
            hostname.clear();
        } else if let Some(rest) = line.strip_prefix("hardware ethernet ") {
            mac = rest.trim_end_matches(';').parse().ok();
        } else if let Some(rest) = line.strip_prefix("client-hostname ") {
            hostname = rest.trim_end_matches(';').trim_matches('"').to_string();
        } else if line.starts_with('}') {
            if let Some(ip) = ip.take() {
                add_lease(&mut maps, ip, mac.take(), &hostname);
            }
            hostname.clear();
        }
    }
    maps
}

#[async_trait]
impl Source for DhcpSource {
    fn name(&self) -> &'static str {
        "dhcp"
    }

    async fn lookup_addr(&self, ip: IpAddr) -> Vec<String> {
        self.maybe_refresh().await;
        self.maps.load().by_ip.get(&ip).cloned().unwrap_or_default()
    }

    async fn lookup_host(&self, name: &str) -> Vec<IpAddr> {
        self.maybe_refresh().await;
        let name = name.to_ascii_lowercase();
        self.maps.load().by_name.get(&name).cloned().unwrap_or_default()
    }

    async fn lookup_mac(&self, mac: MacAddr) -> Vec<String> {
        self.maybe_refresh().await;
        self.maps.load().by_mac.get(&mac).cloned().unwrap_or_default()
    }

    fn visit(&self, f: &mut dyn FnMut(IpAddr, &[String])) {
        for (ip, names) in self.maps.load().by_ip.iter() {
            f(*ip, names);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const DNSMASQ: &str = "\
1756500000 aa:bb:cc:00:11:22 192.168.1.10 laptop 01:aa:bb:cc:00:11:22
1756500001 de:ad:be:ef:00:01 192.168.1.11 * *
1756500002 11:22:33:44:55:66 192.168.1.12 Phone 01:11:22:33:44:55:66
";

    const ISC: &str = r#"
lease 192.168.1.20 {
  starts 5 2026/08/29 10:00:00;
  hardware ethernet aa:bb:cc:dd:ee:ff;
  client-hostname "Desktop";
}
lease 192.168.1.21 {
  hardware ethernet 00:11:22:33:44:55;
}
"#;

    #[test]
    fn dnsmasq_leases_parse() {
        let maps = parse_leases(DNSMASQ);
        assert_eq!(
            maps.by_ip.get(&IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10))),
            Some(&vec!["laptop.".to_string()])
        );
        // "*" hostname means no name was registered
        assert!(!maps.by_ip.contains_key(&IpAddr::V4(Ipv4Addr::new(192, 168, 1, 11))));
        let mac: MacAddr = "11:22:33:44:55:66".parse().unwrap();
        assert_eq!(maps.by_mac.get(&mac), Some(&vec!["phone.".to_string()]));
    }

    #[test]
    fn isc_leases_parse() {
        let maps = parse_leases(ISC);
        assert_eq!(
            maps.by_ip.get(&IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20))),
            Some(&vec!["desktop.".to_string()])
        );
        // Lease without a client-hostname contributes nothing
        assert!(!maps.by_ip.contains_key(&IpAddr::V4(Ipv4Addr::new(192, 168, 1, 21))));
        let mac: MacAddr = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        assert_eq!(maps.by_mac.get(&mac), Some(&vec!["desktop.".to_string()]));
    }

    #[tokio::test]
    async fn lookup_uses_first_existing_path() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(DNSMASQ.as_bytes()).unwrap();
        let source = DhcpSource::with_paths(vec![
            PathBuf::from("/nonexistent/leases"),
            file.path().to_path_buf(),
        ]);
        AppClock::start();
        let names = source
            .lookup_addr(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)))
            .await;
        assert_eq!(names, vec!["laptop.".to_string()]);
    }
}
