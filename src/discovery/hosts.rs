/*
 * SPDX-FileCopyrightText: 2025 HavenDNS contributors
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Hosts-file source
//!
//! Parses the platform hosts file into forward and reverse maps. The maps
//! are rebuilt only when the file's mtime or size changes and swapped in
//! as an immutable snapshot, so lookups are a lock-free read.

use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use tracing::debug;

use crate::core::app_clock::AppClock;
use crate::discovery::Source;

const REFRESH_INTERVAL: Duration = Duration::from_secs(5);

#[cfg(unix)]
const DEFAULT_HOSTS_PATH: &str = "/etc/hosts";
#[cfg(windows)]
const DEFAULT_HOSTS_PATH: &str = r"C:\Windows\System32\Drivers\etc\hosts";

#[derive(Default)]
struct Maps {
    forward: HashMap<String, Vec<IpAddr>>,
    reverse: HashMap<IpAddr, Vec<String>>,
}

struct FileStamp {
    mtime: SystemTime,
    size: u64,
}

pub struct HostsSource {
    path: PathBuf,
    maps: ArcSwap<Maps>,
    // Guards the refresher so concurrent lookups trigger at most one reload
    refresh: Mutex<Option<FileStamp>>,
    last_check_ms: std::sync::atomic::AtomicU64,
}

impl HostsSource {
    pub fn new() -> Arc<Self> {
        Self::with_path(PathBuf::from(DEFAULT_HOSTS_PATH))
    }

    pub fn with_path(path: PathBuf) -> Arc<Self> {
        let source = Arc::new(Self {
            path,
            maps: ArcSwap::from_pointee(Maps::default()),
            refresh: Mutex::new(None),
            last_check_ms: std::sync::atomic::AtomicU64::new(0),
        });
        source
    }

    /// Reload the file when its stamp changed since the last check
    async fn maybe_refresh(&self) {
        use std::sync::atomic::Ordering;

        let now = AppClock::elapsed_millis();
        let last = self.last_check_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) < REFRESH_INTERVAL.as_millis() as u64 && last != 0 {
            return;
        }

        let mut stamp = match self.refresh.try_lock() {
            Ok(guard) => guard,
            // Another task is already refreshing
            Err(_) => return,
        };
        self.last_check_ms.store(now.max(1), Ordering::Relaxed);

        let meta = match tokio::fs::metadata(&self.path).await {
            Ok(m) => m,
            Err(_) => return,
        };
        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let size = meta.len();
        if let Some(prev) = stamp.as_ref() {
            if prev.mtime == mtime && prev.size == size {
                return;
            }
        }

        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => {
                let maps = parse_hosts(&content);
                debug!(
                    path = %self.path.display(),
                    names = maps.forward.len(),
                    "reloaded hosts file"
                );
                self.maps.store(Arc::new(maps));
                *stamp = Some(FileStamp { mtime, size });
            }
            Err(e) => debug!(path = %self.path.display(), error = %e, "hosts read failed"),
        }
    }
}

/// Parse hosts-file content into forward and reverse maps
///
/// Names are stored lowercase with a trailing dot. An IPv6 `%zone` suffix
/// on the address is stripped. Comment and blank lines are skipped, as are
/// inline comments.
fn parse_hosts(content: &str) -> Maps {
    let mut maps = Maps::default();
    for line in content.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let addr_str = match fields.next() {
            Some(a) => a,
            None => continue,
        };
        let addr_str = addr_str.split('%').next().unwrap_or(addr_str);
        let addr: IpAddr = match addr_str.parse() {
            Ok(a) => a,
            Err(_) => continue,
        };
        for name in fields {
            let mut name = name.to_ascii_lowercase();
            if !name.ends_with('.') {
                name.push('.');
            }
            maps.forward.entry(name.clone()).or_default().push(addr);
            maps.reverse.entry(addr).or_default().push(name);
        }
    }
    maps
}

#[async_trait]
impl Source for HostsSource {
    fn name(&self) -> &'static str {
        "hosts"
    }

    async fn lookup_addr(&self, ip: IpAddr) -> Vec<String> {
        self.maybe_refresh().await;
        self.maps.load().reverse.get(&ip).cloned().unwrap_or_default()
    }

    async fn lookup_host(&self, name: &str) -> Vec<IpAddr> {
        self.maybe_refresh().await;
        let name = name.to_ascii_lowercase();
        self.maps.load().forward.get(&name).cloned().unwrap_or_default()
    }

    fn visit(&self, f: &mut dyn FnMut(IpAddr, &[String])) {
        for (ip, names) in self.maps.load().reverse.iter() {
            f(*ip, names);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::Ipv4Addr;

    const SAMPLE: &str = "\
# static names
127.0.0.1   localhost
192.168.1.1 Router.Local gateway   # the box in the closet
fe80::1%eth0 ll-router

10.0.0.5 nas
";

    #[test]
    fn parses_names_and_zones() {
        let maps = parse_hosts(SAMPLE);
        assert_eq!(
            maps.forward.get("router.local."),
            Some(&vec![IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))])
        );
        assert_eq!(
            maps.forward.get("gateway."),
            Some(&vec![IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))])
        );
        // Zone suffix stripped from the address
        assert!(maps.forward.contains_key("ll-router."));
        let names = maps
            .reverse
            .get(&IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)))
            .unwrap();
        assert_eq!(names.len(), 2);
    }

    #[tokio::test]
    async fn lookup_is_case_insensitive() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let source = HostsSource::with_path(file.path().to_path_buf());
        AppClock::start();

        let addrs = source.lookup_host("ROUTER.LOCAL.").await;
        assert_eq!(addrs, vec![IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))]);
    }

    #[tokio::test]
    async fn missing_file_is_empty_not_error() {
        let source = HostsSource::with_path(PathBuf::from("/nonexistent/hosts"));
        AppClock::start();
        assert!(source.lookup_host("anything.").await.is_empty());
    }
}
