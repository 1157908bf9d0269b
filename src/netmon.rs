/*
 * SPDX-FileCopyrightText: 2025 HavenDNS contributors
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Network change watcher
//!
//! Polls the interface table every 30 seconds and broadcasts an event when
//! the set of (interface, state, addresses) changes. Moving between
//! networks, VPN up/down and DHCP renews all show up here; subscribers
//! re-test upstream endpoints and reopen the captive-portal window.

use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

const POLL_INTERVAL: Duration = Duration::from_secs(30);

/// One network transition. The payload is intentionally small; subscribers
/// re-inspect the world themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkChange;

pub struct NetworkWatcher {
    tx: broadcast::Sender<NetworkChange>,
}

impl Default for NetworkWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkWatcher {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkChange> {
        self.tx.subscribe()
    }

    /// Spawn the poll loop; runs for the life of the process
    pub fn start(&self) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let mut last = snapshot();
            loop {
                tokio::time::sleep(POLL_INTERVAL).await;
                let current = snapshot();
                if current != last {
                    info!(
                        interfaces = current.len(),
                        "network configuration changed"
                    );
                    // No receivers yet is fine
                    let _ = tx.send(NetworkChange);
                    last = current;
                } else {
                    debug!("network configuration unchanged");
                }
            }
        });
    }
}

/// Stable fingerprint of the interface table
fn snapshot() -> BTreeSet<String> {
    let mut entries = BTreeSet::new();
    for iface in netdev::get_interfaces() {
        let mut addrs: Vec<String> = iface
            .ipv4
            .iter()
            .map(|net| net.to_string())
            .chain(iface.ipv6.iter().map(|net| net.to_string()))
            .collect();
        addrs.sort();
        entries.insert(format!(
            "{}|{}|{}",
            iface.name,
            iface.is_up(),
            addrs.join(",")
        ));
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_stable() {
        // Two immediate snapshots of the same host must compare equal,
        // otherwise the watcher would broadcast spurious changes.
        assert_eq!(snapshot(), snapshot());
    }

    #[tokio::test]
    async fn subscribers_receive_broadcasts() {
        let watcher = NetworkWatcher::new();
        let mut rx = watcher.subscribe();
        watcher.tx.send(NetworkChange).unwrap();
        assert_eq!(rx.recv().await.unwrap(), NetworkChange);
    }
}
