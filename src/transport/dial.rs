/*
 * SPDX-FileCopyrightText: 2025 HavenDNS contributors
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Bootstrap dialing
//!
//! A DoH endpoint may carry several bootstrap IPs. All of them are dialed
//! at once and the first established connection wins; the losers are
//! dropped. Falling back to hostname resolution is only safe before the
//! proxy becomes the system resolver, so it is attempted last and only
//! when no bootstrap IP is configured.

use futures::stream::{FuturesUnordered, StreamExt};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::core::error::{ProxyError, Result};

/// Dial every address in parallel, first connect wins
pub async fn dial_first(addrs: &[SocketAddr], deadline: Duration) -> Result<TcpStream> {
    if addrs.is_empty() {
        return Err(ProxyError::upstream("no addresses to dial"));
    }
    let mut pending: FuturesUnordered<_> = addrs
        .iter()
        .map(|addr| {
            let addr = *addr;
            async move { (addr, TcpStream::connect(addr).await) }
        })
        .collect();

    let race = async {
        let mut last_err = None;
        while let Some((addr, result)) = pending.next().await {
            match result {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    debug!(%addr, "dialed");
                    return Ok(stream);
                }
                Err(e) => {
                    debug!(%addr, error = %e, "dial failed");
                    last_err = Some(e);
                }
            }
        }
        Err(match last_err {
            Some(e) => ProxyError::Io(e),
            None => ProxyError::upstream("no addresses to dial"),
        })
    };

    match timeout(deadline, race).await {
        Ok(result) => result,
        Err(_) => Err(ProxyError::Timeout),
    }
}

/// Dial an endpoint by bootstrap IPs, or by hostname when none are set
pub async fn dial_endpoint(
    hostname: &str,
    port: u16,
    bootstrap: &[IpAddr],
    deadline: Duration,
) -> Result<TcpStream> {
    if !bootstrap.is_empty() {
        let addrs: Vec<SocketAddr> = bootstrap
            .iter()
            .map(|ip| SocketAddr::new(*ip, port))
            .collect();
        return dial_first(&addrs, deadline).await;
    }
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((hostname, port))
        .await?
        .collect();
    dial_first(&addrs, deadline).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn first_reachable_address_wins() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let good = listener.local_addr().unwrap();
        // Port 9 (discard) on a host-unreachable test address loses the race
        let bad = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), 9);

        let stream = dial_first(&[bad, good], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(stream.peer_addr().unwrap(), good);
    }

    #[tokio::test]
    async fn empty_address_list_errors() {
        assert!(dial_first(&[], Duration::from_secs(1)).await.is_err());
    }
}
