/*
 * SPDX-FileCopyrightText: 2025 HavenDNS contributors
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Plain DNS exchange
//!
//! Used by the forwarder rules, the reverse-DNS source and the DNS53
//! fallback endpoints. UDP first; a truncated reply is retried over TCP
//! with the standard 2-byte length prefix.

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use crate::core::error::{ProxyError, Result};

const MAX_UDP_REPLY: usize = 4096;
const MAX_TCP_REPLY: usize = 65_535;

/// One UDP query/response exchange
pub async fn exchange_udp(addr: SocketAddr, payload: &[u8], deadline: Duration) -> Result<Vec<u8>> {
    let socket = udp_socket(addr)?;
    socket.send_to(payload, addr).await?;

    let mut buf = vec![0u8; MAX_UDP_REPLY];
    let recv = async {
        loop {
            let (n, from) = socket.recv_from(&mut buf).await?;
            // Ignore strays from other sources
            if from == addr {
                return Ok::<usize, std::io::Error>(n);
            }
        }
    };
    match timeout(deadline, recv).await {
        Ok(Ok(n)) => {
            buf.truncate(n);
            Ok(buf)
        }
        Ok(Err(e)) => Err(ProxyError::Io(e)),
        Err(_) => Err(ProxyError::Timeout),
    }
}

/// One TCP exchange with 2-byte length framing
pub async fn exchange_tcp(addr: SocketAddr, payload: &[u8], deadline: Duration) -> Result<Vec<u8>> {
    let exchange = async {
        let mut stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);
        stream
            .write_all(&(payload.len() as u16).to_be_bytes())
            .await?;
        stream.write_all(payload).await?;

        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await?;
        let len = u16::from_be_bytes(len_buf) as usize;
        if len > MAX_TCP_REPLY {
            return Err(ProxyError::bad_body("oversized TCP reply"));
        }
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await?;
        Ok(buf)
    };
    match timeout(deadline, exchange).await {
        Ok(result) => result,
        Err(_) => Err(ProxyError::Timeout),
    }
}

/// UDP exchange with TCP retry when the reply is truncated
pub async fn exchange(addr: SocketAddr, payload: &[u8], deadline: Duration) -> Result<Vec<u8>> {
    let reply = exchange_udp(addr, payload, deadline).await?;
    if reply.len() >= 3 && reply[2] & 0x02 != 0 {
        return exchange_tcp(addr, payload, deadline).await;
    }
    Ok(reply)
}

fn udp_socket(remote: SocketAddr) -> Result<UdpSocket> {
    let socket = Socket::new(
        Domain::for_address(remote),
        Type::DGRAM,
        Some(Protocol::UDP),
    )?;
    let _ = socket.set_nonblocking(true);
    let _ = socket.set_reuse_address(true);
    let bind: SocketAddr = if remote.is_ipv4() {
        "0.0.0.0:0".parse().expect("literal address")
    } else {
        "[::]:0".parse().expect("literal address")
    };
    socket.bind(&bind.into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// Currently configured system resolvers
///
/// On POSIX this reads resolv.conf; other platforms return empty and rely
/// on the anycast fallback endpoint.
pub fn system_resolvers() -> Vec<IpAddr> {
    #[cfg(unix)]
    {
        match std::fs::read_to_string("/etc/resolv.conf") {
            Ok(content) => parse_resolv_conf(&content),
            Err(_) => Vec::new(),
        }
    }
    #[cfg(not(unix))]
    {
        Vec::new()
    }
}

#[cfg(any(unix, test))]
fn parse_resolv_conf(content: &str) -> Vec<IpAddr> {
    let mut servers = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("nameserver") {
            let rest = rest.trim();
            // Strip an IPv6 zone suffix
            let rest = rest.split('%').next().unwrap_or(rest);
            if let Ok(ip) = rest.parse::<IpAddr>() {
                if !servers.contains(&ip) {
                    servers.push(ip);
                }
            }
        }
    }
    servers
}
