/*
 * SPDX-FileCopyrightText: 2025 HavenDNS contributors
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! UDP listener
//!
//! One task per datagram, bounded by a permit count. When all permits are
//! taken the datagram is dropped on the floor; the client will retry, and
//! dropping is cheaper than queueing during a flood.

use socket2::{Domain, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::ServerContext;
use crate::core::error::Result;
use crate::core::log::Protocol;

pub const DEFAULT_MAX_INFLIGHT: usize = 2048;

/// Shorter than any real query (12-byte header + root question)
const MIN_QUERY_LEN: usize = 14;

const RECV_BUF: usize = 4096;

pub struct UdpListener {
    socket: Arc<UdpSocket>,
    ctx: Arc<ServerContext>,
    inflight: Arc<Semaphore>,
}

impl UdpListener {
    pub fn bind(addr: SocketAddr, ctx: Arc<ServerContext>, max_inflight: usize) -> Result<Self> {
        let socket = Arc::new(build_udp_socket(addr)?);
        info!(%addr, "udp listener bound");
        Ok(Self {
            socket,
            ctx,
            inflight: Arc::new(Semaphore::new(max_inflight)),
        })
    }

    pub async fn run(self) {
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut buf = [0u8; RECV_BUF];
        loop {
            let (len, peer) = match self.socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "udp recv failed");
                    continue;
                }
            };
            if len < MIN_QUERY_LEN {
                continue;
            }
            let permit = match Arc::clone(&self.inflight).try_acquire_owned() {
                Ok(p) => p,
                Err(_) => {
                    debug!(%peer, "udp inflight cap reached, dropping datagram");
                    continue;
                }
            };

            let payload = bytes::Bytes::copy_from_slice(&buf[..len]);
            let ctx = Arc::clone(&self.ctx);
            let socket = Arc::clone(&self.socket);
            tasks.spawn(async move {
                let _permit = permit;
                if let Some(response) = ctx.handle(payload, peer, Protocol::Udp).await {
                    if let Err(e) = socket.send_to(&response, peer).await {
                        debug!(%peer, error = %e, "udp send failed");
                    }
                }
            });

            reap_tasks(&mut tasks);
        }
    }
}

pub(super) fn reap_tasks(tasks: &mut JoinSet<()>) {
    while tasks.try_join_next().is_some() {}
}

fn build_udp_socket(addr: SocketAddr) -> io::Result<UdpSocket> {
    let sock = if addr.is_ipv4() {
        Socket::new(Domain::IPV4, Type::DGRAM, None)?
    } else {
        let s = Socket::new(Domain::IPV6, Type::DGRAM, None)?;
        s.set_only_v6(true)?;
        s
    };
    sock.set_nonblocking(true)?;
    sock.set_reuse_address(true)?;
    sock.bind(&addr.into())?;
    UdpSocket::from_std(sock.into())
}
