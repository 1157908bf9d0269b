/*
 * SPDX-FileCopyrightText: 2025 HavenDNS contributors
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! TCP and DoT listeners
//!
//! Both speak RFC 1035 framing: a 2-byte length prefix per message. A
//! connection may pipeline queries, so each request runs in its own task
//! and responses are serialized through a per-connection write lock (they
//! may arrive out of order, which the length framing permits).

use socket2::{Domain, Protocol as SockProtocol, Socket, TcpKeepalive, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::net::TcpListener as TokioTcpListener;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::udp::reap_tasks;
use super::{ServerContext, MAX_STREAM_MSG};
use crate::core::error::Result;
use crate::core::log::Protocol;
use tokio_rustls::TlsAcceptor;

pub const DEFAULT_MAX_CONNECTIONS: usize = 512;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct TcpListener {
    listener: TokioTcpListener,
    ctx: Arc<ServerContext>,
    tls: Option<TlsAcceptor>,
    idle_timeout: Duration,
    connections: Arc<Semaphore>,
}

impl TcpListener {
    pub fn bind(
        addr: SocketAddr,
        ctx: Arc<ServerContext>,
        tls: Option<TlsAcceptor>,
        max_connections: usize,
    ) -> Result<Self> {
        let listener = build_tcp_listener(addr)?;
        info!(%addr, tls = tls.is_some(), "tcp listener bound");
        Ok(Self {
            listener,
            ctx,
            tls,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            connections: Arc::new(Semaphore::new(max_connections)),
        })
    }

    pub async fn run(self) {
        let protocol = if self.tls.is_some() {
            Protocol::Dot
        } else {
            Protocol::Tcp
        };
        let mut tasks: JoinSet<()> = JoinSet::new();
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(r) => r,
                Err(e) => {
                    debug!(error = %e, "tcp accept failed");
                    continue;
                }
            };
            let permit = match Arc::clone(&self.connections).try_acquire_owned() {
                Ok(p) => p,
                Err(_) => {
                    debug!(%peer, "tcp connection cap reached, refusing");
                    continue;
                }
            };

            let ctx = Arc::clone(&self.ctx);
            let tls = self.tls.clone();
            let idle = self.idle_timeout;
            tasks.spawn(async move {
                let _permit = permit;
                let _ = stream.set_nodelay(true);
                match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            serve_stream(tls_stream, peer, ctx, protocol, idle).await
                        }
                        Err(e) => warn!(%peer, error = %e, "tls handshake failed"),
                    },
                    None => serve_stream(stream, peer, ctx, protocol, idle).await,
                }
            });

            reap_tasks(&mut tasks);
        }
    }
}

/// Serve length-framed DNS messages until the peer closes or goes idle
async fn serve_stream<S>(
    stream: S,
    peer: SocketAddr,
    ctx: Arc<ServerContext>,
    protocol: Protocol,
    idle: Duration,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let writer = Arc::new(Mutex::new(writer));

    loop {
        let payload = match timeout(idle, read_message(&mut reader)).await {
            Err(_) => {
                debug!(%peer, "connection idle, closing");
                break;
            }
            Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Ok(Err(e)) => {
                debug!(%peer, error = %e, "tcp read failed");
                break;
            }
            Ok(Ok(None)) => break,
            Ok(Ok(Some(payload))) => payload,
        };

        let ctx = Arc::clone(&ctx);
        let writer = Arc::clone(&writer);
        tokio::spawn(async move {
            if let Some(response) = ctx.handle(payload.into(), peer, protocol).await {
                if let Err(e) = write_message(&writer, &response).await {
                    debug!(%peer, error = %e, "tcp write failed");
                }
            }
        });
    }
}

/// Read one length-prefixed message; `None` on a zero-length frame
async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let len = reader.read_u16().await? as usize;
    if len == 0 || len > MAX_STREAM_MSG {
        return Ok(None);
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

async fn write_message<W: AsyncWrite + Send>(
    writer: &Arc<Mutex<WriteHalf<W>>>,
    response: &[u8],
) -> io::Result<()> {
    let mut writer = writer.lock().await;
    writer.write_u16(response.len() as u16).await?;
    writer.write_all(response).await?;
    writer.flush().await
}

fn build_tcp_listener(addr: SocketAddr) -> io::Result<TokioTcpListener> {
    let sock = Socket::new(
        Domain::for_address(addr),
        Type::STREAM,
        Some(SockProtocol::TCP),
    )?;
    sock.set_nonblocking(true)?;
    sock.set_reuse_address(true)?;
    let _ = sock.set_nodelay(true);
    let _ = sock.set_tcp_keepalive(&TcpKeepalive::new().with_interval(DEFAULT_IDLE_TIMEOUT));
    sock.bind(&addr.into())?;
    sock.listen(1024)?;
    TokioTcpListener::from_std(sock.into())
}
