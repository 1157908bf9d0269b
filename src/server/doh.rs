/*
 * SPDX-FileCopyrightText: 2025 HavenDNS contributors
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! DoH listener (RFC 8484 server side)
//!
//! HTTP/2 over TLS on `/dns-query`: POST bodies carry the raw query, GET
//! carries it in the `dns` parameter as unpadded base64url. Requests are
//! multiplexed, so each one runs in its own task; overload is signalled
//! with 429 rather than by closing the connection.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use super::udp::reap_tasks;
use super::{ServerContext, MAX_STREAM_MSG};
use crate::core::error::Result;
use crate::core::log::Protocol;
use crate::resolver::doh::CONTENT_TYPE_DNS;

pub const DEFAULT_MAX_INFLIGHT: usize = 512;

const QUERY_PATH: &str = "/dns-query";

pub struct DohListener {
    listener: tokio::net::TcpListener,
    ctx: Arc<ServerContext>,
    acceptor: TlsAcceptor,
    inflight: Arc<Semaphore>,
}

impl DohListener {
    pub fn bind(
        addr: SocketAddr,
        ctx: Arc<ServerContext>,
        tls_config: rustls::ServerConfig,
        max_inflight: usize,
    ) -> Result<Self> {
        let std_listener = std::net::TcpListener::bind(addr)?;
        std_listener.set_nonblocking(true)?;
        let listener = tokio::net::TcpListener::from_std(std_listener)?;
        info!(%addr, "doh listener bound");
        Ok(Self {
            listener,
            ctx,
            acceptor: TlsAcceptor::from(Arc::new(tls_config)),
            inflight: Arc::new(Semaphore::new(max_inflight)),
        })
    }

    pub async fn run(self) {
        let mut tasks: JoinSet<()> = JoinSet::new();
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(r) => r,
                Err(e) => {
                    debug!(error = %e, "doh accept failed");
                    continue;
                }
            };
            let ctx = Arc::clone(&self.ctx);
            let acceptor = self.acceptor.clone();
            let inflight = Arc::clone(&self.inflight);
            tasks.spawn(async move {
                serve_connection(stream, peer, ctx, acceptor, inflight).await;
            });
            reap_tasks(&mut tasks);
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<ServerContext>,
    acceptor: TlsAcceptor,
    inflight: Arc<Semaphore>,
) {
    let _ = stream.set_nodelay(true);
    let tls_stream = match acceptor.accept(stream).await {
        Ok(s) => s,
        Err(e) => {
            warn!(%peer, error = %e, "tls handshake failed");
            return;
        }
    };
    let mut connection = match h2::server::handshake(tls_stream).await {
        Ok(c) => c,
        Err(e) => {
            warn!(%peer, error = %e, "h2 handshake failed");
            return;
        }
    };

    loop {
        let (request, mut respond) = match connection.accept().await {
            Some(Ok(next)) => next,
            Some(Err(e)) => {
                debug!(%peer, error = %e, "h2 request error");
                return;
            }
            None => return,
        };

        let permit = match Arc::clone(&inflight).try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                send_status(&mut respond, StatusCode::TOO_MANY_REQUESTS);
                continue;
            }
        };

        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            let _permit = permit;
            let response = handle_request(request, peer, &ctx).await;
            let (head, body) = match response {
                Ok(r) => {
                    let (parts, body) = r.into_parts();
                    (Response::from_parts(parts, ()), body)
                }
                Err(status) => {
                    send_status(&mut respond, status);
                    return;
                }
            };
            match respond.send_response(head, false) {
                Ok(mut stream) => {
                    if let Err(e) = stream.send_data(body, true) {
                        debug!(%peer, error = %e, "h2 body send failed");
                    }
                }
                Err(e) => debug!(%peer, error = %e, "h2 response send failed"),
            }
        });
    }
}

fn send_status(respond: &mut h2::server::SendResponse<Bytes>, status: StatusCode) {
    if let Ok(response) = Response::builder().status(status).body(()) {
        let _ = respond.send_response(response, true);
    }
}

/// Decode the query payload per method, resolve it and wrap the answer
async fn handle_request(
    request: Request<h2::RecvStream>,
    peer: SocketAddr,
    ctx: &ServerContext,
) -> std::result::Result<Response<Bytes>, StatusCode> {
    if request.uri().path() != QUERY_PATH {
        return Err(StatusCode::NOT_FOUND);
    }

    let method = request.method().clone();
    let payload = if method == Method::GET {
        let encoded = request
            .uri()
            .query()
            .and_then(dns_param)
            .ok_or(StatusCode::BAD_REQUEST)?;
        Bytes::from(
            URL_SAFE_NO_PAD
                .decode(encoded)
                .map_err(|_| StatusCode::BAD_REQUEST)?,
        )
    } else if method == Method::POST {
        let content_type = request
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if content_type != CONTENT_TYPE_DNS {
            return Err(StatusCode::UNSUPPORTED_MEDIA_TYPE);
        }
        read_body(request.into_body()).await?
    } else {
        return Err(StatusCode::METHOD_NOT_ALLOWED);
    };
    if payload.len() < 12 {
        return Err(StatusCode::BAD_REQUEST);
    }

    let answer = ctx
        .handle(payload, peer, Protocol::Doh)
        .await
        .ok_or(StatusCode::BAD_REQUEST)?;

    Response::builder()
        .status(StatusCode::OK)
        .header(http::header::CONTENT_TYPE, CONTENT_TYPE_DNS)
        .header(http::header::CONTENT_LENGTH, answer.len())
        .body(Bytes::from(answer))
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

async fn read_body(mut body: h2::RecvStream) -> std::result::Result<Bytes, StatusCode> {
    let mut collected = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(|_| StatusCode::BAD_REQUEST)?;
        if collected.len() + chunk.len() > MAX_STREAM_MSG {
            return Err(StatusCode::PAYLOAD_TOO_LARGE);
        }
        collected.extend_from_slice(&chunk);
        let _ = body.flow_control().release_capacity(chunk.len());
    }
    Ok(Bytes::from(collected))
}

/// Pull the `dns` parameter out of a query string
fn dns_param(query: &str) -> Option<&str> {
    query.split('&').find_map(|pair| pair.strip_prefix("dns="))
}
