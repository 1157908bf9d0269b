/*
 * SPDX-FileCopyrightText: 2025 HavenDNS contributors
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! HTTP/3 transport
//!
//! QUIC dials prefer a previously measured fastest IP when the endpoint
//! recorded one; otherwise the first bootstrap IP is used. Whether an
//! endpoint speaks H3 at all is decided by the endpoint manager's
//! capability probe, not here.

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use futures::future::poll_fn;
use h3::client::SendRequest;
use h3_quinn::OpenStreams;
use http::{Request, Version};
use quinn::crypto::rustls::QuicClientConfig;
use quinn::{ClientConfig, Endpoint, EndpointConfig, TokioRuntime};
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::debug;

use crate::core::error::{ProxyError, Result};
use crate::transport::{tls, DohRequest, DohResponse, Transport};

const CONNECT_DEADLINE: Duration = Duration::from_secs(5);
const STREAM_DEADLINE: Duration = Duration::from_secs(5);

pub struct H3Transport {
    hostname: String,
    port: u16,
    bootstrap: Vec<IpAddr>,
    fastest_ip: Option<IpAddr>,
    sender: Mutex<Option<SendRequest<OpenStreams, Bytes>>>,
}

impl H3Transport {
    pub fn new(
        hostname: String,
        port: u16,
        bootstrap: Vec<IpAddr>,
        fastest_ip: Option<IpAddr>,
    ) -> Self {
        Self {
            hostname,
            port,
            bootstrap,
            fastest_ip,
            sender: Mutex::new(None),
        }
    }

    fn dial_ip(&self) -> Option<IpAddr> {
        self.fastest_ip.or_else(|| self.bootstrap.first().copied())
    }

    async fn sender(&self) -> Result<SendRequest<OpenStreams, Bytes>> {
        let mut guard = self.sender.lock().await;
        if let Some(sender) = guard.as_ref() {
            return Ok(sender.clone());
        }

        let ip = self
            .dial_ip()
            .ok_or_else(|| ProxyError::upstream("no address for QUIC dial"))?;
        let remote = SocketAddr::new(ip, self.port);
        let bind: SocketAddr = if remote.is_ipv4() {
            "0.0.0.0:0".parse().expect("literal address")
        } else {
            "[::]:0".parse().expect("literal address")
        };

        let mut endpoint = Endpoint::new(
            EndpointConfig::default(),
            None,
            UdpSocket::bind(bind)?,
            Arc::new(TokioRuntime),
        )?;
        let quic_config = QuicClientConfig::try_from(tls::h3_client_config())
            .map_err(|e| ProxyError::upstream(format!("quic config: {e}")))?;
        endpoint.set_default_client_config(ClientConfig::new(Arc::new(quic_config)));

        let connecting = endpoint
            .connect(remote, &self.hostname)
            .map_err(|e| ProxyError::upstream(format!("quic connect: {e}")))?;
        let connection = match timeout(CONNECT_DEADLINE, connecting).await {
            Ok(Ok(c)) => c,
            Ok(Err(e)) => return Err(ProxyError::upstream(format!("quic handshake: {e}"))),
            Err(_) => return Err(ProxyError::Timeout),
        };

        let h3_conn = h3_quinn::Connection::new(connection);
        let (mut driver, sender) = h3::client::new(h3_conn)
            .await
            .map_err(|e| ProxyError::upstream(format!("h3 setup: {e}")))?;
        let hostname = self.hostname.clone();
        tokio::spawn(async move {
            let _ = poll_fn(|cx| driver.poll_close(cx)).await;
            debug!(%hostname, "h3 connection closed");
        });

        *guard = Some(sender.clone());
        Ok(sender)
    }

    fn drop_connection(&self) {
        if let Ok(mut guard) = self.sender.try_lock() {
            *guard = None;
        }
    }
}

#[async_trait]
impl Transport for H3Transport {
    fn label(&self) -> &'static str {
        "h3"
    }

    async fn round_trip(&self, req: DohRequest) -> Result<DohResponse> {
        let mut sender = self.sender().await?;

        let uri = format!("https://{}{}", self.hostname, req.path_and_query);
        let mut request = Request::builder()
            .method(req.method)
            .uri(uri)
            .version(Version::HTTP_3);
        for (name, value) in req.headers {
            request = request.header(name, value);
        }
        let request = request
            .body(())
            .map_err(|e| ProxyError::upstream(format!("bad request: {e}")))?;

        let exchange = async {
            let mut stream = sender
                .send_request(request)
                .await
                .map_err(|e| ProxyError::upstream(format!("h3 send: {e}")))?;
            if !req.body.is_empty() {
                stream
                    .send_data(req.body)
                    .await
                    .map_err(|e| ProxyError::upstream(format!("h3 body: {e}")))?;
            }
            stream
                .finish()
                .await
                .map_err(|e| ProxyError::upstream(format!("h3 finish: {e}")))?;

            let response = stream
                .recv_response()
                .await
                .map_err(|e| ProxyError::upstream(format!("h3 response: {e}")))?;
            let status = response.status().as_u16();

            let mut bytes = BytesMut::new();
            while let Some(mut chunk) = stream
                .recv_data()
                .await
                .map_err(|e| ProxyError::upstream(format!("h3 recv: {e}")))?
            {
                let chunk = chunk.copy_to_bytes(chunk.remaining());
                super::collect_body_chunk(&mut bytes, &chunk)?;
            }
            Ok(DohResponse {
                status,
                body: bytes.freeze(),
            })
        };

        match timeout(STREAM_DEADLINE, exchange).await {
            Ok(result) => result,
            Err(_) => {
                self.drop_connection();
                Err(ProxyError::Timeout)
            }
        }
    }
}
