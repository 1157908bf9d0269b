/*
 * SPDX-FileCopyrightText: 2025 HavenDNS contributors
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! HTTP/2 transport
//!
//! Holds one multiplexed connection per endpoint, established lazily and
//! re-established after failure. Every send is wrapped in a 5 s write
//! deadline; a stuck write closes the connection instead of leaking a
//! stream that never completes.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use h2::client::SendRequest;
use http::{Request, Version};
use rustls::pki_types::ServerName;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::core::error::{ProxyError, Result};
use crate::transport::{dial, tls, DohRequest, DohResponse, Transport};

const WRITE_DEADLINE: Duration = Duration::from_secs(5);
const CONNECT_DEADLINE: Duration = Duration::from_secs(5);

pub struct H2Transport {
    hostname: String,
    port: u16,
    bootstrap: Vec<IpAddr>,
    sender: Mutex<Option<SendRequest<Bytes>>>,
}

impl H2Transport {
    pub fn new(hostname: String, port: u16, bootstrap: Vec<IpAddr>) -> Self {
        Self {
            hostname,
            port,
            bootstrap,
            sender: Mutex::new(None),
        }
    }

    /// Reuse the live connection or establish a fresh one
    async fn sender(&self) -> Result<SendRequest<Bytes>> {
        let mut guard = self.sender.lock().await;
        if let Some(sender) = guard.as_ref() {
            // ready() fails fast when the connection died underneath us
            if let Ok(ready) = sender.clone().ready().await {
                return Ok(ready);
            }
            *guard = None;
        }

        let stream = dial::dial_endpoint(
            &self.hostname,
            self.port,
            &self.bootstrap,
            CONNECT_DEADLINE,
        )
        .await?;

        // SNI is the endpoint hostname, never the bootstrap IP
        let connector = TlsConnector::from(Arc::new(tls::h2_client_config()));
        let server_name = ServerName::try_from(self.hostname.clone())
            .map_err(|_| ProxyError::upstream(format!("invalid server name {}", self.hostname)))?;
        let tls_stream = match timeout(CONNECT_DEADLINE, connector.connect(server_name, stream)).await
        {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(ProxyError::upstream(format!("TLS handshake: {e}"))),
            Err(_) => return Err(ProxyError::Timeout),
        };

        let (sender, connection) = h2::client::Builder::new().handshake(tls_stream).await?;
        let hostname = self.hostname.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(%hostname, error = %e, "h2 connection closed");
            }
        });

        let sender = sender.ready().await?;
        *guard = Some(sender.clone());
        debug!(hostname = %self.hostname, "h2 connection established");
        Ok(sender)
    }

    fn drop_connection(&self) {
        if let Ok(mut guard) = self.sender.try_lock() {
            *guard = None;
        }
    }
}

#[async_trait]
impl Transport for H2Transport {
    fn label(&self) -> &'static str {
        "h2"
    }

    async fn round_trip(&self, req: DohRequest) -> Result<DohResponse> {
        let mut sender = self.sender().await?;

        let uri = format!("https://{}{}", self.hostname, req.path_and_query);
        let mut request = Request::builder()
            .method(req.method)
            .uri(uri)
            .version(Version::HTTP_2);
        for (name, value) in req.headers {
            request = request.header(name, value);
        }
        let request = request
            .body(())
            .map_err(|e| ProxyError::upstream(format!("bad request: {e}")))?;

        let has_body = !req.body.is_empty();
        let (response, mut send_stream) = sender.send_request(request, !has_body)?;
        if has_body {
            if let Err(e) = send_stream.send_data(req.body, true) {
                self.drop_connection();
                return Err(ProxyError::H2(e));
            }
        }

        // A stream the peer never answers would otherwise pin the
        // connection; close it and let the next request redial.
        let response = match timeout(WRITE_DEADLINE, response).await {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => {
                self.drop_connection();
                return Err(ProxyError::H2(e));
            }
            Err(_) => {
                warn!(hostname = %self.hostname, "h2 stream deadline exceeded");
                self.drop_connection();
                return Err(ProxyError::Timeout);
            }
        };
        let status = response.status().as_u16();
        let mut body = response.into_body();
        let mut bytes = BytesMut::new();
        while let Some(chunk) = body.data().await {
            let chunk = chunk?;
            let _ = body.flow_control().release_capacity(chunk.len());
            super::collect_body_chunk(&mut bytes, &chunk)?;
        }

        Ok(DohResponse {
            status,
            body: bytes.freeze(),
        })
    }
}
