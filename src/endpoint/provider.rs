/*
 * SPDX-FileCopyrightText: 2025 HavenDNS contributors
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Endpoint providers
//!
//! Providers are consulted in order by the endpoint manager. The URL
//! provider fetches a JSON list through its own bootstrap transport so
//! that discovering endpoints never depends on DNS already working; the
//! system-DNS provider turns the host's configured resolvers into plain
//! DNS53 fallback endpoints.

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderValue, Method};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use url::Url;

use crate::core::error::{ProxyError, Result};
use crate::endpoint::Endpoint;
use crate::transport::h2::H2Transport;
use crate::transport::{DohRequest, Transport};

/// Hard-coded anycast fallback appended by the system-DNS provider
const ANYCAST_FALLBACK: &str = "1.1.1.1:53";

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch(&self) -> Result<Vec<Endpoint>>;
}

/// Fixed endpoint list from configuration
pub struct StaticProvider {
    endpoints: Vec<Endpoint>,
}

impl StaticProvider {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self { endpoints }
    }
}

#[async_trait]
impl Provider for StaticProvider {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn fetch(&self) -> Result<Vec<Endpoint>> {
        Ok(self.endpoints.clone())
    }
}

#[derive(Deserialize)]
struct EndpointRecord {
    url: String,
    #[serde(default)]
    ips: Vec<IpAddr>,
}

/// Endpoint list fetched from a JSON document
///
/// The document is an array of `{ "url": "https://host/path", "ips":
/// ["1.2.3.4", ...] }` records.
pub struct UrlProvider {
    url: Url,
    transport: Arc<dyn Transport>,
}

impl UrlProvider {
    pub fn new(url: Url, bootstrap: Vec<IpAddr>) -> Result<Self> {
        let hostname = url
            .host_str()
            .ok_or_else(|| ProxyError::config(format!("provider URL has no host: {url}")))?
            .to_string();
        let port = url.port().unwrap_or(443);
        let transport: Arc<dyn Transport> = Arc::new(H2Transport::new(hostname, port, bootstrap));
        Ok(Self { url, transport })
    }

    #[cfg(test)]
    fn with_transport(url: Url, transport: Arc<dyn Transport>) -> Self {
        Self { url, transport }
    }

    fn parse_body(&self, body: &[u8]) -> Result<Vec<Endpoint>> {
        let records: Vec<EndpointRecord> = serde_json::from_slice(body)
            .map_err(|e| ProxyError::bad_body(format!("provider JSON: {e}")))?;
        let mut endpoints = Vec::with_capacity(records.len());
        for record in records {
            let url: Url = record
                .url
                .parse()
                .map_err(|_| ProxyError::bad_body(format!("provider URL: {}", record.url)))?;
            let hostname = url
                .host_str()
                .ok_or_else(|| ProxyError::bad_body("provider URL has no host"))?;
            endpoints.push(Endpoint::doh(hostname, url.path(), record.ips));
        }
        Ok(endpoints)
    }
}

#[async_trait]
impl Provider for UrlProvider {
    fn name(&self) -> &'static str {
        "url"
    }

    async fn fetch(&self) -> Result<Vec<Endpoint>> {
        let mut path_and_query = self.url.path().to_string();
        if let Some(query) = self.url.query() {
            path_and_query.push('?');
            path_and_query.push_str(query);
        }
        let response = self
            .transport
            .round_trip(DohRequest {
                method: Method::GET,
                path_and_query,
                headers: vec![(http::header::ACCEPT, HeaderValue::from_static("application/json"))],
                body: Bytes::new(),
            })
            .await?;
        if response.status != 200 {
            return Err(ProxyError::UpstreamStatus(response.status));
        }
        self.parse_body(&response.body)
    }
}

/// One DNS53 endpoint per configured system resolver, plus the anycast
/// fallback so an empty resolv.conf still yields something dialable
pub struct SystemDnsProvider;

#[async_trait]
impl Provider for SystemDnsProvider {
    fn name(&self) -> &'static str {
        "system-dns"
    }

    async fn fetch(&self) -> Result<Vec<Endpoint>> {
        let mut endpoints: Vec<Endpoint> = crate::transport::dns53::system_resolvers()
            .into_iter()
            .map(|ip| Endpoint::Dns(SocketAddr::new(ip, 53)))
            .collect();
        let fallback: SocketAddr = ANYCAST_FALLBACK.parse().expect("literal address");
        let fallback = Endpoint::Dns(fallback);
        if !endpoints.contains(&fallback) {
            endpoints.push(fallback);
        }
        Ok(endpoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::DohResponse;

    struct FixedTransport {
        status: u16,
        body: &'static str,
    }

    #[async_trait]
    impl Transport for FixedTransport {
        fn label(&self) -> &'static str {
            "mock"
        }

        async fn round_trip(&self, _req: DohRequest) -> Result<DohResponse> {
            Ok(DohResponse {
                status: self.status,
                body: Bytes::from_static(self.body.as_bytes()),
            })
        }
    }

    #[tokio::test]
    async fn url_provider_parses_records() {
        let provider = UrlProvider::with_transport(
            "https://router.example/endpoints".parse().unwrap(),
            Arc::new(FixedTransport {
                status: 200,
                body: r#"[
                    {"url": "https://dns1.example/abc", "ips": ["192.0.2.1", "192.0.2.2"]},
                    {"url": "https://dns2.example/abc"}
                ]"#,
            }),
        );
        let endpoints = provider.fetch().await.unwrap();
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0], Endpoint::doh("dns1.example", "/abc", vec![]));
        match &endpoints[0] {
            Endpoint::Doh(doh) => assert_eq!(doh.bootstrap.len(), 2),
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn url_provider_rejects_bad_status() {
        let provider = UrlProvider::with_transport(
            "https://router.example/endpoints".parse().unwrap(),
            Arc::new(FixedTransport {
                status: 503,
                body: "",
            }),
        );
        assert!(matches!(
            provider.fetch().await,
            Err(ProxyError::UpstreamStatus(503))
        ));
    }

    #[tokio::test]
    async fn system_provider_always_has_fallback() {
        let endpoints = SystemDnsProvider.fetch().await.unwrap();
        assert!(!endpoints.is_empty());
        assert!(endpoints
            .iter()
            .all(|e| matches!(e, Endpoint::Dns(_))));
    }
}
