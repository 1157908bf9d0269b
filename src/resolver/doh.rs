/*
 * SPDX-FileCopyrightText: 2025 HavenDNS contributors
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! DoH upstream client
//!
//! Sends the client's exact query bytes as a POST to the active endpoint,
//! with the profile id appended to the endpoint path and, when enabled,
//! identity headers derived from local discovery. When the manager hands
//! back a DNS53 fallback endpoint the same query is exchanged as plain
//! DNS instead.

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::Method;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use crate::core::error::{ProxyError, Result};
use crate::discovery::Discovery;
use crate::dns::{is_response, Query};
use crate::endpoint::manager::Manager;
use crate::endpoint::Endpoint;
use crate::transport::{dns53, DohRequest};

pub const CONTENT_TYPE_DNS: &str = "application/dns-message";

/// Outcome metadata for the query log
pub struct ResolveInfo {
    pub profile: String,
    pub from_cache: bool,
    pub upstream: &'static str,
}

pub struct DohClient {
    manager: Arc<Manager>,
    discovery: Arc<Discovery>,
    report_client_info: bool,
    timeout: Duration,
}

impl DohClient {
    pub fn new(
        manager: Arc<Manager>,
        discovery: Arc<Discovery>,
        report_client_info: bool,
        timeout: Duration,
    ) -> Self {
        Self {
            manager,
            discovery,
            report_client_info,
            timeout,
        }
    }

    /// URL context for cache keying: the full DoH URL including profile
    pub fn cache_context(&self, profile: &str) -> String {
        match self.manager.active() {
            Some(Endpoint::Doh(doh)) => {
                format!("https://{}{}", doh.hostname, join_path(&doh.path, profile))
            }
            Some(Endpoint::Dns(addr)) => format!("dns://{addr}"),
            None => String::new(),
        }
    }

    /// Forward `query` upstream and return the full response body; the
    /// listener truncates to the client's advertised size after caching.
    pub async fn resolve(&self, query: &Query, profile: &str) -> Result<(Vec<u8>, ResolveInfo)> {
        let mut headers: Vec<(HeaderName, HeaderValue)> = vec![(
            CONTENT_TYPE,
            HeaderValue::from_static(CONTENT_TYPE_DNS),
        )];
        if self.report_client_info {
            let info = self
                .discovery
                .client_info(query.peer_ip, query.peer_mac)
                .await;
            for (name, value) in [
                ("x-device-id", info.id),
                ("x-device-ip", info.ip),
                ("x-device-model", info.model),
                ("x-device-name", info.name),
            ] {
                if value.is_empty() {
                    continue;
                }
                if let Ok(value) = HeaderValue::from_str(&value) {
                    headers.push((HeaderName::from_static(name), value));
                }
            }
        }

        let payload = query.payload.clone();
        let deadline = self.timeout;
        let profile_owned = profile.to_string();
        let result = self
            .manager
            .with_active(move |endpoint| async move {
                match endpoint {
                    Endpoint::Doh(doh) => {
                        let request = DohRequest {
                            method: Method::POST,
                            path_and_query: join_path(&doh.path, &profile_owned),
                            headers,
                            body: payload,
                        };
                        let transport = doh.transport();
                        let response = match timeout(deadline, transport.round_trip(request)).await
                        {
                            Ok(r) => r?,
                            Err(_) => return Err(ProxyError::Timeout),
                        };
                        if response.status != 200 {
                            return Err(ProxyError::UpstreamStatus(response.status));
                        }
                        if !is_response(&response.body) {
                            return Err(ProxyError::bad_body("upstream body is not DNS"));
                        }
                        Ok((response.body, transport.label()))
                    }
                    Endpoint::Dns(addr) => {
                        let reply = dns53::exchange(addr, &payload, deadline).await?;
                        Ok((Bytes::from(reply), "dns53"))
                    }
                }
            })
            .await?;

        let (body, label) = result;
        let mut bytes = body.to_vec();
        // Normalize the id so the client always sees its own
        if bytes.len() >= 2 {
            bytes[0..2].copy_from_slice(&query.id.to_be_bytes());
        }

        Ok((
            bytes,
            ResolveInfo {
                profile: profile.to_string(),
                from_cache: false,
                upstream: label,
            },
        ))
    }
}

/// Append a profile id to the endpoint's base path
pub fn join_path(base: &str, profile: &str) -> String {
    if profile.is_empty() {
        return base.to_string();
    }
    if base.ends_with('/') {
        format!("{base}{profile}")
    } else {
        format!("{base}/{profile}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_joining() {
        assert_eq!(join_path("/", "abc123"), "/abc123");
        assert_eq!(join_path("/base", "abc123"), "/base/abc123");
        assert_eq!(join_path("/base/", "abc123"), "/base/abc123");
        assert_eq!(join_path("/", ""), "/");
        assert_eq!(join_path("/base", ""), "/base");
    }
}
