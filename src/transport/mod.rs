/*
 * SPDX-FileCopyrightText: 2025 HavenDNS contributors
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Upstream transports
//!
//! One transport instance serves one endpoint and owns its connection
//! state; dropping the transport releases the connections. HTTP requests
//! are expressed protocol-neutrally so the DoH client does not care
//! whether they ride HTTP/2 or HTTP/3.

pub mod dial;
pub mod dns53;
pub mod h2;
#[cfg(feature = "http3")]
pub mod h3;
pub mod tls;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::{HeaderName, HeaderValue, Method};

use crate::core::error::{ProxyError, Result};

/// Largest accepted upstream body (the largest possible DNS message)
pub const MAX_BODY: usize = 65_535;

/// Collect a body chunk, refusing bodies larger than [`MAX_BODY`]
///
/// An oversized body is an error, never a silent prefix: a truncated
/// message that happens to parse could end up in the cache.
pub(crate) fn collect_body_chunk(body: &mut BytesMut, chunk: &[u8]) -> Result<()> {
    if body.len() + chunk.len() > MAX_BODY {
        return Err(ProxyError::bad_body("upstream body exceeds 65535 bytes"));
    }
    body.extend_from_slice(chunk);
    Ok(())
}

/// A protocol-neutral DoH request
///
/// `path_and_query` is the URL path (plus query for GET); the authority is
/// always the endpoint hostname, regardless of which bootstrap IP the
/// connection was dialed to.
pub struct DohRequest {
    pub method: Method,
    pub path_and_query: String,
    pub headers: Vec<(HeaderName, HeaderValue)>,
    pub body: Bytes,
}

pub struct DohResponse {
    pub status: u16,
    pub body: Bytes,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Short label for logs (`h2`, `h3`, `dns53`, `mock`)
    fn label(&self) -> &'static str;

    async fn round_trip(&self, req: DohRequest) -> Result<DohResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_body_is_an_error() {
        let mut body = BytesMut::new();
        assert!(collect_body_chunk(&mut body, &vec![0u8; MAX_BODY]).is_ok());
        assert_eq!(body.len(), MAX_BODY);
        assert!(collect_body_chunk(&mut body, &[0u8]).is_err());
    }
}
