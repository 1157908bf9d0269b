/*
 * SPDX-FileCopyrightText: 2025 HavenDNS contributors
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Unified error handling for HavenDNS
//!
//! Provides a centralized error type that can represent every error condition
//! in the proxy. Errors on the query path are converted to SERVFAIL/FORMERR
//! replies at the listener boundary; errors at startup are fatal.

use thiserror::Error;

/// Main error type for HavenDNS
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Query could not be parsed (short header, bad question, bad OPT)
    #[error("malformed query: {0}")]
    Malformed(String),

    /// Configuration validation error
    #[error("configuration error: {0}")]
    Config(String),

    /// Network address parsing error
    #[error("address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    /// Upstream returned a non-200 status
    #[error("upstream error: status {0}")]
    UpstreamStatus(u16),

    /// Upstream could not be reached
    #[error("upstream unreachable: {0}")]
    Upstream(String),

    /// Deadline exceeded while waiting for an upstream response
    #[error("upstream timeout")]
    Timeout,

    /// Upstream body was not a DNS message (captive portal, truncation)
    #[error("bad upstream body: {0}")]
    BadBody(String),

    /// TLS configuration or handshake error
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// HTTP/2 protocol error
    #[error("HTTP/2 error: {0}")]
    H2(#[from] h2::Error),

    /// DNS protocol error from the message codec
    #[error("DNS protocol error: {0}")]
    Proto(#[from] hickory_proto::ProtoError),

    /// Tokio runtime error
    #[error("runtime error: {0}")]
    Runtime(String),

    /// Generic error with custom message
    #[error("{0}")]
    Generic(String),
}

impl ProxyError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        ProxyError::Config(msg.into())
    }

    /// Create a malformed-query error
    pub fn malformed<S: Into<String>>(msg: S) -> Self {
        ProxyError::Malformed(msg.into())
    }

    /// Create an upstream error
    pub fn upstream<S: Into<String>>(msg: S) -> Self {
        ProxyError::Upstream(msg.into())
    }

    /// Create a bad-body error
    pub fn bad_body<S: Into<String>>(msg: S) -> Self {
        ProxyError::BadBody(msg.into())
    }

    /// Create a runtime error
    pub fn runtime<S: Into<String>>(msg: S) -> Self {
        ProxyError::Runtime(msg.into())
    }

    /// True when the error should count toward the endpoint error threshold
    pub fn counts_against_endpoint(&self) -> bool {
        matches!(
            self,
            ProxyError::Upstream(_)
                | ProxyError::UpstreamStatus(_)
                | ProxyError::Timeout
                | ProxyError::BadBody(_)
                | ProxyError::Io(_)
                | ProxyError::H2(_)
        )
    }
}

impl From<String> for ProxyError {
    fn from(s: String) -> Self {
        ProxyError::Generic(s)
    }
}

impl From<&str> for ProxyError {
    fn from(s: &str) -> Self {
        ProxyError::Generic(s.to_string())
    }
}

/// Convenient type alias for Results using ProxyError
pub type Result<T> = std::result::Result<T, ProxyError>;
