/*
 * SPDX-FileCopyrightText: 2025 HavenDNS contributors
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Per-query logging
//!
//! Every served query emits one structured event carrying the fields an
//! operator needs to follow a request end to end. The event is emitted at
//! info level on success and warn level when the query ended in an error.

use std::net::IpAddr;
use std::time::Duration;
use tracing::{info, warn};

/// Transport tag of the listener that accepted the query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Udp,
    Tcp,
    Dot,
    Doh,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
            Protocol::Dot => "dot",
            Protocol::Doh => "doh",
        }
    }
}

/// Record of one served query, emitted to the log after the response is sent
#[derive(Debug, Clone)]
pub struct QueryInfo {
    pub peer_ip: IpAddr,
    pub protocol: Protocol,
    pub qtype: String,
    pub qname: String,
    pub query_size: usize,
    pub response_size: usize,
    pub duration: Duration,
    pub profile: String,
    pub from_cache: bool,
    /// Upstream transport label: `h2`, `h3`, `dns53` or `mock`
    pub upstream: String,
    pub client_name: String,
    pub error: Option<String>,
}

impl QueryInfo {
    pub fn emit(&self) {
        match &self.error {
            None => info!(
                peer = %self.peer_ip,
                protocol = self.protocol.as_str(),
                qtype = %self.qtype,
                qname = %self.qname,
                query_size = self.query_size,
                response_size = self.response_size,
                duration_ms = self.duration.as_millis() as u64,
                profile = %self.profile,
                from_cache = self.from_cache,
                upstream = %self.upstream,
                client = %self.client_name,
                "query"
            ),
            Some(err) => warn!(
                peer = %self.peer_ip,
                protocol = self.protocol.as_str(),
                qtype = %self.qtype,
                qname = %self.qname,
                query_size = self.query_size,
                duration_ms = self.duration.as_millis() as u64,
                profile = %self.profile,
                error = %err,
                "query failed"
            ),
        }
    }
}
