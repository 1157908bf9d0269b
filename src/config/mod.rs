/*
 * SPDX-FileCopyrightText: 2025 HavenDNS contributors
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Configuration
//!
//! One `<key> <value>` per line, `#` starts a comment, repeatable keys
//! (`config`, `forwarder`) accumulate. Every key doubles as a CLI flag;
//! parse errors name the offending line and stop the daemon before it
//! binds anything.

pub mod file;

use ipnet::IpNet;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::error::{ProxyError, Result};
use crate::dns::MacAddr;
use crate::rules::forwarders::{ForwardTarget, ForwarderMatcher, ForwarderRule};
use crate::rules::profiles::{Condition, ProfileMatcher, ProfileRule};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/havendns.conf";
pub const DEFAULT_CONTROL_SOCKET: &str = "/var/run/havendns.sock";

/// Upstream DoH hosts tried in order when no provider document overrides
/// them
pub const DEFAULT_DOH_HOSTS: &[&str] = &["dns1.havendns.io", "dns2.havendns.io"];
/// Jurisdiction-constrained host set selected by `hardened-privacy`
pub const HARDENED_DOH_HOSTS: &[&str] = &["dns1.eu.havendns.io", "dns2.eu.havendns.io"];
/// Provider document listing currently-steered endpoints
pub const ROUTER_URL: &str = "https://router.havendns.io/";

#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    /// DoT listener address; the listener is off when unset
    pub listen_dot: Option<SocketAddr>,
    /// DoH listener address; the listener is off when unset
    pub listen_doh: Option<SocketAddr>,
    pub profile_rules: Vec<ProfileRule>,
    pub forwarder_rules: Vec<ForwarderRule>,
    pub cache_size: u64,
    pub cache_max_ttl: Option<Duration>,
    pub report_client_info: bool,
    pub detect_captive_portals: bool,
    pub hardened_privacy: bool,
    pub bogus_priv: bool,
    pub use_hosts: bool,
    pub timeout: Duration,
    pub setup_router: bool,
    pub auto_activate: bool,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub control_socket: PathBuf,
    pub max_inflight_udp: usize,
    pub max_tcp_connections: usize,
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:53".parse().expect("literal address"),
            listen_dot: None,
            listen_doh: None,
            profile_rules: Vec::new(),
            forwarder_rules: Vec::new(),
            cache_size: 10 * 1000 * 1000,
            cache_max_ttl: None,
            report_client_info: false,
            detect_captive_portals: false,
            hardened_privacy: false,
            bogus_priv: false,
            use_hosts: true,
            timeout: Duration::from_secs(5),
            setup_router: false,
            auto_activate: false,
            cert_file: None,
            key_file: None,
            control_socket: PathBuf::from(DEFAULT_CONTROL_SOCKET),
            max_inflight_udp: crate::server::udp::DEFAULT_MAX_INFLIGHT,
            max_tcp_connections: crate::server::tcp::DEFAULT_MAX_CONNECTIONS,
            log_file: None,
        }
    }
}

impl Config {
    /// Parse the config file at `path`; a missing file yields defaults
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Self::default();
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(config),
            Err(e) => return Err(e.into()),
        };
        for (lineno, raw) in contents.lines().enumerate() {
            let line = strip_comment(raw).trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once(char::is_whitespace)
                .map(|(k, v)| (k, v.trim()))
                .unwrap_or((line, ""));
            config
                .set(key, value)
                .map_err(|e| ProxyError::config(format!("{}:{}: {e}", path.display(), lineno + 1)))?;
        }
        Ok(config)
    }

    /// Apply one key/value pair (file line or CLI flag)
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "listen" => self.listen = parse_listen(value)?,
            "listen-dot" => self.listen_dot = Some(parse_listen(value)?),
            "listen-doh" => self.listen_doh = Some(parse_listen(value)?),
            "config" => self.profile_rules.push(parse_profile_rule(value)?),
            "forwarder" => self.forwarder_rules.push(parse_forwarder_rule(value)?),
            "cache-size" => self.cache_size = parse_byte_size(value)?,
            "cache-max-ttl" => self.cache_max_ttl = Some(parse_duration(value)?),
            "report-client-info" => self.report_client_info = parse_bool(value)?,
            "detect-captive-portals" => self.detect_captive_portals = parse_bool(value)?,
            "hardened-privacy" => self.hardened_privacy = parse_bool(value)?,
            "bogus-priv" => self.bogus_priv = parse_bool(value)?,
            "use-hosts" => self.use_hosts = parse_bool(value)?,
            "timeout" => self.timeout = parse_duration(value)?,
            "setup-router" => self.setup_router = parse_bool(value)?,
            "auto-activate" => self.auto_activate = parse_bool(value)?,
            "cert-file" => self.cert_file = Some(PathBuf::from(value)),
            "key-file" => self.key_file = Some(PathBuf::from(value)),
            "control" => self.control_socket = PathBuf::from(value),
            "max-inflight-udp" => self.max_inflight_udp = parse_count(value)?,
            "max-tcp-connections" => self.max_tcp_connections = parse_count(value)?,
            "log-file" => self.log_file = Some(PathBuf::from(value)),
            other => return Err(ProxyError::config(format!("unknown key: {other}"))),
        }
        Ok(())
    }

    pub fn profile_matcher(&self) -> ProfileMatcher {
        ProfileMatcher::new(self.profile_rules.iter().cloned())
    }

    pub fn forwarder_matcher(&self) -> ForwarderMatcher {
        ForwarderMatcher::new(self.forwarder_rules.iter().cloned())
    }

    pub fn doh_hosts(&self) -> &'static [&'static str] {
        if self.hardened_privacy {
            HARDENED_DOH_HOSTS
        } else {
            DEFAULT_DOH_HOSTS
        }
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    }
}

/// `:53` means all interfaces; `localhost:53` resolves via the OS
pub fn parse_listen(value: &str) -> Result<SocketAddr> {
    let value = if value.starts_with(':') {
        format!("0.0.0.0{value}")
    } else {
        value.to_string()
    };
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(addr);
    }
    value
        .to_socket_addrs()
        .map_err(|_| ProxyError::config(format!("invalid listen address: {value}")))?
        .next()
        .ok_or_else(|| ProxyError::config(format!("listen address resolves to nothing: {value}")))
}

/// `[<CIDR|MAC>=]<profile-id>`
pub fn parse_profile_rule(value: &str) -> Result<ProfileRule> {
    let (condition, profile_id) = match value.split_once('=') {
        None => (Condition::None, value),
        Some((lhs, profile_id)) => {
            let lhs = lhs.trim();
            let condition = if let Ok(net) = lhs.parse::<IpNet>() {
                Condition::Cidr(net)
            } else if let Ok(ip) = lhs.parse::<IpAddr>() {
                // A bare address is a host prefix
                Condition::Cidr(IpNet::from(ip))
            } else if let Ok(mac) = lhs.parse::<MacAddr>() {
                Condition::Mac(mac)
            } else {
                return Err(ProxyError::config(format!(
                    "profile rule condition is neither CIDR nor MAC: {lhs}"
                )));
            };
            (condition, profile_id.trim())
        }
    };
    if profile_id.is_empty() {
        return Err(ProxyError::config(format!("empty profile id: {value}")));
    }
    Ok(ProfileRule {
        condition,
        profile_id: profile_id.to_string(),
    })
}

/// `[<domain>=]<addr>[,<addr>…]`; port 53 implied
pub fn parse_forwarder_rule(value: &str) -> Result<ForwarderRule> {
    let (domain, addrs) = match value.split_once('=') {
        None => (None, value),
        Some((domain, addrs)) => {
            let mut domain = domain.trim().to_lowercase();
            if !domain.ends_with('.') {
                domain.push('.');
            }
            (Some(domain), addrs)
        }
    };
    let addrs: Vec<SocketAddr> = addrs
        .split(',')
        .map(|addr| {
            let addr = addr.trim();
            addr.parse::<SocketAddr>().or_else(|_| {
                addr.parse::<IpAddr>()
                    .map(|ip| SocketAddr::new(ip, 53))
                    .map_err(|_| ProxyError::config(format!("invalid resolver address: {addr}")))
            })
        })
        .collect::<Result<_>>()?;
    if addrs.is_empty() {
        return Err(ProxyError::config(format!("forwarder has no resolvers: {value}")));
    }
    Ok(ForwarderRule {
        domain,
        target: ForwardTarget { addrs },
    })
}

pub fn parse_bool(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "" | "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        other => Err(ProxyError::config(format!("invalid boolean: {other}"))),
    }
}

/// `100MB`, `512kB`, `1GB` or a plain byte count
pub fn parse_byte_size(value: &str) -> Result<u64> {
    let value = value.trim();
    let (digits, multiplier) = if let Some(rest) = strip_suffix_ci(value, "kb") {
        (rest, 1_000)
    } else if let Some(rest) = strip_suffix_ci(value, "mb") {
        (rest, 1_000_000)
    } else if let Some(rest) = strip_suffix_ci(value, "gb") {
        (rest, 1_000_000_000)
    } else {
        (value, 1)
    };
    let count: u64 = digits
        .trim()
        .parse()
        .map_err(|_| ProxyError::config(format!("invalid byte size: {value}")))?;
    Ok(count * multiplier)
}

fn strip_suffix_ci<'a>(value: &'a str, suffix: &str) -> Option<&'a str> {
    if value.len() >= suffix.len()
        && value[value.len() - suffix.len()..].eq_ignore_ascii_case(suffix)
    {
        Some(&value[..value.len() - suffix.len()])
    } else {
        None
    }
}

/// `5s`, `300ms`, `10m`, `2h` or plain seconds
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    let (digits, unit): (&str, fn(u64) -> Duration) = if let Some(rest) = value.strip_suffix("ms")
    {
        (rest, Duration::from_millis)
    } else if let Some(rest) = value.strip_suffix('s') {
        (rest, Duration::from_secs)
    } else if let Some(rest) = value.strip_suffix('m') {
        (rest, |n| Duration::from_secs(n * 60))
    } else if let Some(rest) = value.strip_suffix('h') {
        (rest, |n| Duration::from_secs(n * 3600))
    } else {
        (value, Duration::from_secs)
    };
    let count: u64 = digits
        .trim()
        .parse()
        .map_err(|_| ProxyError::config(format!("invalid duration: {value}")))?;
    Ok(unit(count))
}

fn parse_count(value: &str) -> Result<usize> {
    value
        .trim()
        .parse()
        .map_err(|_| ProxyError::config(format!("invalid count: {value}")))
}
