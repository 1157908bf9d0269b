/*
 * SPDX-FileCopyrightText: 2025 HavenDNS contributors
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Daemon assembly
//!
//! Wires configuration into the running system: discovery sources,
//! endpoint manager, resolver pipeline, the four listeners, the network
//! watcher and the control socket. Listener binds are retried with
//! doubling backoff for up to a minute so a boot-time start does not lose
//! the race against the network coming up.

use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use url::Url;

use crate::cache::ResponseCache;
use crate::config::{Config, ROUTER_URL};
use crate::core::app_clock::AppClock;
use crate::core::error::{ProxyError, Result};
use crate::core::LogHandle;
use crate::ctl::ControlSocket;
use crate::discovery::arp::ArpTable;
use crate::discovery::dhcp::DhcpSource;
use crate::discovery::hosts::HostsSource;
use crate::discovery::mdns::MdnsSource;
use crate::discovery::rdns::RdnsSource;
use crate::discovery::{Discovery, Source};
use crate::endpoint::manager::Manager;
use crate::endpoint::provider::{Provider, StaticProvider, SystemDnsProvider, UrlProvider};
use crate::endpoint::Endpoint;
use crate::netmon::NetworkWatcher;
use crate::platform;
use crate::resolver::doh::DohClient;
use crate::resolver::Resolver;
use crate::server::doh::DohListener;
use crate::server::tcp::TcpListener;
use crate::server::tls::server_config;
use crate::server::udp::UdpListener;
use crate::server::ServerContext;

const BIND_RETRY_START: Duration = Duration::from_millis(100);
const BIND_RETRY_TOTAL: Duration = Duration::from_secs(60);

/// Run the daemon until it is killed. `config_path` is kept for reloads.
pub async fn run(config_path: PathBuf, config: Config, log: Arc<LogHandle>) -> Result<()> {
    AppClock::start();
    crate::transport::tls::install_default_provider();

    // Discovery stack; order sets lookup precedence
    let arp = ArpTable::new();
    let mdns = MdnsSource::new(None);
    mdns.start();
    let sources: Vec<Arc<dyn Source>> = vec![
        HostsSource::new(),
        mdns,
        DhcpSource::new(),
        RdnsSource::new(),
    ];
    let discovery = Arc::new(Discovery::new(sources));

    let manager = Manager::new(providers(&config)?, config.detect_captive_portals);

    let cache = if config.cache_size > 0 {
        Some(ResponseCache::new(config.cache_size, config.cache_max_ttl))
    } else {
        None
    };
    let doh = DohClient::new(
        Arc::clone(&manager),
        Arc::clone(&discovery),
        config.report_client_info,
        config.timeout,
    );
    let resolver = Arc::new(Resolver::new(
        cache,
        config.profile_matcher(),
        config.forwarder_matcher(),
        Arc::clone(&discovery),
        doh,
        config.bogus_priv,
        config.use_hosts,
        config.timeout,
    ));

    let ctx = Arc::new(ServerContext {
        resolver: Arc::clone(&resolver),
        arp,
        discovery: Arc::clone(&discovery),
        report_client_info: config.report_client_info,
    });

    let ctl = control_socket(&config, &config_path, &resolver, &manager, &log)?;
    {
        let ctl = Arc::clone(&ctl);
        manager.on_change(move |endpoint: &Endpoint| {
            ctl.broadcast("endpoint-changed", json!({ "endpoint": endpoint.label() }));
            #[cfg(feature = "http3")]
            if let Endpoint::Doh(doh) = endpoint {
                let doh = Arc::clone(doh);
                tokio::spawn(async move { try_upgrade_h3(doh).await });
            }
        });
    }

    // Probe in the background; the first query elects lazily if this has
    // not finished yet
    {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.test().await });
    }

    let watcher = NetworkWatcher::new();
    watcher.start();
    {
        let manager = Arc::clone(&manager);
        let mut changes = watcher.subscribe();
        tokio::spawn(async move {
            while changes.recv().await.is_ok() {
                manager.reopen_window();
                manager.test_once().await;
            }
        });
    }

    if config.setup_router {
        warn!("setup-router: no router integration for this platform, ignoring");
    }
    if config.auto_activate {
        if let Err(e) = platform::system_dns().activate() {
            warn!(error = %e, "auto-activate failed");
        }
        tokio::spawn(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                if let Err(e) = platform::system_dns().deactivate() {
                    warn!(error = %e, "auto-deactivate failed");
                }
                std::process::exit(0);
            }
        });
    }

    let mut listeners: JoinSet<()> = JoinSet::new();

    let udp = bind_with_retry("udp", || {
        UdpListener::bind(config.listen, Arc::clone(&ctx), config.max_inflight_udp)
    })
    .await?;
    listeners.spawn(udp.run());

    let tcp = bind_with_retry("tcp", || {
        TcpListener::bind(
            config.listen,
            Arc::clone(&ctx),
            None,
            config.max_tcp_connections,
        )
    })
    .await?;
    listeners.spawn(tcp.run());

    if let Some(addr) = config.listen_dot {
        let tls = server_config(
            config.cert_file.as_deref(),
            config.key_file.as_deref(),
            &[b"dot"],
        )?;
        let dot = bind_with_retry("dot", || {
            TcpListener::bind(
                addr,
                Arc::clone(&ctx),
                Some(tokio_rustls::TlsAcceptor::from(Arc::new(tls.clone()))),
                config.max_tcp_connections,
            )
        })
        .await?;
        listeners.spawn(dot.run());
    }

    if let Some(addr) = config.listen_doh {
        let tls = server_config(
            config.cert_file.as_deref(),
            config.key_file.as_deref(),
            &[b"h2"],
        )?;
        let doh_listener = bind_with_retry("doh", || {
            DohListener::bind(
                addr,
                Arc::clone(&ctx),
                tls.clone(),
                crate::server::doh::DEFAULT_MAX_INFLIGHT,
            )
        })
        .await?;
        listeners.spawn(doh_listener.run());
    }

    info!(listen = %config.listen, "havendns serving");

    // Listener loops never return; one finishing means something is wrong
    while let Some(result) = listeners.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "listener task failed");
        }
    }
    Err(ProxyError::runtime("all listeners exited"))
}

/// Provider chain: steering document, configured hosts, system DNS
fn providers(config: &Config) -> Result<Vec<Arc<dyn Provider>>> {
    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();

    let mut router_url: Url = ROUTER_URL
        .parse()
        .map_err(|_| ProxyError::config("invalid router URL"))?;
    if config.hardened_privacy {
        router_url.set_query(Some("hardened=true"));
    }
    providers.push(Arc::new(UrlProvider::new(router_url, Vec::new())?));

    let static_endpoints = config
        .doh_hosts()
        .iter()
        .map(|host| Endpoint::doh(*host, "/", vec![]))
        .collect();
    providers.push(Arc::new(StaticProvider::new(static_endpoints)));
    providers.push(Arc::new(SystemDnsProvider));
    Ok(providers)
}

fn control_socket(
    config: &Config,
    config_path: &Path,
    resolver: &Arc<Resolver>,
    manager: &Arc<Manager>,
    log: &Arc<LogHandle>,
) -> Result<Arc<ControlSocket>> {
    let mut ctl = ControlSocket::new(config.control_socket.clone());

    {
        let manager = Arc::clone(manager);
        let resolver = Arc::clone(resolver);
        ctl.register("status", move |_| {
            let manager = Arc::clone(&manager);
            let resolver = Arc::clone(&resolver);
            async move {
                json!({
                    "endpoint": manager.active().map(|e| e.label()),
                    "cache_entries": resolver.cache().map(|c| c.entry_count()),
                })
            }
        });
    }

    {
        let resolver = Arc::clone(resolver);
        let config_path = config_path.to_path_buf();
        ctl.register("reload", move |_| {
            let resolver = Arc::clone(&resolver);
            let config_path = config_path.clone();
            async move {
                match Config::load(&config_path) {
                    Ok(fresh) => {
                        resolver.set_rules(fresh.profile_matcher(), fresh.forwarder_matcher());
                        info!("rules reloaded");
                        json!({ "ok": true })
                    }
                    Err(e) => json!({ "error": e.to_string() }),
                }
            }
        });
    }

    {
        let resolver = Arc::clone(resolver);
        ctl.register("cache-stats", move |_| {
            let resolver = Arc::clone(&resolver);
            async move {
                match resolver.cache() {
                    Some(cache) => {
                        let stats = cache.stats();
                        json!({
                            "hits": stats.hits(),
                            "misses": stats.misses(),
                            "inserts": stats.inserts(),
                            "entries": cache.entry_count(),
                            "bytes": cache.weighted_size(),
                        })
                    }
                    None => json!({ "error": "cache disabled" }),
                }
            }
        });
    }

    {
        let log = Arc::clone(log);
        ctl.register("trace", move |_| {
            let log = Arc::clone(&log);
            async move { json!({ "trace": log.toggle_trace() }) }
        });
    }

    let ctl = Arc::new(ctl);
    if let Err(e) = ctl.start() {
        // Serving DNS without a control socket beats not serving at all
        warn!(error = %e, "control socket unavailable");
    }
    Ok(ctl)
}

/// Capability probe: attach an HTTP/3 transport when the endpoint answers
/// a DoH GET over QUIC; on failure the endpoint keeps its HTTP/2 transport
#[cfg(feature = "http3")]
async fn try_upgrade_h3(doh: Arc<crate::endpoint::DohEndpoint>) {
    use crate::transport::h3::H3Transport;
    use crate::transport::{DohRequest, Transport};

    let h3 = Arc::new(H3Transport::new(
        doh.hostname.clone(),
        443,
        doh.bootstrap.clone(),
        doh.fastest_ip,
    ));
    let probe = DohRequest {
        method: http::Method::GET,
        path_and_query: "/?name=probe-test.example.com".to_string(),
        headers: Vec::new(),
        body: bytes::Bytes::new(),
    };
    match h3.round_trip(probe).await {
        Ok(response) if response.status == 200 && crate::dns::is_response(&response.body) => {
            info!(hostname = %doh.hostname, "endpoint upgraded to http/3");
            doh.attach_transport(h3);
        }
        Ok(_) | Err(_) => {}
    }
}

/// Retry `bind` with doubling backoff; gives up after a minute
async fn bind_with_retry<T>(name: &str, mut bind: impl FnMut() -> Result<T>) -> Result<T> {
    let start = AppClock::now();
    let mut delay = BIND_RETRY_START;
    loop {
        match bind() {
            Ok(value) => return Ok(value),
            Err(e) => {
                if start.elapsed() >= BIND_RETRY_TOTAL {
                    return Err(e);
                }
                warn!(listener = name, error = %e, retry_in = ?delay, "bind failed");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(BIND_RETRY_TOTAL);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_retry_returns_first_success() {
        AppClock::start();
        let mut attempts = 0;
        let value = bind_with_retry("test", || {
            attempts += 1;
            if attempts < 3 {
                Err(ProxyError::runtime("not yet"))
            } else {
                Ok(42)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 42);
        assert_eq!(attempts, 3);
    }

    #[test]
    fn provider_chain_shape() {
        let config = Config::default();
        let providers = providers(&config).unwrap();
        let names: Vec<&str> = providers.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["url", "static", "system-dns"]);
    }
}
