/*
 * SPDX-FileCopyrightText: 2025 HavenDNS contributors
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! TLS client configuration for upstream connections
//!
//! Certificates are validated against the bundled webpki roots; TLS 1.2 is
//! the floor. Each transport gets its own config so its session cache (and
//! therefore TLS resumption) is scoped to one endpoint.

use rustls::client::Resumption;
use rustls::crypto::ring;
use rustls::{ClientConfig, RootCertStore};
use std::sync::{Arc, Once};

static DEFAULT_PROVIDER: Once = Once::new();

pub fn install_default_provider() {
    DEFAULT_PROVIDER.call_once(|| {
        ring::default_provider()
            .install_default()
            .expect("default provider already set elsewhere");
    })
}

lazy_static::lazy_static! {
    static ref ROOT_STORE: Arc<RootCertStore> = {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Arc::new(roots)
    };
}

/// Client config with the given ALPN list and a per-instance session cache
pub fn client_config(alpn: &[&[u8]]) -> ClientConfig {
    install_default_provider();
    let mut config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .expect("ring provider supports the default protocol versions")
        .with_root_certificates(ROOT_STORE.as_ref().clone())
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    config.resumption = Resumption::in_memory_sessions(32);
    config.enable_early_data = true;
    config
}

/// Config for HTTP/2 over TLS
pub fn h2_client_config() -> ClientConfig {
    client_config(&[b"h2"])
}

/// Config for HTTP/3 (QUIC requires TLS 1.3; quinn enforces that)
#[cfg(feature = "http3")]
pub fn h3_client_config() -> ClientConfig {
    client_config(&[b"h3"])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpn_is_set() {
        let config = h2_client_config();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec()]);
    }
}
