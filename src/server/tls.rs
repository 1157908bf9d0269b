/*
 * SPDX-FileCopyrightText: 2025 HavenDNS contributors
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Server-side TLS for the DoT and DoH listeners
//!
//! Certificates come from configured PEM files when present; otherwise a
//! self-signed P-256 certificate is generated at startup with SANs for
//! localhost, the machine's hostname and its non-loopback addresses, valid
//! for one year. Clients on the LAN are expected to pin or trust it out of
//! band.

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use std::fs::File;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::Path;
use tracing::info;

use crate::core::error::{ProxyError, Result};
use crate::transport::tls::install_default_provider;

/// Build the shared listener TLS config. `alpn` is `[b"dot"]` for DoT and
/// `[b"h2"]` for the DoH listener.
pub fn server_config(
    cert: Option<&Path>,
    key: Option<&Path>,
    alpn: &[&[u8]],
) -> Result<ServerConfig> {
    install_default_provider();
    let (certs, private_key) = match (cert, key) {
        (Some(cert), Some(key)) => load_pem(cert, key)?,
        (None, None) => self_signed()?,
        _ => {
            return Err(ProxyError::config(
                "cert and key must be configured together",
            ))
        }
    };
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, private_key)?;
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(config)
}

fn load_pem(
    cert_path: &Path,
    key_path: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    info!(cert = %cert_path.display(), key = %key_path.display(), "loading tls certificate");
    let mut cert_reader = BufReader::new(File::open(cert_path)?);
    let certs: Vec<CertificateDer> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::config(format!("parse {}: {e}", cert_path.display())))?;
    if certs.is_empty() {
        return Err(ProxyError::config(format!(
            "no certificates in {}",
            cert_path.display()
        )));
    }

    let mut key_reader = BufReader::new(File::open(key_path)?);
    let private_key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| ProxyError::config(format!("parse {}: {e}", key_path.display())))?
        .ok_or_else(|| {
            ProxyError::config(format!("no private key in {}", key_path.display()))
        })?;
    Ok((certs, private_key))
}

fn self_signed() -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let key_pair =
        KeyPair::generate().map_err(|e| ProxyError::config(format!("generate key: {e}")))?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "havendns");
    params.distinguished_name = dn;
    params.not_before = time::OffsetDateTime::now_utc();
    params.not_after = params.not_before + time::Duration::days(365);
    params.subject_alt_names = san_list()?;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| ProxyError::config(format!("self-sign certificate: {e}")))?;
    info!("generated self-signed tls certificate");

    let key = PrivatePkcs8KeyDer::from(key_pair.serialize_der());
    Ok((vec![cert.der().clone()], PrivateKeyDer::from(key)))
}

/// localhost, hostname and every non-loopback address of an up interface
fn san_list() -> Result<Vec<SanType>> {
    let mut sans = vec![dns_san("localhost")?];
    if let Some(hostname) = local_hostname() {
        if hostname != "localhost" {
            sans.push(dns_san(&hostname)?);
        }
    }
    for iface in netdev::get_interfaces() {
        if iface.is_loopback() || !iface.is_up() {
            continue;
        }
        for net in &iface.ipv4 {
            sans.push(SanType::IpAddress(IpAddr::V4(net.addr())));
        }
        for net in &iface.ipv6 {
            let addr = net.addr();
            if !addr.is_loopback() {
                sans.push(SanType::IpAddress(IpAddr::V6(addr)));
            }
        }
    }
    Ok(sans)
}

fn dns_san(name: &str) -> Result<SanType> {
    let ia5 = name
        .try_into()
        .map_err(|_| ProxyError::config(format!("hostname not usable in certificate: {name}")))?;
    Ok(SanType::DnsName(ia5))
}

fn local_hostname() -> Option<String> {
    let raw = std::fs::read_to_string("/etc/hostname").ok()?;
    let name = raw.trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_signed_builds_config() {
        let config = server_config(None, None, &[b"h2"]).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec()]);
    }

    #[test]
    fn mismatched_cert_key_rejected() {
        assert!(server_config(Some(Path::new("/tmp/cert.pem")), None, &[]).is_err());
    }

    #[test]
    fn pem_files_load() {
        use std::io::Write;
        let key_pair = KeyPair::generate().unwrap();
        let cert = CertificateParams::default().self_signed(&key_pair).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        File::create(&cert_path)
            .unwrap()
            .write_all(cert.pem().as_bytes())
            .unwrap();
        File::create(&key_path)
            .unwrap()
            .write_all(key_pair.serialize_pem().as_bytes())
            .unwrap();

        let config = server_config(Some(&cert_path), Some(&key_path), &[b"dot"]).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"dot".to_vec()]);
    }
}
