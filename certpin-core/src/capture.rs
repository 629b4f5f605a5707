//! Fetches the certificate a server presents, for use as a pin.

use crate::error::ProxyError;
use crate::tls::{UpstreamTls, server_name};
use crate::upstream::UpstreamConnector;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use certpin_config::split_host_port;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::info;

const PEM_LINE_WIDTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CertificateFormat {
    #[default]
    Pem,
    Der,
}

impl CertificateFormat {
    pub fn encode(self, der: &[u8]) -> Vec<u8> {
        match self {
            CertificateFormat::Pem => encode_pem(der).into_bytes(),
            CertificateFormat::Der => der.to_vec(),
        }
    }
}

/// Handshakes with `address` without any validation and returns the DER
/// of the leaf certificate it presented.
///
/// The name sent in the handshake defaults to the host part of `address`.
pub async fn capture_certificate(
    address: &str,
    server_name_override: Option<&str>,
    limit: Option<Duration>,
) -> Result<Vec<u8>, ProxyError> {
    let host = match server_name_override {
        Some(name) => name,
        None => split_host_port(address)
            .map(|(host, _)| host)
            .ok_or_else(|| ProxyError::Config(format!("invalid address {:?}", address)))?,
    };

    let connector = UpstreamConnector::new(UpstreamTls::insecure()?)
        .with_connect_timeout(limit)
        .with_handshake_timeout(limit);
    let mut stream = connector.connect(address, server_name(host)?, None).await?;

    let leaf = stream
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|chain| chain.first())
        .map(|leaf| leaf.as_ref().to_vec());
    let _ = stream.shutdown().await;

    let der = leaf.ok_or_else(|| {
        ProxyError::Certificate(format!("{} presented no certificate", address))
    })?;
    info!(
        upstream = address,
        server_name = host,
        fingerprint = %crate::pin::fingerprint(&der),
        "Captured certificate"
    );
    Ok(der)
}

/// Wraps DER bytes in a `CERTIFICATE` PEM block.
pub fn encode_pem(der: &[u8]) -> String {
    let body = STANDARD.encode(der);
    let mut pem = String::with_capacity(body.len() + body.len() / PEM_LINE_WIDTH + 64);
    pem.push_str("-----BEGIN CERTIFICATE-----\n");
    for line in body.as_bytes().chunks(PEM_LINE_WIDTH) {
        // base64 output is ASCII
        pem.push_str(std::str::from_utf8(line).unwrap_or_default());
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    pem
}
